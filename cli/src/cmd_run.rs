//! `chainrelay run` — one scanner task per configured contract plus the
//! consumer, all stopped by one cancellation token.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chainrelay_bus::connect_bus;
use chainrelay_core::bus::Subscription;
use chainrelay_core::config::RelayConfig;
use chainrelay_core::consumer::{
    ConsumerConfig, MemoryEventStore, MessageConsumer, Persistence, UpsertHandler, UpsertSession,
};
use chainrelay_core::error::RelayError;
use chainrelay_core::metrics::RelayMetrics;
use chainrelay_core::outbound::OutboundLedger;
use chainrelay_core::publisher::EventPublisher;
use chainrelay_core::registry::{KnownEntityRegistry, RegistryStore};
use chainrelay_core::source::SourceLeases;
use chainrelay_evm::{EvmFetcher, HttpRpcClient, LogNormalizer, RetryPolicy, ScannerBuilder};
use chainrelay_storage::{open_stores, FileRegistryStore};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

type Tasks = JoinSet<(String, Result<(), RelayError>)>;

pub async fn run(config: RelayConfig) -> Result<()> {
    config.validate()?;
    let metrics = Arc::new(RelayMetrics::new());
    let cancel = CancellationToken::new();

    let stores = open_stores(config.checkpoint_store, &config.checkpoint_store_url).await?;
    let bus = connect_bus(&config.pubsub, config.publish_timeout())?;
    let publisher = Arc::new(EventPublisher::new(
        bus.bus.clone(),
        config.publish_timeout(),
        metrics.clone(),
    ));

    // Requests recorded by `outbound send` that never reached the bus.
    let ledger = OutboundLedger::new(stores.outbound.clone());
    let (sent, failed) = ledger.dispatch_pending(&publisher).await?;
    if sent + failed > 0 {
        info!(sent, failed, "pending outbound messages dispatched");
    }

    let rpc = HttpRpcClient::new(config.rpc_url.clone(), RPC_TIMEOUT)
        .map_err(RelayError::from)
        .context("building RPC client")?;
    let fetcher = EvmFetcher::new(Arc::new(rpc), RetryPolicy::default(), config.page_blocks);
    let normalizer = Arc::new(LogNormalizer::from_config(
        config.chain_id,
        &config.event_names,
        &config.discovery_events,
    )?);
    let registry = Arc::new(KnownEntityRegistry::new());
    let registry_store = config
        .registry_path
        .as_ref()
        .map(|path| Arc::new(FileRegistryStore::new(path)) as Arc<dyn RegistryStore>);
    let leases = SourceLeases::new();

    let mut tasks: Tasks = JoinSet::new();
    for source in config.sources() {
        let mut builder = ScannerBuilder::new(source.clone())
            .settings_from(&config)
            .fetcher(fetcher.clone())
            .normalizer(normalizer.clone())
            .publisher(publisher.clone())
            .checkpoint_store(stores.checkpoints.clone())
            .registry(registry.clone())
            .leases(leases.clone())
            .metrics(metrics.clone());
        if let Some(store) = &registry_store {
            builder = builder.registry_store(store.clone());
        }
        let mut scanner = builder.build()?;
        let cancel = cancel.clone();
        let name = format!("scanner {}", source.key());
        tasks.spawn(async move { (name, scanner.run(cancel).await) });
    }

    let consumer_config = ConsumerConfig {
        max_in_flight: config.max_in_flight,
        ..Default::default()
    };
    match bus.subscription.clone() {
        Some(subscription) => match stores.sqlite.clone() {
            Some(sqlite) => spawn_consumer(&mut tasks, subscription, Arc::new(sqlite), &metrics, consumer_config, &cancel),
            None => {
                warn!("file store selected, consumed events are kept in memory only");
                spawn_consumer(
                    &mut tasks,
                    subscription,
                    Arc::new(MemoryEventStore::new()),
                    &metrics,
                    consumer_config,
                    &cancel,
                )
            }
        },
        None => info!("no subscription configured, consumer disabled"),
    }

    info!(
        sources = config.contracts.len(),
        bus = bus.name(),
        store = %config.checkpoint_store,
        "relay started"
    );
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => info!(task = %name, "task stopped"),
            Ok((name, Err(e))) => {
                error!(task = %name, error = %e, "task failed, stopping relay");
                cancel.cancel();
                first_error.get_or_insert_with(|| anyhow::Error::new(e).context(name));
            }
            Err(e) => {
                error!(error = %e, "task panicked, stopping relay");
                cancel.cancel();
                first_error.get_or_insert_with(|| anyhow::anyhow!("task panicked: {e}"));
            }
        }
    }

    if let Err(e) = bus.bus.close().await {
        warn!(error = %e, "closing bus failed");
    }
    if let Err(e) = stores.checkpoints.close().await {
        warn!(error = %e, "closing checkpoint store failed");
    }
    info!(metrics = ?metrics.snapshot(), "relay stopped");

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn spawn_consumer<P>(
    tasks: &mut Tasks,
    subscription: Arc<dyn Subscription>,
    persistence: Arc<P>,
    metrics: &Arc<RelayMetrics>,
    config: ConsumerConfig,
    cancel: &CancellationToken,
) where
    P: Persistence,
    P::Session: UpsertSession,
{
    let consumer = MessageConsumer::new(subscription, persistence, Arc::new(UpsertHandler), metrics.clone(), config);
    let cancel = cancel.clone();
    tasks.spawn(async move { ("consumer".to_string(), consumer.run(cancel).await) });
}

/// Cancel `cancel` on Ctrl-C or SIGTERM.
async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}
