//! `chainrelay retry <message-id>` — operator retry of a failed outbound
//! message. Prints the decision as JSON.

use std::sync::Arc;

use anyhow::{Context, Result};

use chainrelay_bus::connect_bus;
use chainrelay_core::config::RelayConfig;
use chainrelay_core::metrics::RelayMetrics;
use chainrelay_core::outbound::OutboundLedger;
use chainrelay_core::publisher::EventPublisher;
use chainrelay_core::retry::RetryCoordinator;
use chainrelay_storage::open_stores;

pub async fn run(config: &RelayConfig, message_id: &str) -> Result<()> {
    let stores = open_stores(config.checkpoint_store, &config.checkpoint_store_url).await?;
    let handle = connect_bus(&config.pubsub, config.publish_timeout())?;
    let metrics = Arc::new(RelayMetrics::new());
    let publisher = Arc::new(EventPublisher::new(handle.bus, config.publish_timeout(), metrics.clone()));
    let coordinator = RetryCoordinator::new(OutboundLedger::new(stores.outbound), publisher, metrics);

    let decision = coordinator
        .retry(message_id)
        .await
        .with_context(|| format!("retry of {message_id} failed"))?;
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}
