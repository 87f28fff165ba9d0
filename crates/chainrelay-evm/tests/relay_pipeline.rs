//! End-to-end scanner → bus → consumer tests against an in-memory chain.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use chainrelay_core::bus::{InMemoryBus, PublishFault, Subscription};
use chainrelay_core::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use chainrelay_core::consumer::{ConsumerConfig, MemoryEventStore, MessageConsumer, Outcome, UpsertHandler};
use chainrelay_core::error::RelayError;
use chainrelay_core::metrics::RelayMetrics;
use chainrelay_core::publisher::EventPublisher;
use chainrelay_core::registry::{KnownEntityRegistry, MemoryRegistryStore, RegistrySnapshot, RegistryStore};
use chainrelay_core::source::{SourceId, SourceLeases};
use chainrelay_evm::{
    signature_topic, ChainScanner, EvmFetcher, LogNormalizer, MemoryChain, RawLog, RetryPolicy,
    ScannerBuilder, ScannerState, TickOutcome,
};
use tokio_util::sync::CancellationToken;

const CONTRACT: &str = "0xc0de000000000000000000000000000000000001";
const FUNDED: &str = "Funded(address,address,bytes32,uint256)";
const CREATED: &str = "EscrowCreated(address,address,address)";

fn word(tail: &str) -> String {
    format!("0x{tail:0>64}")
}

fn funded_log(block: u64, tx: &str, index: u32) -> RawLog {
    RawLog {
        address: CONTRACT.into(),
        topics: vec![signature_topic(FUNDED), word("aa"), word("bb"), word(tx)],
        data: word("64"),
        block_number: format!("0x{block:x}"),
        block_hash: String::new(),
        tx_hash: format!("0x{tx}"),
        log_index: format!("0x{index:x}"),
        removed: None,
    }
}

fn created_log(block: u64, tx: &str, entity: &str) -> RawLog {
    RawLog {
        address: CONTRACT.into(),
        topics: vec![signature_topic(CREATED), word(entity), word("aa"), word("bb")],
        data: "0x".into(),
        block_number: format!("0x{block:x}"),
        block_hash: String::new(),
        tx_hash: format!("0x{tx}"),
        log_index: "0x0".into(),
        removed: None,
    }
}

struct Harness {
    chain: MemoryChain,
    bus: InMemoryBus,
    checkpoints: Arc<MemoryCheckpointStore>,
    registry_store: Arc<MemoryRegistryStore>,
    leases: SourceLeases,
    metrics: Arc<RelayMetrics>,
}

impl Harness {
    fn new(head: u64) -> Self {
        Self {
            chain: MemoryChain::new(head),
            bus: InMemoryBus::new(),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            registry_store: Arc::new(MemoryRegistryStore::new()),
            leases: SourceLeases::new(),
            metrics: Arc::new(RelayMetrics::new()),
        }
    }

    fn source() -> SourceId {
        SourceId::new(1, CONTRACT, &[FUNDED.to_string(), CREATED.to_string()])
    }

    /// A fresh scanner (as after a restart) over the shared stores.
    fn scanner(&self, checkpoint_interval: u64) -> ChainScanner {
        let normalizer =
            LogNormalizer::from_config(1, &[FUNDED.to_string()], &[CREATED.to_string()]).unwrap();
        ScannerBuilder::new(Self::source())
            .start_block(100)
            .confirmation_lag(2)
            .max_batch_blocks(10)
            .poll_interval(Duration::from_millis(10))
            .checkpoint_interval(checkpoint_interval)
            .fetcher(EvmFetcher::new(Arc::new(self.chain.clone()), RetryPolicy::none(), 5))
            .normalizer(Arc::new(normalizer))
            .publisher(Arc::new(EventPublisher::new(
                Arc::new(self.bus.clone()),
                Duration::from_secs(1),
                self.metrics.clone(),
            )))
            .checkpoint_store(self.checkpoints.clone())
            .registry(Arc::new(KnownEntityRegistry::new()))
            .registry_store(self.registry_store.clone())
            .leases(self.leases.clone())
            .metrics(self.metrics.clone())
            .build()
            .unwrap()
    }

    async fn checkpoint(&self) -> Option<u64> {
        self.checkpoints
            .load(&Self::source().key())
            .await
            .unwrap()
            .map(|cp| cp.last_processed_position)
    }

    /// Drain the bus through an upsert consumer.
    async fn consume_all(&self, store: &Arc<MemoryEventStore>) {
        let consumer = MessageConsumer::new(
            Arc::new(self.bus.subscribe()),
            store.clone(),
            Arc::new(UpsertHandler),
            self.metrics.clone(),
            ConsumerConfig::default(),
        );
        let sub = self.bus.subscribe();
        while self.bus.pending() > 0 {
            for delivery in sub.pull(100).await.unwrap() {
                assert_eq!(consumer.process(delivery).await, Outcome::Acked);
            }
        }
    }
}

#[tokio::test]
async fn scans_confirmed_range_from_start_block() {
    let h = Harness::new(105);
    h.chain.push_log(funded_log(102, "01", 0));

    let mut scanner = h.scanner(1);
    let outcome = scanner.tick().await.unwrap();

    assert_eq!(
        outcome,
        TickOutcome::Advanced {
            from: 101,
            to: 103,
            published: 1,
            skipped: 0,
            caught_up: true,
        }
    );
    assert_eq!(h.chain.log_requests(), vec![(101, 103)]);
    assert_eq!(h.checkpoint().await, Some(103));
    assert_eq!(h.bus.published().len(), 1);
    assert_eq!(scanner.state(), ScannerState::Idle);

    // Nothing new until the head moves.
    assert!(matches!(
        scanner.tick().await.unwrap(),
        TickOutcome::CaughtUp { position: 103, safe_head: 103 }
    ));
}

#[tokio::test]
async fn two_matching_logs_yield_two_events() {
    let h = Harness::new(105);
    h.chain.push_log(funded_log(101, "01", 0));
    h.chain.push_log(funded_log(103, "02", 0));
    h.chain.push_log(funded_log(103, "02", 1));

    let mut scanner = h.scanner(1);
    assert_eq!(
        scanner.tick().await.unwrap(),
        TickOutcome::Advanced {
            from: 101,
            to: 103,
            published: 3,
            skipped: 0,
            caught_up: true,
        }
    );
    assert_eq!(h.checkpoint().await, Some(103));

    let ids: BTreeSet<String> = h
        .bus
        .published()
        .iter()
        .map(|(_, msg)| msg.attributes["event_id"].clone())
        .collect();
    assert_eq!(ids.len(), 3, "same tx, different log index: distinct ids");

    let store = Arc::new(MemoryEventStore::new());
    h.consume_all(&store).await;
    assert_eq!(store.len(), 3);
}

#[tokio::test]
async fn two_logs_in_range_checkpoint_at_upper_bound() {
    let h = Harness::new(105);
    h.chain.push_log(funded_log(101, "0a", 0));
    h.chain.push_log(funded_log(102, "0b", 0));

    let mut scanner = h.scanner(1);
    assert!(matches!(
        scanner.tick().await.unwrap(),
        TickOutcome::Advanced { from: 101, to: 103, published: 2, .. }
    ));
    assert_eq!(h.bus.published().len(), 2);
    assert_eq!(h.checkpoint().await, Some(103));
}

#[tokio::test]
async fn large_ranges_are_paged_and_bounded() {
    let h = Harness::new(200);
    let mut scanner = h.scanner(1);

    let outcome = scanner.tick().await.unwrap();
    assert!(matches!(outcome, TickOutcome::Advanced { from: 101, to: 110, caught_up: false, .. }));
    assert_eq!(h.chain.log_requests(), vec![(101, 105), (106, 110)]);
}

#[tokio::test]
async fn publish_failure_leaves_checkpoint_untouched() {
    let h = Harness::new(105);
    h.chain.push_log(funded_log(101, "01", 0));
    h.chain.push_log(funded_log(103, "02", 0));
    h.bus.set_publish_fault(PublishFault::FailAfter(1));

    let mut scanner = h.scanner(1);
    assert_eq!(
        scanner.tick().await.unwrap(),
        TickOutcome::PublishFailed { failed: 1, total: 2 }
    );
    assert_eq!(h.checkpoint().await, None);
    assert_eq!(scanner.position(), None);
    assert_eq!(h.metrics.snapshot().publish_errors, 1);

    // Bus recovers: the same range is re-published and checkpointed.
    h.bus.set_publish_fault(PublishFault::None);
    assert!(matches!(scanner.tick().await.unwrap(), TickOutcome::Advanced { to: 103, .. }));
    assert_eq!(h.checkpoint().await, Some(103));

    let store = Arc::new(MemoryEventStore::new());
    h.consume_all(&store).await;
    assert_eq!(h.bus.published().len(), 3);
    assert_eq!(store.len(), 2, "duplicate delivery collapses by event id");
}

#[tokio::test]
async fn restart_before_checkpoint_replays_idempotently() {
    let h = Harness::new(105);
    h.chain.push_log(funded_log(101, "01", 0));
    h.chain.push_log(funded_log(102, "02", 1));

    // Interval too large to save: simulates a crash after publishing.
    let mut first = h.scanner(1_000);
    assert!(matches!(first.tick().await.unwrap(), TickOutcome::Advanced { .. }));
    drop(first);
    assert_eq!(h.checkpoint().await, None);

    let mut second = h.scanner(1);
    assert!(matches!(second.tick().await.unwrap(), TickOutcome::Advanced { from: 101, to: 103, .. }));
    assert_eq!(h.checkpoint().await, Some(103));

    let store = Arc::new(MemoryEventStore::new());
    h.consume_all(&store).await;
    assert_eq!(h.bus.published().len(), 4);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn discovered_entities_are_announced_once_across_restarts() {
    let h = Harness::new(110);
    h.chain.push_log(created_log(101, "01", "e1"));
    h.chain.push_log(created_log(102, "02", "E1"));
    h.chain.push_log(created_log(103, "03", "e2"));

    let mut first = h.scanner(1);
    assert!(matches!(
        first.tick().await.unwrap(),
        TickOutcome::Advanced { published: 2, skipped: 1, .. }
    ));
    let snapshot = h.registry_store.load().await.unwrap().unwrap();
    assert_eq!(snapshot.count, 2);

    // Operator rewinds the checkpoint; the restored registry still dedups.
    h.checkpoints.delete(&Harness::source().key()).await.unwrap();
    let mut second = h.scanner(1);
    assert!(matches!(
        second.tick().await.unwrap(),
        TickOutcome::Advanced { published: 0, skipped: 3, .. }
    ));
    assert_eq!(h.bus.published().len(), 2);

    let m = h.metrics.snapshot();
    assert_eq!(m.entities_discovered, 2);
    assert_eq!(m.entities_skipped, 4);
}

/// Registry store whose saves fail while `failing` is set.
#[derive(Default)]
struct FlakyRegistryStore {
    inner: MemoryRegistryStore,
    failing: AtomicBool,
}

#[async_trait]
impl RegistryStore for FlakyRegistryStore {
    async fn load(&self) -> Result<Option<RegistrySnapshot>, RelayError> {
        self.inner.load().await
    }

    async fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), RelayError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RelayError::Storage("disk full".into()));
        }
        self.inner.save(snapshot).await
    }
}

#[tokio::test]
async fn failed_registry_save_is_retried_next_tick() {
    let h = Harness::new(105);
    h.chain.push_log(created_log(101, "01", "e1"));
    let store = Arc::new(FlakyRegistryStore::default());
    store.failing.store(true, Ordering::SeqCst);
    let registry = Arc::new(KnownEntityRegistry::new());

    let normalizer =
        LogNormalizer::from_config(1, &[FUNDED.to_string()], &[CREATED.to_string()]).unwrap();
    let mut scanner = ScannerBuilder::new(Harness::source())
        .start_block(100)
        .confirmation_lag(2)
        .checkpoint_interval(1)
        .fetcher(EvmFetcher::new(Arc::new(h.chain.clone()), RetryPolicy::none(), 5))
        .normalizer(Arc::new(normalizer))
        .publisher(Arc::new(EventPublisher::new(
            Arc::new(h.bus.clone()),
            Duration::from_secs(1),
            h.metrics.clone(),
        )))
        .checkpoint_store(h.checkpoints.clone())
        .registry(registry.clone())
        .registry_store(store.clone())
        .leases(h.leases.clone())
        .metrics(h.metrics.clone())
        .build()
        .unwrap();

    assert_eq!(scanner.tick().await.unwrap(), TickOutcome::StorageFailed);
    assert_eq!(registry.count(), 0, "memory must not run ahead of the stored snapshot");
    assert_eq!(h.checkpoint().await, None);

    store.failing.store(false, Ordering::SeqCst);
    assert!(matches!(
        scanner.tick().await.unwrap(),
        TickOutcome::Advanced { to: 103, published: 1, .. }
    ));
    let saved = store.load().await.unwrap().unwrap();
    assert_eq!(saved.count, 1);
    assert!(registry.contains(&saved.escrows[0]));
    assert_eq!(h.checkpoint().await, Some(103));
    assert_eq!(h.metrics.snapshot().entities_discovered, 1);
}

#[tokio::test]
async fn rpc_failure_skips_the_tick() {
    let h = Harness::new(105);
    h.chain.push_log(funded_log(101, "01", 0));
    h.chain.fail_next(1);

    let mut scanner = h.scanner(1);
    assert_eq!(scanner.tick().await.unwrap(), TickOutcome::RpcFailed);
    assert_eq!(h.metrics.snapshot().rpc_errors, 1);
    assert!(h.bus.published().is_empty());
    assert_eq!(h.checkpoint().await, None);

    assert!(matches!(scanner.tick().await.unwrap(), TickOutcome::Advanced { .. }));
}

#[tokio::test]
async fn removed_logs_are_not_relayed() {
    let h = Harness::new(105);
    let mut reorged = funded_log(101, "01", 0);
    reorged.removed = Some(true);
    h.chain.push_log(reorged);

    let mut scanner = h.scanner(1);
    assert!(matches!(scanner.tick().await.unwrap(), TickOutcome::Advanced { published: 0, .. }));
    assert!(h.bus.published().is_empty());
}

#[tokio::test]
async fn run_stops_on_cancel_and_holds_the_lease() {
    let h = Harness::new(105);
    h.chain.push_log(funded_log(101, "01", 0));

    let cancel = CancellationToken::new();
    let mut scanner = h.scanner(1_000);
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = scanner.run(cancel).await;
            (result, scanner.state())
        })
    };

    for _ in 0..100 {
        if h.leases.is_active(&Harness::source()) && !h.bus.published().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut duplicate = h.scanner(1);
    assert!(matches!(
        duplicate.run(CancellationToken::new()).await,
        Err(RelayError::SourceBusy(_))
    ));

    cancel.cancel();
    let (result, state) = handle.await.unwrap();
    result.unwrap();
    assert_eq!(state, ScannerState::Stopped);
    assert!(!h.leases.is_active(&Harness::source()));
    // The unsaved position is flushed on shutdown.
    assert_eq!(h.checkpoint().await, Some(103));
}
