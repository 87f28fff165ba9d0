//! Relay counters. Every failure path in the pipeline bumps one of these.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the scanner, publisher, consumer and retry coordinator.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    pub events_published: AtomicU64,
    pub events_consumed: AtomicU64,
    pub entities_discovered: AtomicU64,
    pub entities_skipped: AtomicU64,
    pub batches_checkpointed: AtomicU64,
    pub rpc_errors: AtomicU64,
    pub publish_errors: AtomicU64,
    pub checkpoint_errors: AtomicU64,
    pub decode_errors: AtomicU64,
    pub handler_failures: AtomicU64,
    pub ack_errors: AtomicU64,
    pub retries_accepted: AtomicU64,
    pub retries_rejected: AtomicU64,
}

/// Point-in-time copy of [`RelayMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub events_published: u64,
    pub events_consumed: u64,
    pub entities_discovered: u64,
    pub entities_skipped: u64,
    pub batches_checkpointed: u64,
    pub rpc_errors: u64,
    pub publish_errors: u64,
    pub checkpoint_errors: u64,
    pub decode_errors: u64,
    pub handler_failures: u64,
    pub ack_errors: u64,
    pub retries_accepted: u64,
    pub retries_rejected: u64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            events_published: get(&self.events_published),
            events_consumed: get(&self.events_consumed),
            entities_discovered: get(&self.entities_discovered),
            entities_skipped: get(&self.entities_skipped),
            batches_checkpointed: get(&self.batches_checkpointed),
            rpc_errors: get(&self.rpc_errors),
            publish_errors: get(&self.publish_errors),
            checkpoint_errors: get(&self.checkpoint_errors),
            decode_errors: get(&self.decode_errors),
            handler_failures: get(&self.handler_failures),
            ack_errors: get(&self.ack_errors),
            retries_accepted: get(&self.retries_accepted),
            retries_rejected: get(&self.retries_rejected),
        }
    }
}
