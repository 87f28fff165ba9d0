//! The chain scanner: polls one source, relays its events, and advances
//! the checkpoint only after a range was durably published.
//!
//! # Tick
//! 1. Range `[position + 1, min(head - confirmation_lag, position + max_batch_blocks)]`,
//!    where `position` is the checkpoint, or `start_block` on first run.
//! 2. Fetch logs page by page (bounded retries per page).
//! 3. Normalize; drop discovery events for already-known entities.
//! 4. Publish the batch. Any failed publish aborts the tick: no registry
//!    commit, no checkpoint.
//! 5. Commit newly discovered entities, persist the registry snapshot,
//!    then save the checkpoint at the range's upper bound.
//!
//! Cancellation is only observed between ticks, so a batch that started
//! publishing always finishes and checkpoints.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use chainrelay_core::checkpoint::CheckpointManager;
use chainrelay_core::error::RelayError;
use chainrelay_core::event::CanonicalEvent;
use chainrelay_core::metrics::RelayMetrics;
use chainrelay_core::publisher::EventPublisher;
use chainrelay_core::registry::{normalize, KnownEntityRegistry, RegistryStore};
use chainrelay_core::source::{SourceId, SourceLeases};

use crate::fetcher::{EvmFetcher, LogFilter, RawLog};
use crate::normalize::LogNormalizer;

/// Runtime state of a scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScannerState {
    Idle,
    Scanning,
    Publishing,
    Checkpointing,
    Stopped,
}

/// Numeric scanner settings.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Position assumed when the source has no checkpoint.
    pub start_block: u64,
    pub confirmation_lag: u64,
    pub max_batch_blocks: u64,
    pub poll_interval: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            start_block: 0,
            confirmation_lag: 12,
            max_batch_blocks: 1000,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing new below the confirmation lag.
    CaughtUp { position: u64, safe_head: u64 },
    /// `[from, to]` was published and the position advanced to `to`.
    Advanced {
        from: u64,
        to: u64,
        published: usize,
        skipped: usize,
        /// `true` if `to` reached the safe head.
        caught_up: bool,
    },
    /// The chain could not be read; nothing changed.
    RpcFailed,
    /// At least one event was not accepted by the bus; nothing changed.
    PublishFailed { failed: usize, total: usize },
    /// Events were published but the registry or checkpoint write failed.
    StorageFailed,
}

impl TickOutcome {
    /// Whether the loop should wait for the poll interval before the next tick.
    fn should_wait(&self) -> bool {
        !matches!(self, Self::Advanced { caught_up: false, .. })
    }
}

pub struct ChainScanner {
    pub(crate) source: SourceId,
    pub(crate) config: ScannerConfig,
    pub(crate) fetcher: EvmFetcher,
    pub(crate) normalizer: Arc<LogNormalizer>,
    pub(crate) filter: LogFilter,
    pub(crate) publisher: Arc<EventPublisher>,
    pub(crate) checkpoint: CheckpointManager,
    pub(crate) registry: Arc<KnownEntityRegistry>,
    pub(crate) registry_store: Option<Arc<dyn RegistryStore>>,
    pub(crate) leases: SourceLeases,
    pub(crate) metrics: Arc<RelayMetrics>,
    pub(crate) state: ScannerState,
    /// Last published position (may be ahead of the persisted checkpoint).
    pub(crate) position: Option<u64>,
    pub(crate) resumed: bool,
}

impl ChainScanner {
    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    /// Last published position, once known.
    pub fn position(&self) -> Option<u64> {
        self.position
    }

    /// Load the checkpoint and merge the persisted registry snapshot.
    /// Called by [`run`](Self::run); exposed for single-tick callers.
    pub async fn resume(&mut self) -> Result<(), RelayError> {
        if self.resumed {
            return Ok(());
        }
        self.position = self.checkpoint.load().await?;
        match self.position {
            Some(position) => tracing::info!(source = %self.source, position, "resuming from checkpoint"),
            None => tracing::info!(
                source = %self.source,
                start_block = self.config.start_block,
                "no checkpoint, starting from configured block"
            ),
        }

        if let Some(store) = &self.registry_store {
            if let Some(snapshot) = store.load().await? {
                let added = self.registry.merge(&snapshot)?;
                tracing::info!(
                    source = %self.source,
                    restored = added,
                    known = self.registry.count(),
                    "registry restored"
                );
            }
        }
        self.resumed = true;
        Ok(())
    }

    /// Run until `cancel` fires. Holds the source lease for the whole run and
    /// flushes the checkpoint before returning.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), RelayError> {
        let _lease = self.leases.acquire(&self.source)?;
        self.resume().await?;
        tracing::info!(source = %self.source, "scanner started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let outcome = self.tick().await?;
            if outcome.should_wait() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        let flushed = self.checkpoint.flush().await;
        self.state = ScannerState::Stopped;
        match flushed {
            Ok(()) => {
                tracing::info!(source = %self.source, position = ?self.position, "scanner stopped");
                Ok(())
            }
            Err(e) => {
                RelayMetrics::incr(&self.metrics.checkpoint_errors);
                tracing::error!(source = %self.source, error = %e, "final checkpoint flush failed");
                Err(e)
            }
        }
    }

    /// Scan, publish and checkpoint one range.
    ///
    /// Transient failures are logged, counted, and reported as an outcome;
    /// an `Err` is only returned if the scanner cannot continue.
    pub async fn tick(&mut self) -> Result<TickOutcome, RelayError> {
        self.resume().await?;
        self.state = ScannerState::Scanning;
        let outcome = self.scan_range().await;
        self.state = ScannerState::Idle;
        Ok(outcome)
    }

    async fn scan_range(&mut self) -> TickOutcome {
        let head = match self.fetcher.head_block_number().await {
            Ok(head) => head,
            Err(e) => return self.rpc_failed("eth_blockNumber", &RelayError::from(e)),
        };
        let safe_head = head.saturating_sub(self.config.confirmation_lag);
        let position = self.position.unwrap_or(self.config.start_block);
        let from = position.saturating_add(1);
        let to = safe_head.min(position.saturating_add(self.config.max_batch_blocks));
        if from > to {
            tracing::debug!(source = %self.source, position, safe_head, "caught up");
            return TickOutcome::CaughtUp { position, safe_head };
        }

        let mut logs = match self.fetcher.logs(from, to, &self.filter).await {
            Ok(logs) => logs,
            Err(e) => return self.rpc_failed("eth_getLogs", &RelayError::from(e)),
        };
        logs.retain(|log| !log.is_removed());
        logs.sort_by_key(|log| {
            (
                log.block_number_u64().unwrap_or(u64::MAX),
                log.log_index_u32().unwrap_or(u32::MAX),
            )
        });

        let timestamps = match self.block_timestamps(&logs).await {
            Ok(ts) => ts,
            Err(e) => return self.rpc_failed("eth_getBlockByNumber", &e),
        };

        let (events, discovered, skipped) = self.normalize_batch(&logs, &timestamps);

        // Publishing
        self.state = ScannerState::Publishing;
        let results = self.publisher.publish_batch(&events).await;
        let failed: Vec<String> = results
            .iter()
            .filter_map(|r| r.as_ref().err().map(ToString::to_string))
            .collect();
        if !failed.is_empty() {
            let err = RelayError::Publish {
                failed: failed.len(),
                total: events.len(),
                reason: failed[0].clone(),
            };
            tracing::error!(
                source = %self.source,
                from,
                to,
                error = %err,
                "batch aborted, checkpoint not advanced"
            );
            return TickOutcome::PublishFailed {
                failed: failed.len(),
                total: events.len(),
            };
        }

        // Checkpointing
        self.state = ScannerState::Checkpointing;
        if let Err(e) = self.commit_discoveries(&discovered).await {
            RelayMetrics::incr(&self.metrics.checkpoint_errors);
            tracing::error!(source = %self.source, from, to, error = %e, "registry persist failed");
            return TickOutcome::StorageFailed;
        }

        self.position = Some(to);
        match self.checkpoint.maybe_save(to, to - from + 1).await {
            Ok(saved) => {
                if saved {
                    RelayMetrics::incr(&self.metrics.batches_checkpointed);
                }
            }
            Err(e) => {
                RelayMetrics::incr(&self.metrics.checkpoint_errors);
                tracing::error!(source = %self.source, position = to, error = %e, "checkpoint save failed");
                return TickOutcome::StorageFailed;
            }
        }

        tracing::info!(
            source = %self.source,
            from,
            to,
            logs = logs.len(),
            published = events.len(),
            skipped,
            "range relayed"
        );
        TickOutcome::Advanced {
            from,
            to,
            published: events.len(),
            skipped,
            caught_up: to >= safe_head,
        }
    }

    fn rpc_failed(&self, call: &str, error: &RelayError) -> TickOutcome {
        RelayMetrics::incr(&self.metrics.rpc_errors);
        tracing::warn!(source = %self.source, call, error = %error, "RPC failed, retrying next tick");
        TickOutcome::RpcFailed
    }

    /// One `eth_getBlockByNumber` per distinct block.
    async fn block_timestamps(&self, logs: &[RawLog]) -> Result<BTreeMap<u64, i64>, RelayError> {
        let mut timestamps = BTreeMap::new();
        for log in logs {
            let Ok(number) = log.block_number_u64() else {
                continue;
            };
            if timestamps.contains_key(&number) {
                continue;
            }
            if let Some(block) = self.fetcher.block(number).await? {
                timestamps.insert(number, block.timestamp);
            }
        }
        Ok(timestamps)
    }

    /// Normalize logs, dropping re-announcements of known entities.
    /// Returns (events, newly discovered (entity, block), skipped count).
    fn normalize_batch(
        &self,
        logs: &[RawLog],
        timestamps: &BTreeMap<u64, i64>,
    ) -> (Vec<CanonicalEvent>, Vec<(String, u64)>, usize) {
        let mut events = Vec::with_capacity(logs.len());
        let mut discovered = Vec::new();
        let mut seen_in_batch = HashSet::new();
        let mut skipped = 0usize;

        for log in logs {
            let occurred_at = log.block_number_u64().ok().and_then(|n| timestamps.get(&n).copied());
            let normalized = match self.normalizer.normalize(log, occurred_at) {
                Ok(Some(n)) => n,
                Ok(None) => continue,
                Err(e) => {
                    RelayMetrics::incr(&self.metrics.decode_errors);
                    tracing::warn!(
                        source = %self.source,
                        tx_hash = %log.tx_hash,
                        log_index = %log.log_index,
                        error = %e,
                        "undecodable log skipped"
                    );
                    continue;
                }
            };

            if let Some(entity) = &normalized.discovered {
                let key = normalize(entity);
                if self.registry.contains(&key) || !seen_in_batch.insert(key.clone()) {
                    RelayMetrics::incr(&self.metrics.entities_skipped);
                    skipped += 1;
                    tracing::debug!(source = %self.source, entity = %key, "entity already known");
                    continue;
                }
                discovered.push((key, normalized.event.block_number));
            }
            events.push(normalized.event);
        }
        (events, discovered, skipped)
    }

    /// Persist the grown snapshot first, then add the entities in memory.
    /// The in-memory registry is never ahead of the stored snapshot, so a
    /// failed save is retried by the next tick.
    async fn commit_discoveries(&self, discovered: &[(String, u64)]) -> Result<(), RelayError> {
        let new: Vec<&(String, u64)> = discovered
            .iter()
            .filter(|(entity, _)| !self.registry.contains(entity))
            .collect();
        if new.is_empty() {
            return Ok(());
        }
        if let Some(store) = &self.registry_store {
            let candidate = KnownEntityRegistry::from_snapshot(&self.registry.snapshot())?;
            for (entity, block) in &new {
                candidate.add_at(entity, *block);
            }
            store.save(&candidate.snapshot()).await?;
        }

        let mut added = 0u64;
        for (entity, block) in new {
            if self.registry.add_at(entity, *block) {
                added += 1;
                tracing::info!(source = %self.source, entity = %entity, block, "new entity discovered");
            }
        }
        RelayMetrics::add(&self.metrics.entities_discovered, added);
        Ok(())
    }
}
