//! Fluent builder for [`ChainScanner`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainrelay_core::{EventPublisher, InMemoryBus, MemoryCheckpointStore, RelayMetrics, SourceId};
//! use chainrelay_evm::{EvmFetcher, LogNormalizer, MemoryChain, RetryPolicy, ScannerBuilder};
//!
//! let events = vec!["Funded(address,address,bytes32,uint256)".to_string()];
//! let metrics = Arc::new(RelayMetrics::new());
//! let scanner = ScannerBuilder::new(SourceId::new(1, "0xC0DE", &events))
//!     .start_block(19_000_000)
//!     .confirmation_lag(12)
//!     .max_batch_blocks(500)
//!     .fetcher(EvmFetcher::new(Arc::new(MemoryChain::new(0)), RetryPolicy::default(), 500))
//!     .normalizer(Arc::new(LogNormalizer::from_config(1, &events, &[]).unwrap()))
//!     .publisher(Arc::new(EventPublisher::new(
//!         Arc::new(InMemoryBus::new()),
//!         std::time::Duration::from_secs(10),
//!         metrics.clone(),
//!     )))
//!     .checkpoint_store(Arc::new(MemoryCheckpointStore::new()))
//!     .metrics(metrics)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;
use std::time::Duration;

use chainrelay_core::checkpoint::{CheckpointManager, CheckpointStore};
use chainrelay_core::config::RelayConfig;
use chainrelay_core::error::RelayError;
use chainrelay_core::metrics::RelayMetrics;
use chainrelay_core::publisher::EventPublisher;
use chainrelay_core::registry::{KnownEntityRegistry, RegistryStore};
use chainrelay_core::source::{SourceId, SourceLeases};

use crate::fetcher::EvmFetcher;
use crate::normalize::LogNormalizer;
use crate::scanner::{ChainScanner, ScannerConfig, ScannerState};

pub struct ScannerBuilder {
    source: SourceId,
    config: ScannerConfig,
    checkpoint_interval: u64,
    fetcher: Option<EvmFetcher>,
    normalizer: Option<Arc<LogNormalizer>>,
    publisher: Option<Arc<EventPublisher>>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    registry: Option<Arc<KnownEntityRegistry>>,
    registry_store: Option<Arc<dyn RegistryStore>>,
    leases: Option<SourceLeases>,
    metrics: Option<Arc<RelayMetrics>>,
}

impl ScannerBuilder {
    pub fn new(source: SourceId) -> Self {
        Self {
            source,
            config: ScannerConfig::default(),
            checkpoint_interval: 1,
            fetcher: None,
            normalizer: None,
            publisher: None,
            checkpoint_store: None,
            registry: None,
            registry_store: None,
            leases: None,
            metrics: None,
        }
    }

    /// Copy the numeric settings from a [`RelayConfig`].
    pub fn settings_from(mut self, config: &RelayConfig) -> Self {
        self.config = ScannerConfig {
            start_block: config.start_block,
            confirmation_lag: config.confirmation_lag,
            max_batch_blocks: config.batch_size,
            poll_interval: config.poll_interval(),
        };
        self.checkpoint_interval = config.checkpoint_interval_blocks;
        self
    }

    /// Position assumed when the source has no checkpoint.
    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = block;
        self
    }

    /// Blocks behind head before a block is scanned.
    pub fn confirmation_lag(mut self, lag: u64) -> Self {
        self.config.confirmation_lag = lag;
        self
    }

    pub fn max_batch_blocks(mut self, blocks: u64) -> Self {
        self.config.max_batch_blocks = blocks;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Save the checkpoint every N blocks.
    pub fn checkpoint_interval(mut self, blocks: u64) -> Self {
        self.checkpoint_interval = blocks;
        self
    }

    pub fn fetcher(mut self, fetcher: EvmFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn normalizer(mut self, normalizer: Arc<LogNormalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn publisher(mut self, publisher: Arc<EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    /// Share a registry across scanners. Defaults to a private one.
    pub fn registry(mut self, registry: Arc<KnownEntityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn registry_store(mut self, store: Arc<dyn RegistryStore>) -> Self {
        self.registry_store = Some(store);
        self
    }

    /// Share a lease table across scanners. Defaults to a private one.
    pub fn leases(mut self, leases: SourceLeases) -> Self {
        self.leases = Some(leases);
        self
    }

    pub fn metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<ChainScanner, RelayError> {
        let missing = |what: &str| RelayError::Config(format!("scanner for {} needs a {what}", self.source));
        let fetcher = self.fetcher.clone().ok_or_else(|| missing("fetcher"))?;
        let normalizer = self.normalizer.clone().ok_or_else(|| missing("normalizer"))?;
        let publisher = self.publisher.clone().ok_or_else(|| missing("publisher"))?;
        let store = self.checkpoint_store.clone().ok_or_else(|| missing("checkpoint store"))?;
        if self.config.max_batch_blocks == 0 {
            return Err(RelayError::Config("max_batch_blocks must be > 0".into()));
        }

        let filter = normalizer.filter_for(&self.source.contract);
        Ok(ChainScanner {
            checkpoint: CheckpointManager::new(store, &self.source, self.checkpoint_interval),
            filter,
            fetcher,
            normalizer,
            publisher,
            registry: self.registry.unwrap_or_default(),
            registry_store: self.registry_store,
            leases: self.leases.unwrap_or_default(),
            metrics: self.metrics.unwrap_or_default(),
            state: ScannerState::Idle,
            position: None,
            resumed: false,
            config: self.config,
            source: self.source,
        })
    }
}
