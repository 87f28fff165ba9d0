//! Relay configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::source::SourceId;

/// Durable backend used for checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStoreKind {
    /// One JSON file per source under a directory.
    #[default]
    File,
    /// SQLite database (`sqlite` feature of `chainrelay-storage`).
    Sqlite,
}

impl fmt::Display for CheckpointStoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => f.write_str("file"),
            Self::Sqlite => f.write_str("sqlite"),
        }
    }
}

impl FromStr for CheckpointStoreKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(RelayError::Config(format!("unknown checkpoint store type '{other}'"))),
        }
    }
}

/// Pub/Sub connection settings. The bus factory only uses Pub/Sub when both
/// `project_id` and `topic_id` are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PubSubConfig {
    pub project_id: Option<String>,
    pub topic_id: Option<String>,
    pub subscription_id: Option<String>,
    /// Override for emulators; defaults to the public endpoint.
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
}

impl PubSubConfig {
    pub fn is_configured(&self) -> bool {
        self.project_id.as_deref().is_some_and(|p| !p.is_empty())
            && self.topic_id.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Configuration for one relay process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// JSON-RPC endpoint of the source chain.
    pub rpc_url: String,
    pub chain_id: u64,
    /// Contracts to watch. Each gets its own scanner and checkpoint.
    pub contracts: Vec<String>,
    /// Event signatures to relay, e.g. `Funded(bytes32,address,address,uint256)`.
    /// An optional `=STATUS` suffix sets the canonical status.
    pub event_names: Vec<String>,
    /// Event signatures that announce a new entity (deduplicated).
    pub discovery_events: Vec<String>,
    /// Position assumed when no checkpoint exists yet.
    pub start_block: u64,
    /// Blocks behind head that are considered final.
    pub confirmation_lag: u64,
    pub poll_interval_secs: u64,
    /// Upper bound on blocks scanned per tick.
    pub batch_size: u64,
    /// Blocks per `eth_getLogs` call.
    pub page_blocks: u64,
    /// Persist the checkpoint every N blocks (1 = after every batch).
    pub checkpoint_interval_blocks: u64,
    pub checkpoint_store: CheckpointStoreKind,
    /// Directory (file store) or connection URL (sqlite).
    pub checkpoint_store_url: String,
    /// Registry snapshot file. `None` keeps the registry in memory only.
    pub registry_path: Option<String>,
    pub pubsub: PubSubConfig,
    pub publish_timeout_ms: u64,
    /// Retry budget for outbound messages.
    pub max_retries: u32,
    /// Consumer concurrency.
    pub max_in_flight: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".into(),
            chain_id: 1,
            contracts: vec![],
            event_names: vec![],
            discovery_events: vec![],
            start_block: 0,
            confirmation_lag: 12,
            poll_interval_secs: 5,
            batch_size: 1000,
            page_blocks: 500,
            checkpoint_interval_blocks: 1,
            checkpoint_store: CheckpointStoreKind::File,
            checkpoint_store_url: "./data/checkpoints".into(),
            registry_path: None,
            pubsub: PubSubConfig::default(),
            publish_timeout_ms: 10_000,
            max_retries: 3,
            max_in_flight: 16,
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Every event signature the scanner filters on, without status suffixes.
    pub fn all_events(&self) -> Vec<String> {
        self.event_names
            .iter()
            .chain(self.discovery_events.iter())
            .map(|e| e.split('=').next().unwrap_or(e).trim().to_string())
            .collect()
    }

    /// One source per configured contract.
    pub fn sources(&self) -> Vec<SourceId> {
        let events = self.all_events();
        self.contracts
            .iter()
            .map(|c| SourceId::new(self.chain_id, c, &events))
            .collect()
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.rpc_url.trim().is_empty() {
            return Err(RelayError::Config("rpc_url is empty".into()));
        }
        if self.contracts.is_empty() {
            return Err(RelayError::Config("no contract address configured".into()));
        }
        if self.event_names.is_empty() && self.discovery_events.is_empty() {
            return Err(RelayError::Config("no events configured".into()));
        }
        if self.batch_size == 0 || self.page_blocks == 0 {
            return Err(RelayError::Config("batch_size and page_blocks must be > 0".into()));
        }
        if self.checkpoint_interval_blocks == 0 {
            return Err(RelayError::Config("checkpoint_interval_blocks must be > 0".into()));
        }
        Ok(())
    }
}

/// Split a comma-separated list, dropping blanks. Commas inside parentheses
/// do not split, so event signatures survive intact.
pub fn split_list(raw: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in raw.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                items.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&raw[start..]);
    items
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
