//! Relay settings from flags and environment (a `.env` file is loaded first).

use clap::Args;

use chainrelay_core::config::{split_list, CheckpointStoreKind, PubSubConfig, RelayConfig};

#[derive(Debug, Clone, Args)]
pub struct RelayArgs {
    /// JSON-RPC endpoint of the source chain
    #[arg(long, env = "RPC_URL", default_value = "http://localhost:8545", global = true)]
    pub rpc_url: String,

    /// Contract addresses to watch, comma-separated (one scanner each)
    #[arg(long = "contracts", env = "CONTRACT_ADDRESS", default_value = "", global = true)]
    pub contracts: String,

    #[arg(long, env = "CHAIN_ID", default_value_t = 1, global = true)]
    pub chain_id: u64,

    /// Event signatures to relay, e.g. `Funded(address,address,bytes32,uint256)=SENT`
    #[arg(long = "events", env = "EVENT_NAMES", default_value = "", global = true)]
    pub event_names: String,

    /// Event signatures announcing a new entity (deduplicated)
    #[arg(long = "discovery-events", env = "DISCOVERY_EVENTS", default_value = "", global = true)]
    pub discovery_events: String,

    #[arg(long, env = "START_BLOCK", default_value_t = 0, global = true)]
    pub start_block: u64,

    #[arg(long, env = "CONFIRMATION_LAG", default_value_t = 12, global = true)]
    pub confirmation_lag: u64,

    #[arg(long = "poll-interval", env = "POLL_INTERVAL_SECONDS", default_value_t = 5, global = true)]
    pub poll_interval_secs: u64,

    /// Maximum blocks scanned per tick
    #[arg(long, env = "BATCH_SIZE", default_value_t = 1000, global = true)]
    pub batch_size: u64,

    /// Blocks per eth_getLogs request
    #[arg(long, env = "PAGE_BLOCKS", default_value_t = 500, global = true)]
    pub page_blocks: u64,

    #[arg(long, env = "CHECKPOINT_INTERVAL_BLOCKS", default_value_t = 1, global = true)]
    pub checkpoint_interval_blocks: u64,

    /// `file` or `sqlite`
    #[arg(long = "store", env = "CHECKPOINT_STORE_TYPE", default_value = "file", global = true)]
    pub checkpoint_store: String,

    /// Directory (file) or database path / URL (sqlite)
    #[arg(long = "store-url", env = "CHECKPOINT_STORE_URL", default_value = "./data/checkpoints", global = true)]
    pub checkpoint_store_url: String,

    /// Registry snapshot file; omit to keep the registry in memory
    #[arg(long, env = "REGISTRY_PATH", global = true)]
    pub registry_path: Option<String>,

    #[arg(long, env = "PUBSUB_PROJECT_ID", global = true)]
    pub pubsub_project_id: Option<String>,

    #[arg(long, env = "PUBSUB_TOPIC_ID", global = true)]
    pub pubsub_topic_id: Option<String>,

    #[arg(long, env = "PUBSUB_SUBSCRIPTION_ID", global = true)]
    pub pubsub_subscription_id: Option<String>,

    /// Pub/Sub endpoint override (emulator)
    #[arg(long, env = "PUBSUB_ENDPOINT", global = true)]
    pub pubsub_endpoint: Option<String>,

    #[arg(long, env = "PUBSUB_ACCESS_TOKEN", hide_env_values = true, global = true)]
    pub pubsub_access_token: Option<String>,

    #[arg(long = "publish-timeout-ms", env = "PUBLISH_TIMEOUT_MS", default_value_t = 10_000, global = true)]
    pub publish_timeout_ms: u64,

    /// Retry budget for outbound messages
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3, global = true)]
    pub max_retries: u32,

    /// Consumer concurrency
    #[arg(long, env = "MAX_IN_FLIGHT", default_value_t = 16, global = true)]
    pub max_in_flight: usize,
}

impl RelayArgs {
    pub fn to_config(&self) -> anyhow::Result<RelayConfig> {
        let checkpoint_store: CheckpointStoreKind = self.checkpoint_store.parse()?;
        // PUBSUB_EMULATOR_HOST is the convention of the Google client libraries.
        let endpoint = self.pubsub_endpoint.clone().or_else(|| {
            std::env::var("PUBSUB_EMULATOR_HOST")
                .ok()
                .filter(|h| !h.is_empty())
                .map(|h| format!("http://{h}"))
        });

        Ok(RelayConfig {
            rpc_url: self.rpc_url.clone(),
            chain_id: self.chain_id,
            contracts: split_list(&self.contracts),
            event_names: split_list(&self.event_names),
            discovery_events: split_list(&self.discovery_events),
            start_block: self.start_block,
            confirmation_lag: self.confirmation_lag,
            poll_interval_secs: self.poll_interval_secs,
            batch_size: self.batch_size,
            page_blocks: self.page_blocks,
            checkpoint_interval_blocks: self.checkpoint_interval_blocks,
            checkpoint_store,
            checkpoint_store_url: self.checkpoint_store_url.clone(),
            registry_path: self.registry_path.clone().filter(|p| !p.is_empty()),
            pubsub: PubSubConfig {
                project_id: self.pubsub_project_id.clone(),
                topic_id: self.pubsub_topic_id.clone(),
                subscription_id: self.pubsub_subscription_id.clone(),
                endpoint,
                access_token: self.pubsub_access_token.clone(),
            },
            publish_timeout_ms: self.publish_timeout_ms,
            max_retries: self.max_retries,
            max_in_flight: self.max_in_flight,
        })
    }
}
