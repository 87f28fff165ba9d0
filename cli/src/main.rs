//! ChainRelay CLI — run the relay and manage its durable state.
//!
//! # Commands
//! ```text
//! chainrelay run
//! chainrelay checkpoint show  [--contract <addr>]
//! chainrelay checkpoint set   <block> [--contract <addr>]
//! chainrelay checkpoint reset [--contract <addr>]
//! chainrelay registry show
//! chainrelay outbound send   --destination-chain <id> <payload-json>
//! chainrelay outbound mark   <message-id> <status> [--error <reason>]
//! chainrelay outbound show   <message-id>
//! chainrelay outbound list   [--status <status>]
//! chainrelay retry <message-id>
//! chainrelay info
//! ```
//!
//! Every setting has an environment variable; a `.env` file in the working
//! directory is loaded before parsing.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd_outbound;
mod cmd_retry;
mod cmd_run;
mod cmd_state;
mod settings;

use settings::RelayArgs;

#[derive(Parser)]
#[command(
    name = "chainrelay",
    about = "Relay confirmed on-chain events to a message bus",
    long_about = "
ChainRelay: scans EVM contracts for configured events, publishes them as
canonical events to Google Pub/Sub (or an in-process bus), checkpoints the
scan position, and consumes events into an idempotent store.

ENVIRONMENT VARIABLES:
  RPC_URL, CONTRACT_ADDRESS, CHAIN_ID, EVENT_NAMES, DISCOVERY_EVENTS
  START_BLOCK, CONFIRMATION_LAG, POLL_INTERVAL_SECONDS, BATCH_SIZE
  CHECKPOINT_INTERVAL_BLOCKS, CHECKPOINT_STORE_TYPE, CHECKPOINT_STORE_URL
  REGISTRY_PATH, PUBSUB_PROJECT_ID, PUBSUB_TOPIC_ID, PUBSUB_SUBSCRIPTION_ID
  PUBSUB_ENDPOINT, PUBSUB_ACCESS_TOKEN, MAX_RETRIES, RUST_LOG
",
    version
)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(flatten)]
    relay: RelayArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scanners (one per contract) and the consumer until Ctrl-C / SIGTERM
    Run,

    /// Inspect or change scan checkpoints
    #[command(subcommand)]
    Checkpoint(CheckpointCmd),

    /// Inspect the discovered-entity registry
    #[command(subcommand)]
    Registry(RegistryCmd),

    /// Send and track outbound cross-chain messages
    #[command(subcommand)]
    Outbound(OutboundCmd),

    /// Retry a failed outbound message
    Retry {
        message_id: String,
    },

    /// Show the effective configuration
    Info,
}

#[derive(Subcommand)]
enum CheckpointCmd {
    /// Print the checkpoint of every configured source
    Show {
        /// Limit to one contract
        #[arg(long)]
        contract: Option<String>,
    },
    /// Overwrite the checkpoint (the next scan starts at block + 1)
    Set {
        block: u64,
        #[arg(long)]
        contract: Option<String>,
    },
    /// Delete the checkpoint (the next scan starts after START_BLOCK)
    Reset {
        #[arg(long)]
        contract: Option<String>,
    },
}

#[derive(Subcommand)]
enum OutboundCmd {
    /// Record a message (retry budget = MAX_RETRIES) and publish it
    Send {
        #[arg(long)]
        destination_chain: u64,
        /// Message body, JSON
        payload: String,
    },
    /// Record a delivery outcome: CONFIRMED, DELIVERED or FAILED
    Mark {
        message_id: String,
        status: String,
        #[arg(long)]
        error: Option<String>,
    },
    /// Print one message
    Show { message_id: String },
    /// Print messages, oldest first
    List {
        #[arg(long)]
        status: Option<String>,
    },
}

#[derive(Subcommand)]
enum RegistryCmd {
    /// Print the persisted registry snapshot
    Show,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let config = cli.relay.to_config()?;

    match cli.command {
        Commands::Run => cmd_run::run(config).await,
        Commands::Checkpoint(CheckpointCmd::Show { contract }) => {
            cmd_state::checkpoint_show(&config, contract.as_deref()).await
        }
        Commands::Checkpoint(CheckpointCmd::Set { block, contract }) => {
            cmd_state::checkpoint_set(&config, contract.as_deref(), block).await
        }
        Commands::Checkpoint(CheckpointCmd::Reset { contract }) => {
            cmd_state::checkpoint_reset(&config, contract.as_deref()).await
        }
        Commands::Registry(RegistryCmd::Show) => cmd_state::registry_show(&config).await,
        Commands::Outbound(cmd) => run_outbound(&config, cmd).await,
        Commands::Retry { message_id } => cmd_retry::run(&config, &message_id).await,
        Commands::Info => cmd_info(&config),
    }
}

async fn run_outbound(config: &chainrelay_core::RelayConfig, cmd: OutboundCmd) -> Result<()> {
    let output = match cmd {
        OutboundCmd::Send { destination_chain, payload } => {
            serde_json::to_value(cmd_outbound::send(config, destination_chain, &payload).await?)?
        }
        OutboundCmd::Mark { message_id, status, error } => {
            serde_json::to_value(cmd_outbound::mark(config, &message_id, &status, error).await?)?
        }
        OutboundCmd::Show { message_id } => serde_json::to_value(cmd_outbound::show(config, &message_id).await?)?,
        OutboundCmd::List { status } => serde_json::to_value(cmd_outbound::list(config, status.as_deref()).await?)?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn cmd_info(config: &chainrelay_core::RelayConfig) -> Result<()> {
    println!("ChainRelay v{}", env!("CARGO_PKG_VERSION"));
    println!("{}", serde_json::to_string_pretty(config)?);
    let sources = config.sources();
    if !sources.is_empty() {
        println!("\nSources:");
        for source in sources {
            println!("  {}", source.key());
        }
    }
    Ok(())
}
