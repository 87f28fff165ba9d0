//! chainrelay-core — the chain-agnostic half of the event relay.
//!
//! # Architecture
//!
//! ```text
//! ChainScanner (chainrelay-evm)
//!      ├── CheckpointManager   (resume position per source)
//!      ├── KnownEntityRegistry (discovered-entity deduplication)
//!      └── EventPublisher ───▶ MessageBus ───▶ MessageConsumer
//!                                   ▲               └── Persistence + EventHandler
//!                                   │
//!                            RetryCoordinator ◀── OutboundLedger
//! ```

pub mod backoff;
pub mod bus;
pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod metrics;
pub mod outbound;
pub mod publisher;
pub mod registry;
pub mod retry;
pub mod source;

pub use backoff::{RetryConfig, RetryPolicy, Retryable};
pub use bus::{Acker, BusError, BusMessage, Delivery, InMemoryBus, MessageBus, Subscription};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore, MemoryCheckpointStore};
pub use config::{CheckpointStoreKind, PubSubConfig, RelayConfig};
pub use consumer::{
    ConsumerConfig, Decoded, EventHandler, MemoryEventStore, MessageConsumer, Outcome, Persistence,
    UpsertHandler, UpsertSession,
};
pub use error::RelayError;
pub use event::{derive_event_id, CanonicalEvent, EventStatus, Severity};
pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use outbound::{
    MemoryOutboundStore, OutboundLedger, OutboundMessage, OutboundStatus, OutboundStore, RetryRejection,
};
pub use publisher::EventPublisher;
pub use registry::{KnownEntityRegistry, MemoryRegistryStore, RegistrySnapshot, RegistryStore};
pub use retry::{RetryCoordinator, RetryDecision};
pub use source::{SourceId, SourceLease, SourceLeases};
