//! chainrelay-bus — message bus backends for ChainRelay.
//!
//! - [`pubsub`] — Google Cloud Pub/Sub over REST (publish, pull, ack, nack)
//! - [`connect_bus`] — chooses Pub/Sub or the in-memory bus from
//!   [`chainrelay_core::PubSubConfig`]

pub mod factory;
pub mod pubsub;

pub use factory::{connect_bus, BusHandle};
pub use pubsub::{PubSubBus, PubSubSubscription, DEFAULT_ENDPOINT};
