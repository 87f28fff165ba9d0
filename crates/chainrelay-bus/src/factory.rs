//! Picks the bus backend once at startup.

use std::sync::Arc;
use std::time::Duration;

use chainrelay_core::bus::{BusError, InMemoryBus, MessageBus, Subscription};
use chainrelay_core::config::PubSubConfig;
use tracing::{info, warn};

use crate::pubsub::PubSubBus;

/// The producer and (optional) consumer side of the chosen bus.
pub struct BusHandle {
    pub bus: Arc<dyn MessageBus>,
    /// `None` when the backend has no subscription configured.
    pub subscription: Option<Arc<dyn Subscription>>,
}

impl BusHandle {
    pub fn name(&self) -> &str {
        self.bus.name()
    }
}

/// Pub/Sub when project and topic are configured, otherwise an in-memory
/// bus that only reaches consumers inside this process.
pub fn connect_bus(config: &PubSubConfig, publish_timeout: Duration) -> Result<BusHandle, BusError> {
    if !config.is_configured() {
        warn!("pubsub not configured, using in-memory bus (events do not leave this process)");
        let bus = InMemoryBus::new();
        return Ok(BusHandle {
            subscription: Some(Arc::new(bus.subscribe())),
            bus: Arc::new(bus),
        });
    }

    let bus = PubSubBus::new(config, publish_timeout)?;
    let subscription = config
        .subscription_id
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|id| Arc::new(bus.subscription(id)) as Arc<dyn Subscription>);
    info!(
        topic = %bus.topic_path(),
        endpoint = %bus.endpoint(),
        consumer = subscription.is_some(),
        "using pubsub bus"
    );
    Ok(BusHandle {
        bus: Arc::new(bus),
        subscription,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainrelay_core::bus::BusMessage;

    #[tokio::test]
    async fn unconfigured_falls_back_to_memory() {
        let handle = connect_bus(&PubSubConfig::default(), Duration::from_secs(1)).unwrap();
        assert_eq!(handle.name(), "memory");

        handle.bus.publish(BusMessage::new(b"x".to_vec())).await.unwrap();
        let sub = handle.subscription.unwrap();
        let got = sub.pull(10).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].data, b"x");
    }

    #[test]
    fn configured_uses_pubsub() {
        let config = PubSubConfig {
            project_id: Some("p".into()),
            topic_id: Some("t".into()),
            ..Default::default()
        };
        let handle = connect_bus(&config, Duration::from_secs(1)).unwrap();
        assert_eq!(handle.name(), "pubsub");
        assert!(handle.subscription.is_none());
    }
}
