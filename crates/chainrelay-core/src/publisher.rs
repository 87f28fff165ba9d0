//! Event publisher. Serializes canonical events and outbound messages onto
//! the bus with routing attributes.
//!
//! Batches are best-effort: each event gets its own result. A publish that
//! is not acknowledged within the timeout counts as failed; retrying it is
//! safe because event ids are deterministic.

use std::sync::Arc;
use std::time::Duration;

use crate::bus::{BusError, BusMessage, MessageBus};
use crate::event::CanonicalEvent;
use crate::metrics::RelayMetrics;
use crate::outbound::OutboundMessage;

/// `event_type` attribute used for re-published cross-chain messages.
pub const OUTBOUND_EVENT_TYPE: &str = "CrossChainMessage";

pub struct EventPublisher {
    bus: Arc<dyn MessageBus>,
    timeout: Duration,
    metrics: Arc<RelayMetrics>,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn MessageBus>, timeout: Duration, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            bus,
            timeout,
            metrics,
        }
    }

    pub fn bus_name(&self) -> &str {
        self.bus.name()
    }

    /// Routing attributes attached to a canonical event.
    pub fn attributes_for(event: &CanonicalEvent) -> BusMessage {
        let mut msg = BusMessage::default()
            .attribute("event_id", event.event_id.clone())
            .attribute("event_type", event.event_type.clone())
            .attribute("correlation_id", event.workflow_id.clone())
            .attribute("severity", event.severity().as_str())
            .ordering_key(event.workflow_id.clone());
        if let Some(payer) = &event.payer {
            msg = msg.attribute("user_id", payer.clone());
        }
        msg
    }

    /// Publish one event; returns the bus delivery id.
    pub async fn publish(&self, event: &CanonicalEvent) -> Result<String, BusError> {
        let data = serde_json::to_vec(event).map_err(|e| BusError::Rejected(e.to_string()))?;
        let mut message = Self::attributes_for(event);
        message.data = data;

        match self.send(message).await {
            Ok(id) => {
                RelayMetrics::incr(&self.metrics.events_published);
                tracing::debug!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    delivery_id = %id,
                    "event published"
                );
                Ok(id)
            }
            Err(e) => {
                RelayMetrics::incr(&self.metrics.publish_errors);
                tracing::error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %e,
                    "event publish failed"
                );
                Err(e)
            }
        }
    }

    /// Publish every event in order, reporting each outcome individually.
    ///
    /// Events are sent one after another so that messages sharing an
    /// ordering key reach the bus in log order.
    pub async fn publish_batch(&self, events: &[CanonicalEvent]) -> Vec<Result<String, BusError>> {
        let mut results = Vec::with_capacity(events.len());
        for event in events {
            results.push(self.publish(event).await);
        }
        results
    }

    /// Re-publish an outbound cross-chain message under its original id.
    pub async fn publish_outbound(&self, record: &OutboundMessage) -> Result<String, BusError> {
        let message = BusMessage::new(record.payload.clone().into_bytes())
            .attribute("event_type", OUTBOUND_EVENT_TYPE)
            .attribute("message_id", record.message_id.clone())
            .attribute("correlation_id", record.message_id.clone())
            .attribute("source_chain", record.source_chain.to_string())
            .attribute("destination_chain", record.destination_chain.to_string())
            .attribute("retry_count", record.retry_count.to_string())
            .attribute("severity", "info")
            .ordering_key(record.message_id.clone());
        let id = self.send(message).await.map_err(|e| {
            RelayMetrics::incr(&self.metrics.publish_errors);
            tracing::error!(message_id = %record.message_id, error = %e, "outbound publish failed");
            e
        })?;
        tracing::info!(
            message_id = %record.message_id,
            retry_count = record.retry_count,
            delivery_id = %id,
            "outbound message published"
        );
        Ok(id)
    }

    async fn send(&self, message: BusMessage) -> Result<String, BusError> {
        match tokio::time::timeout(self.timeout, self.bus.publish(message)).await {
            Ok(result) => result,
            Err(_) => Err(BusError::timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBus, PublishFault};
    use crate::event::{derive_event_id, EventStatus};
    use async_trait::async_trait;

    fn sample_event(log_index: u32, status: EventStatus) -> CanonicalEvent {
        CanonicalEvent {
            event_id: derive_event_id(1, "0xtx", log_index),
            event_type: "Settled".into(),
            command_id: "0xc0ffee".into(),
            workflow_id: "0xescrow".into(),
            status,
            payer: Some("0xpayer".into()),
            payee: Some("0xpayee".into()),
            amount: Some("1000".into()),
            chain_id: 1,
            occurred_at: Some(1_700_000_000),
            block_number: 101,
            tx_hash: "0xtx".into(),
            log_index,
        }
    }

    fn publisher(bus: Arc<dyn MessageBus>) -> EventPublisher {
        EventPublisher::new(bus, Duration::from_millis(100), Arc::new(RelayMetrics::new()))
    }

    #[tokio::test]
    async fn attaches_routing_attributes() {
        let bus = InMemoryBus::new();
        let p = publisher(Arc::new(bus.clone()));
        p.publish(&sample_event(0, EventStatus::Failed)).await.unwrap();

        let (_, msg) = bus.published().pop().unwrap();
        assert_eq!(msg.attributes["event_type"], "Settled");
        assert_eq!(msg.attributes["correlation_id"], "0xescrow");
        assert_eq!(msg.attributes["user_id"], "0xpayer");
        assert_eq!(msg.attributes["severity"], "error");
        assert_eq!(msg.ordering_key.as_deref(), Some("0xescrow"));

        let body: CanonicalEvent = serde_json::from_slice(&msg.data).unwrap();
        assert_eq!(body, sample_event(0, EventStatus::Failed));
    }

    #[tokio::test]
    async fn batch_reports_each_failure() {
        let bus = InMemoryBus::new();
        bus.set_publish_fault(PublishFault::FailAfter(1));
        let p = publisher(Arc::new(bus.clone()));

        let events = vec![
            sample_event(0, EventStatus::Received),
            sample_event(1, EventStatus::Received),
        ];
        let results = p.publish_batch(&events).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
    }

    struct StuckBus;

    #[async_trait]
    impl MessageBus for StuckBus {
        async fn publish(&self, _message: BusMessage) -> Result<String, BusError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("never".into())
        }
        fn name(&self) -> &str {
            "stuck"
        }
    }

    #[tokio::test]
    async fn unacknowledged_publish_times_out() {
        let p = publisher(Arc::new(StuckBus));
        let err = p.publish(&sample_event(0, EventStatus::Sent)).await.unwrap_err();
        assert!(matches!(err, BusError::Timeout { ms: 100 }));
        assert!(err.is_retryable());
    }
}
