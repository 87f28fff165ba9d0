//! Message bus abstraction — the durable hand-off between the scanner side
//! (publisher) and the consumer side.
//!
//! The bus guarantees at-least-once delivery: a message that is negatively
//! acknowledged (or never acknowledged) is delivered again. Backends live in
//! `chainrelay-bus`; [`InMemoryBus`] here backs tests and single-process runs.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;

/// Errors returned by bus backends.
#[derive(Debug, Error)]
pub enum BusError {
    /// No acknowledgment from the bus within the publish timeout.
    #[error("Publish timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Connection / HTTP failure talking to the bus.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The bus refused the request (bad topic, permissions, payload, ...).
    #[error("Rejected by bus: {0}")]
    Rejected(String),

    #[error("Ack/nack failed: {0}")]
    Ack(String),

    #[error("Bus closed")]
    Closed,
}

impl BusError {
    /// Timeout after `elapsed`, saturating at `u64::MAX` milliseconds.
    pub fn timeout(elapsed: Duration) -> Self {
        Self::Timeout {
            ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Returns `true` if the operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport(_))
    }
}

/// An outgoing bus message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusMessage {
    pub data: Vec<u8>,
    /// Routing attributes for downstream filtering.
    pub attributes: BTreeMap<String, String>,
    /// Messages sharing a key are delivered in publish order, if the bus supports it.
    pub ordering_key: Option<String>,
}

impl BusMessage {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    pub fn attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }
}

/// Producer side of the bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish one message; returns the bus-assigned delivery id once the bus
    /// has durably accepted it.
    async fn publish(&self, message: BusMessage) -> Result<String, BusError>;

    /// Backend name for logs (`"memory"`, `"pubsub"`).
    fn name(&self) -> &str;

    async fn close(&self) -> Result<(), BusError> {
        Ok(())
    }
}

/// Consumer side of the bus.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Wait briefly for up to `max` deliveries; an empty vec means none arrived.
    async fn pull(&self, max: usize) -> Result<Vec<Delivery>, BusError>;
}

/// Settles a single delivery with the bus.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BusError>;
    /// Request redelivery.
    async fn nack(&self) -> Result<(), BusError>;
}

/// A message received from a subscription.
pub struct Delivery {
    pub message_id: String,
    pub data: Vec<u8>,
    pub attributes: BTreeMap<String, String>,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        message_id: impl Into<String>,
        data: Vec<u8>,
        attributes: BTreeMap<String, String>,
        attempt: u32,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            data,
            attributes,
            attempt,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    pub async fn nack(self) -> Result<(), BusError> {
        self.acker.nack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message_id)
            .field("attributes", &self.attributes)
            .field("attempt", &self.attempt)
            .finish()
    }
}

// ─── In-memory bus ────────────────────────────────────────────────────────────

/// Fault injected into [`InMemoryBus::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishFault {
    #[default]
    None,
    /// Fail the next `n` publishes, then recover.
    FailNext(usize),
    /// Let `n` more publishes succeed, then fail every one after.
    FailAfter(usize),
}

#[derive(Debug, Clone)]
struct Stored {
    id: String,
    message: BusMessage,
    attempt: u32,
}

#[derive(Default)]
struct MemState {
    next_id: u64,
    queue: VecDeque<Stored>,
    published: Vec<(String, BusMessage)>,
    acked: Vec<String>,
    nacked: Vec<String>,
    fault: PublishFault,
}

/// Single-process bus with at-least-once semantics: nacked deliveries go
/// back to the end of the queue with their attempt counter bumped.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<MemState>>,
    notify: Arc<Notify>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut state)
    }

    pub fn set_publish_fault(&self, fault: PublishFault) {
        self.with_state(|s| s.fault = fault);
    }

    /// Every message accepted so far, with its delivery id.
    pub fn published(&self) -> Vec<(String, BusMessage)> {
        self.with_state(|s| s.published.clone())
    }

    pub fn acked(&self) -> Vec<String> {
        self.with_state(|s| s.acked.clone())
    }

    pub fn nacked(&self) -> Vec<String> {
        self.with_state(|s| s.nacked.clone())
    }

    /// Messages waiting for delivery.
    pub fn pending(&self) -> usize {
        self.with_state(|s| s.queue.len())
    }

    /// A subscription reading from this bus.
    pub fn subscribe(&self) -> InMemorySubscription {
        InMemorySubscription {
            bus: self.clone(),
            wait: Duration::from_millis(200),
        }
    }

    fn requeue(&self, mut stored: Stored) {
        self.with_state(|s| {
            s.nacked.push(stored.id.clone());
            stored.attempt += 1;
            s.queue.push_back(stored);
        });
        self.notify.notify_one();
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, message: BusMessage) -> Result<String, BusError> {
        let id = self.with_state(|s| {
            match s.fault {
                PublishFault::None => {}
                PublishFault::FailNext(0) => s.fault = PublishFault::None,
                PublishFault::FailNext(n) => {
                    s.fault = PublishFault::FailNext(n - 1);
                    return Err(BusError::Transport("injected publish failure".into()));
                }
                PublishFault::FailAfter(0) => {
                    return Err(BusError::Transport("injected publish failure".into()));
                }
                PublishFault::FailAfter(n) => s.fault = PublishFault::FailAfter(n - 1),
            }
            s.next_id += 1;
            let id = format!("mem-{}", s.next_id);
            s.published.push((id.clone(), message.clone()));
            s.queue.push_back(Stored {
                id: id.clone(),
                message,
                attempt: 1,
            });
            Ok(id)
        })?;
        self.notify.notify_one();
        Ok(id)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Pull-based reader over an [`InMemoryBus`].
pub struct InMemorySubscription {
    bus: InMemoryBus,
    wait: Duration,
}

impl InMemorySubscription {
    fn take(&self, max: usize) -> Vec<Stored> {
        self.bus.with_state(|s| {
            let n = max.min(s.queue.len());
            s.queue.drain(..n).collect()
        })
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn pull(&self, max: usize) -> Result<Vec<Delivery>, BusError> {
        let mut taken = self.take(max);
        if taken.is_empty() {
            let _ = tokio::time::timeout(self.wait, self.bus.notify.notified()).await;
            taken = self.take(max);
        }
        Ok(taken
            .into_iter()
            .map(|stored| {
                Delivery::new(
                    stored.id.clone(),
                    stored.message.data.clone(),
                    stored.message.attributes.clone(),
                    stored.attempt,
                    Box::new(MemAcker {
                        bus: self.bus.clone(),
                        stored,
                    }),
                )
            })
            .collect())
    }
}

struct MemAcker {
    bus: InMemoryBus,
    stored: Stored,
}

#[async_trait]
impl Acker for MemAcker {
    async fn ack(&self) -> Result<(), BusError> {
        let id = self.stored.id.clone();
        self.bus.with_state(|s| s.acked.push(id));
        Ok(())
    }

    async fn nack(&self) -> Result<(), BusError> {
        self.bus.requeue(self.stored.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_millis_saturate() {
        assert!(matches!(BusError::timeout(Duration::from_millis(1500)), BusError::Timeout { ms: 1500 }));
        assert!(matches!(BusError::timeout(Duration::MAX), BusError::Timeout { ms: u64::MAX }));
        assert!(BusError::timeout(Duration::MAX).is_retryable());
    }

    #[tokio::test]
    async fn nack_redelivers_with_higher_attempt() {
        let bus = InMemoryBus::new();
        let sub = bus.subscribe();
        bus.publish(BusMessage::new(b"hello".to_vec()).attribute("event_type", "Settled"))
            .await
            .unwrap();

        let first = sub.pull(10).await.unwrap().pop().unwrap();
        assert_eq!(first.attempt, 1);
        assert_eq!(first.attributes["event_type"], "Settled");
        first.nack().await.unwrap();

        let second = sub.pull(10).await.unwrap().pop().unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.data, b"hello");
        second.ack().await.unwrap();

        assert_eq!(bus.nacked(), vec!["mem-1"]);
        assert_eq!(bus.acked(), vec!["mem-1"]);
        assert_eq!(bus.pending(), 0);
    }

    #[tokio::test]
    async fn fault_injection() {
        let bus = InMemoryBus::new();
        bus.set_publish_fault(PublishFault::FailAfter(1));
        assert!(bus.publish(BusMessage::new(vec![1])).await.is_ok());
        assert!(bus.publish(BusMessage::new(vec![2])).await.is_err());
        assert!(bus.publish(BusMessage::new(vec![3])).await.is_err());

        bus.set_publish_fault(PublishFault::FailNext(1));
        assert!(bus.publish(BusMessage::new(vec![4])).await.is_err());
        assert!(bus.publish(BusMessage::new(vec![5])).await.is_ok());
        assert_eq!(bus.published().len(), 2);
    }

    #[tokio::test]
    async fn empty_pull_returns_after_wait() {
        let bus = InMemoryBus::new();
        let sub = bus.subscribe();
        assert!(sub.pull(5).await.unwrap().is_empty());
    }
}
