//! Message consumer — pulls canonical events off the bus and applies them
//! through a transactional handler.
//!
//! Each delivery is handled inside its own persistence session:
//!
//! ```text
//! decode ──invalid──▶ nack (decode_errors)
//!   │
//!   ▼
//! begin ─▶ handle ─ok─▶ commit ─ok─▶ ack
//!            │                │
//!           err              err
//!            ▼                ▼
//!        rollback ─▶ nack (handler_failures)
//! ```
//!
//! Delivery is at-least-once, so handlers must be idempotent (upsert by
//! `event_id`). Deliveries are processed concurrently; no ordering across
//! messages is assumed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{Delivery, Subscription};
use crate::error::RelayError;
use crate::event::CanonicalEvent;
use crate::metrics::RelayMetrics;
use crate::publisher::OUTBOUND_EVENT_TYPE;

/// Scoped persistence resource handed to handlers.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    type Session: Send + 'static;

    async fn begin(&self) -> Result<Self::Session, RelayError>;
    async fn commit(&self, session: Self::Session) -> Result<(), RelayError>;
    async fn rollback(&self, session: Self::Session) -> Result<(), RelayError>;
}

/// Applies one canonical event inside a session.
#[async_trait]
pub trait EventHandler<S: Send>: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn handle(&self, event: &CanonicalEvent, session: &mut S) -> Result<(), RelayError>;
}

/// Sessions that can upsert events by id.
#[async_trait]
pub trait UpsertSession: Send {
    async fn upsert_event(&mut self, event: &CanonicalEvent) -> Result<(), RelayError>;
}

/// The default idempotent handler: writes each event keyed by `event_id`,
/// replacing any earlier copy.
#[derive(Debug, Default, Clone, Copy)]
pub struct UpsertHandler;

#[async_trait]
impl<S: UpsertSession + 'static> EventHandler<S> for UpsertHandler {
    fn name(&self) -> &str {
        "upsert"
    }

    async fn handle(&self, event: &CanonicalEvent, session: &mut S) -> Result<(), RelayError> {
        session.upsert_event(event).await
    }
}

/// Result of decoding a delivery body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Valid(CanonicalEvent),
    Invalid(String),
}

impl Decoded {
    pub fn from_bytes(data: &[u8]) -> Self {
        match serde_json::from_slice::<CanonicalEvent>(data) {
            Ok(event) if event.event_id.trim().is_empty() => Self::Invalid("empty event_id".into()),
            Ok(event) => Self::Valid(event),
            Err(e) => Self::Invalid(e.to_string()),
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Handler committed; message acknowledged.
    Acked,
    /// Undecodable; nacked without invoking the handler.
    Rejected(String),
    /// Handler or commit failed; rolled back and nacked.
    Failed(String),
    /// Not a canonical event (an outbound relay message); acknowledged
    /// without invoking the handler.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Maximum deliveries processed concurrently.
    pub max_in_flight: usize,
    /// Pause after a failed pull.
    pub error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            error_backoff: Duration::from_secs(1),
        }
    }
}

pub struct MessageConsumer<P: Persistence, H: EventHandler<P::Session>> {
    subscription: Arc<dyn Subscription>,
    persistence: Arc<P>,
    handler: Arc<H>,
    metrics: Arc<RelayMetrics>,
    config: ConsumerConfig,
}

impl<P: Persistence, H: EventHandler<P::Session>> Clone for MessageConsumer<P, H> {
    fn clone(&self) -> Self {
        Self {
            subscription: Arc::clone(&self.subscription),
            persistence: Arc::clone(&self.persistence),
            handler: Arc::clone(&self.handler),
            metrics: Arc::clone(&self.metrics),
            config: self.config.clone(),
        }
    }
}

impl<P: Persistence, H: EventHandler<P::Session>> MessageConsumer<P, H> {
    pub fn new(
        subscription: Arc<dyn Subscription>,
        persistence: Arc<P>,
        handler: Arc<H>,
        metrics: Arc<RelayMetrics>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            subscription,
            persistence,
            handler,
            metrics,
            config,
        }
    }

    /// Decode, handle, and settle a single delivery.
    pub async fn process(&self, delivery: Delivery) -> Outcome {
        if delivery.attributes.get("event_type").map(String::as_str) == Some(OUTBOUND_EVENT_TYPE) {
            debug!(message_id = %delivery.message_id, "outbound relay message, not an event");
            self.settle(delivery, true).await;
            return Outcome::Ignored;
        }

        let event = match Decoded::from_bytes(&delivery.data) {
            Decoded::Valid(event) => event,
            Decoded::Invalid(reason) => {
                RelayMetrics::incr(&self.metrics.decode_errors);
                warn!(
                    message_id = %delivery.message_id,
                    attempt = delivery.attempt,
                    %reason,
                    "undecodable message, nacking"
                );
                self.settle(delivery, false).await;
                return Outcome::Rejected(reason);
            }
        };

        match self.apply(&event).await {
            Ok(()) => {
                RelayMetrics::incr(&self.metrics.events_consumed);
                debug!(event_id = %event.event_id, event_type = %event.event_type, "event applied");
                self.settle(delivery, true).await;
                Outcome::Acked
            }
            Err(e) => {
                RelayMetrics::incr(&self.metrics.handler_failures);
                error!(
                    handler = self.handler.name(),
                    message_id = %delivery.message_id,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    correlation_id = %event.workflow_id,
                    attempt = delivery.attempt,
                    error = %e,
                    "handler failed, nacking for redelivery"
                );
                self.settle(delivery, false).await;
                Outcome::Failed(e.to_string())
            }
        }
    }

    async fn apply(&self, event: &CanonicalEvent) -> Result<(), RelayError> {
        let mut session = self.persistence.begin().await?;
        match self.handler.handle(event, &mut session).await {
            Ok(()) => self.persistence.commit(session).await,
            Err(e) => {
                if let Err(rb) = self.persistence.rollback(session).await {
                    error!(event_id = %event.event_id, error = %rb, "rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn settle(&self, delivery: Delivery, ack: bool) {
        let message_id = delivery.message_id.clone();
        let result = if ack {
            delivery.ack().await
        } else {
            delivery.nack().await
        };
        if let Err(e) = result {
            RelayMetrics::incr(&self.metrics.ack_errors);
            error!(%message_id, ack, error = %e, "failed to settle delivery");
        }
    }

    /// Pull and process deliveries until `cancel` fires, then finish every
    /// in-flight delivery before returning.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), RelayError> {
        let mut tasks: JoinSet<Outcome> = JoinSet::new();
        let max_in_flight = self.config.max_in_flight.max(1);
        info!(handler = self.handler.name(), max_in_flight, "consumer started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let capacity = max_in_flight.saturating_sub(tasks.len());

            tokio::select! {
                biased;

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "consumer task panicked");
                    }
                }

                _ = cancel.cancelled() => break,

                pulled = self.subscription.pull(capacity), if capacity > 0 => {
                    match pulled {
                        Ok(deliveries) => {
                            for delivery in deliveries {
                                let worker = self.clone();
                                tasks.spawn(async move { worker.process(delivery).await });
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "pull failed");
                            tokio::time::sleep(self.config.error_backoff).await;
                        }
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "consumer stopping, draining in-flight messages");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "consumer task panicked");
            }
        }
        info!("consumer stopped");
        Ok(())
    }
}

// ─── In-memory event store ────────────────────────────────────────────────────

/// Event store keeping committed events in a map keyed by `event_id`.
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<BTreeMap<String, CanonicalEvent>>,
}

/// Writes staged in a [`MemoryEventStore`] session until commit.
#[derive(Debug, Default)]
pub struct MemorySession {
    staged: Vec<CanonicalEvent>,
}

#[async_trait]
impl UpsertSession for MemorySession {
    async fn upsert_event(&mut self, event: &CanonicalEvent) -> Result<(), RelayError> {
        self.staged.push(event.clone());
        Ok(())
    }
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, event_id: &str) -> Option<CanonicalEvent> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(event_id)
            .cloned()
    }

    /// All committed events ordered by id.
    pub fn all(&self) -> Vec<CanonicalEvent> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Persistence for MemoryEventStore {
    type Session = MemorySession;

    async fn begin(&self) -> Result<MemorySession, RelayError> {
        Ok(MemorySession::default())
    }

    async fn commit(&self, session: MemorySession) -> Result<(), RelayError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| RelayError::Storage("event map poisoned".into()))?;
        for event in session.staged {
            events.insert(event.event_id.clone(), event);
        }
        Ok(())
    }

    async fn rollback(&self, _session: MemorySession) -> Result<(), RelayError> {
        Ok(())
    }
}
