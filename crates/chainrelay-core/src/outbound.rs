//! Outbound cross-chain message records and the ledger that mutates them.
//!
//! Records are never deleted. Every mutation is a single-record
//! read-modify-write guarded by the record's `version`: the write only lands
//! if nobody else wrote the record since it was read, otherwise the ledger
//! re-reads and re-applies the change.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backoff::{RetryConfig, RetryPolicy};
use crate::error::RelayError;
use crate::publisher::EventPublisher;

/// Backoff between compare-and-swap attempts that lost a race. Jitter
/// spreads contending writers apart.
fn conflict_backoff() -> RetryPolicy {
    RetryPolicy::new(RetryConfig {
        max_retries: 32,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(50),
        multiplier: 2.0,
        jitter_fraction: 0.5,
    })
}

/// Delivery status of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundStatus {
    Pending,
    Sent,
    Confirmed,
    Delivered,
    Failed,
    Retrying,
}

impl OutboundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Confirmed => "CONFIRMED",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
            Self::Retrying => "RETRYING",
        }
    }

    /// Transitions the delivery pipeline may perform. `FAILED → RETRYING`
    /// is reserved for the retry coordinator and not listed here.
    pub fn can_advance_to(self, to: OutboundStatus) -> bool {
        use OutboundStatus::*;
        matches!(
            (self, to),
            (Pending, Sent)
                | (Retrying, Sent)
                | (Sent, Confirmed)
                | (Confirmed, Delivered)
                | (Pending | Sent | Confirmed | Retrying, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

impl fmt::Display for OutboundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboundStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "SENT" => Ok(Self::Sent),
            "CONFIRMED" => Ok(Self::Confirmed),
            "DELIVERED" => Ok(Self::Delivered),
            "FAILED" => Ok(Self::Failed),
            "RETRYING" => Ok(Self::Retrying),
            other => Err(RelayError::Decode(format!("unknown outbound status '{other}'"))),
        }
    }
}

/// Why a retry request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RetryRejection {
    /// Only `FAILED` messages can be retried.
    NotFailed { status: OutboundStatus },
    /// The retry budget is spent; needs operator intervention.
    BudgetExhausted { retry_count: u32, max_retries: u32 },
}

impl fmt::Display for RetryRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFailed { status } => write!(f, "message is {status}, not FAILED"),
            Self::BudgetExhausted {
                retry_count,
                max_retries,
            } => write!(f, "retry budget exhausted ({retry_count}/{max_retries})"),
        }
    }
}

/// A cross-chain message relay request and its delivery state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub message_id: String,
    pub status: OutboundStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub source_chain: u64,
    pub destination_chain: u64,
    /// Opaque payload, re-published verbatim on retry.
    pub payload: String,
    pub last_error: Option<String>,
    /// Bumped on every write; used for compare-and-swap.
    pub version: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl OutboundMessage {
    pub fn new(
        source_chain: u64,
        destination_chain: u64,
        payload: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            status: OutboundStatus::Pending,
            retry_count: 0,
            max_retries,
            source_chain,
            destination_chain,
            payload: payload.into(),
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a delivery-pipeline transition.
    pub fn advance(&mut self, to: OutboundStatus, error: Option<String>) -> Result<(), RelayError> {
        if !self.status.can_advance_to(to) {
            return Err(RelayError::InvalidTransition {
                message_id: self.message_id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        if to == OutboundStatus::Failed {
            self.last_error = error;
        }
        Ok(())
    }

    /// Check whether a retry would be accepted, without changing anything.
    pub fn check_retry(&self) -> Result<(), RetryRejection> {
        if self.status != OutboundStatus::Failed {
            return Err(RetryRejection::NotFailed {
                status: self.status,
            });
        }
        if self.retry_count >= self.max_retries {
            return Err(RetryRejection::BudgetExhausted {
                retry_count: self.retry_count,
                max_retries: self.max_retries,
            });
        }
        Ok(())
    }

    /// `FAILED → RETRYING`, consuming one unit of the retry budget.
    pub fn begin_retry(&mut self) -> Result<(), RetryRejection> {
        self.check_retry()?;
        self.status = OutboundStatus::Retrying;
        self.retry_count += 1;
        Ok(())
    }
}

/// Persistence for outbound message records.
#[async_trait]
pub trait OutboundStore: Send + Sync {
    /// Insert a new record; fails if the id already exists.
    async fn insert(&self, record: &OutboundMessage) -> Result<(), RelayError>;

    async fn get(&self, message_id: &str) -> Result<Option<OutboundMessage>, RelayError>;

    /// Replace the stored record with `record` only if the stored version is
    /// still `expected_version`. Returns `false` on a version conflict.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        record: &OutboundMessage,
    ) -> Result<bool, RelayError>;

    /// All records, optionally filtered by status, oldest first.
    async fn list(&self, status: Option<OutboundStatus>) -> Result<Vec<OutboundMessage>, RelayError>;
}

/// Single entry point for creating and transitioning outbound records.
#[derive(Clone)]
pub struct OutboundLedger {
    store: Arc<dyn OutboundStore>,
}

impl OutboundLedger {
    pub fn new(store: Arc<dyn OutboundStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn OutboundStore> {
        &self.store
    }

    pub async fn get(&self, message_id: &str) -> Result<OutboundMessage, RelayError> {
        self.store
            .get(message_id)
            .await?
            .ok_or_else(|| RelayError::NotFound(message_id.to_string()))
    }

    /// Record a new relay request in `PENDING`.
    pub async fn request_relay(
        &self,
        source_chain: u64,
        destination_chain: u64,
        payload: impl Into<String>,
        max_retries: u32,
    ) -> Result<OutboundMessage, RelayError> {
        let record = OutboundMessage::new(source_chain, destination_chain, payload, max_retries);
        self.store.insert(&record).await?;
        tracing::info!(
            message_id = %record.message_id,
            source_chain,
            destination_chain,
            "relay requested"
        );
        Ok(record)
    }

    /// Publish a `PENDING` or `RETRYING` message and mark it `SENT`; on
    /// publish failure the message is marked `FAILED`.
    pub async fn dispatch(
        &self,
        message_id: &str,
        publisher: &EventPublisher,
    ) -> Result<OutboundMessage, RelayError> {
        let record = self.get(message_id).await?;
        if !record.status.can_advance_to(OutboundStatus::Sent) {
            return Err(RelayError::InvalidTransition {
                message_id: message_id.to_string(),
                from: record.status.to_string(),
                to: OutboundStatus::Sent.to_string(),
            });
        }
        match publisher.publish_outbound(&record).await {
            Ok(_) => self.advance(message_id, OutboundStatus::Sent, None).await,
            Err(e) => {
                self.advance(message_id, OutboundStatus::Failed, Some(e.to_string()))
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Publish every message still `PENDING`, e.g. requests recorded just
    /// before a crash. Failures leave the message `FAILED` for the retry
    /// coordinator. Returns `(sent, failed)`.
    pub async fn dispatch_pending(&self, publisher: &EventPublisher) -> Result<(usize, usize), RelayError> {
        let pending = self.store.list(Some(OutboundStatus::Pending)).await?;
        let (mut sent, mut failed) = (0, 0);
        for record in pending {
            match self.dispatch(&record.message_id, publisher).await {
                Ok(_) => sent += 1,
                Err(RelayError::Bus(e)) => {
                    failed += 1;
                    tracing::warn!(message_id = %record.message_id, error = %e, "pending message left FAILED");
                }
                Err(e) => return Err(e),
            }
        }
        Ok((sent, failed))
    }

    /// Apply a delivery-pipeline transition.
    pub async fn advance(
        &self,
        message_id: &str,
        to: OutboundStatus,
        error: Option<String>,
    ) -> Result<OutboundMessage, RelayError> {
        self.update(message_id, |record| record.advance(to, error.clone()))
            .await
    }

    /// Read-modify-write `message_id` with `apply`, backing off and
    /// retrying on version conflicts. An error from `apply` aborts without
    /// writing.
    pub async fn update<F>(&self, message_id: &str, mut apply: F) -> Result<OutboundMessage, RelayError>
    where
        F: FnMut(&mut OutboundMessage) -> Result<(), RelayError> + Send,
    {
        let backoff = conflict_backoff();
        let mut conflicts = 0u32;
        loop {
            let current = self.get(message_id).await?;
            let mut next = current.clone();
            apply(&mut next)?;
            next.version = current.version + 1;
            next.updated_at = chrono::Utc::now().timestamp();

            if self.store.compare_and_swap(current.version, &next).await? {
                tracing::debug!(
                    message_id,
                    from = %current.status,
                    to = %next.status,
                    version = next.version,
                    "outbound record updated"
                );
                return Ok(next);
            }
            conflicts += 1;
            let Some(delay) = backoff.next_delay(conflicts) else {
                return Err(RelayError::Storage(format!(
                    "gave up updating {message_id} after {conflicts} conflicting writes"
                )));
            };
            tracing::debug!(message_id, conflicts, "version conflict, re-reading record");
            tokio::time::sleep(delay).await;
        }
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryOutboundStore {
    records: Mutex<HashMap<String, OutboundMessage>>,
}

impl MemoryOutboundStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, OutboundMessage>>, RelayError> {
        self.records
            .lock()
            .map_err(|_| RelayError::Storage("outbound map poisoned".into()))
    }
}

#[async_trait]
impl OutboundStore for MemoryOutboundStore {
    async fn insert(&self, record: &OutboundMessage) -> Result<(), RelayError> {
        let mut records = self.lock()?;
        if records.contains_key(&record.message_id) {
            return Err(RelayError::Storage(format!(
                "outbound message {} already exists",
                record.message_id
            )));
        }
        records.insert(record.message_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, message_id: &str) -> Result<Option<OutboundMessage>, RelayError> {
        Ok(self.lock()?.get(message_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        record: &OutboundMessage,
    ) -> Result<bool, RelayError> {
        let mut records = self.lock()?;
        match records.get_mut(&record.message_id) {
            Some(stored) if stored.version == expected_version => {
                *stored = record.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RelayError::NotFound(record.message_id.clone())),
        }
    }

    async fn list(&self, status: Option<OutboundStatus>) -> Result<Vec<OutboundMessage>, RelayError> {
        let mut out: Vec<OutboundMessage> = self
            .lock()?
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.created_at, &a.message_id).cmp(&(b.created_at, &b.message_id)));
        Ok(out)
    }
}
