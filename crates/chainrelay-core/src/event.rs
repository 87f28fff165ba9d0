//! Canonical events — the normalized form of a raw source log, as carried on
//! the message bus.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::keccak256;
use serde::{Deserialize, Serialize};

/// Lifecycle status carried by a canonical event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Received,
    Sent,
    Confirmed,
    Failed,
}

impl EventStatus {
    /// Routing severity attached to bus messages.
    pub fn severity(&self) -> Severity {
        match self {
            Self::Failed => Severity::Error,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received => write!(f, "RECEIVED"),
            Self::Sent => write!(f, "SENT"),
            Self::Confirmed => write!(f, "CONFIRMED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RECEIVED" => Ok(Self::Received),
            "SENT" => Ok(Self::Sent),
            "CONFIRMED" => Ok(Self::Confirmed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown event status '{other}'")),
        }
    }
}

/// Severity routing attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Error => "error",
        }
    }
}

/// A normalized, deterministically identified source event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    /// Derived from (chain id, tx hash, log index); see [`derive_event_id`].
    pub event_id: String,
    /// Event name as configured (e.g. `"EscrowCreated"`).
    pub event_type: String,
    /// Command the event belongs to (indexed `bytes32`, or the tx hash).
    pub command_id: String,
    /// Correlation id shared by every event of one workflow.
    #[serde(alias = "correlation_id")]
    pub workflow_id: String,
    pub status: EventStatus,
    #[serde(default)]
    pub payer: Option<String>,
    #[serde(default)]
    pub payee: Option<String>,
    /// Decimal amount, if the log carries one.
    #[serde(default)]
    pub amount: Option<String>,
    pub chain_id: u64,
    /// Unix timestamp of the block that emitted the log.
    #[serde(default)]
    pub occurred_at: Option<i64>,
    #[serde(default)]
    pub block_number: u64,
    #[serde(default)]
    pub tx_hash: String,
    #[serde(default)]
    pub log_index: u32,
}

impl CanonicalEvent {
    pub fn correlation_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn severity(&self) -> Severity {
        self.status.severity()
    }
}

/// Derive the globally unique id of the event emitted by log `log_index` of
/// transaction `tx_hash` on `chain_id`.
///
/// The same log always maps to the same id, so re-publishing a range after a
/// crash is detectable by consumers.
pub fn derive_event_id(chain_id: u64, tx_hash: &str, log_index: u32) -> String {
    let preimage = format!("{chain_id}:{}:{log_index}", tx_hash.trim().to_ascii_lowercase());
    format!("0x{}", hex::encode(keccak256(preimage.as_bytes())))
}
