//! Error types for the chainrelay pipeline.

use thiserror::Error;

use crate::bus::BusError;
use crate::outbound::RetryRejection;

/// Errors that can occur while scanning, relaying, or consuming events.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Transient source failure (RPC timeout, provider rate limit, ...).
    #[error("RPC error: {0}")]
    Rpc(String),

    /// A checkpoint, registry, or record could not be read or written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// One or more events of a batch were not accepted by the bus.
    #[error("Publish failed for {failed} of {total} events: {reason}")]
    Publish {
        failed: usize,
        total: usize,
        reason: String,
    },

    #[error(transparent)]
    Bus(#[from] BusError),

    /// A bus message could not be decoded into a canonical event.
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Handler error in '{handler}': {reason}")]
    Handler { handler: String, reason: String },

    #[error("Outbound message not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for {message_id}: {from} -> {to}")]
    InvalidTransition {
        message_id: String,
        from: String,
        to: String,
    },

    #[error("Retry rejected: {0}")]
    RetryRejected(RetryRejection),

    /// Another scanner already holds this source.
    #[error("Source already being scanned: {0}")]
    SourceBusy(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Returns `true` if retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Rpc(_) | Self::Publish { .. } => true,
            Self::Bus(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
