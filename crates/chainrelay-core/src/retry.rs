//! Retry coordinator for outbound cross-chain messages.
//!
//! Only `FAILED` messages with budget left are retried. The budget check and
//! the `FAILED → RETRYING` transition happen in one compare-and-swap write,
//! so concurrent retry requests can never jointly exceed `max_retries`.

use std::sync::Arc;

use serde::Serialize;

use crate::error::RelayError;
use crate::metrics::RelayMetrics;
use crate::outbound::{OutboundLedger, OutboundStatus, RetryRejection};
use crate::publisher::EventPublisher;

/// Answer returned to the operator who asked for a retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryDecision {
    pub message_id: String,
    pub accepted: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: OutboundStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<RetryRejection>,
}

pub struct RetryCoordinator {
    ledger: OutboundLedger,
    publisher: Arc<EventPublisher>,
    metrics: Arc<RelayMetrics>,
}

impl RetryCoordinator {
    pub fn new(ledger: OutboundLedger, publisher: Arc<EventPublisher>, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            ledger,
            publisher,
            metrics,
        }
    }

    /// Retry a failed outbound message.
    ///
    /// Rejections (wrong status, budget spent) come back as
    /// `accepted: false` with the record untouched. An accepted retry
    /// re-publishes the original payload under the same message id and
    /// leaves the record `SENT`; if that publish fails the record returns to
    /// `FAILED` (the attempt stays counted) and the error is returned.
    pub async fn retry(&self, message_id: &str) -> Result<RetryDecision, RelayError> {
        let claimed = match self
            .ledger
            .update(message_id, |record| {
                record.begin_retry().map_err(RelayError::RetryRejected)
            })
            .await
        {
            Ok(record) => record,
            Err(RelayError::RetryRejected(rejection)) => {
                RelayMetrics::incr(&self.metrics.retries_rejected);
                let current = self.ledger.get(message_id).await?;
                tracing::info!(
                    message_id,
                    status = %current.status,
                    retry_count = current.retry_count,
                    max_retries = current.max_retries,
                    %rejection,
                    "retry rejected"
                );
                return Ok(RetryDecision {
                    message_id: message_id.to_string(),
                    accepted: false,
                    retry_count: current.retry_count,
                    max_retries: current.max_retries,
                    status: current.status,
                    rejection: Some(rejection),
                });
            }
            Err(e) => return Err(e),
        };

        RelayMetrics::incr(&self.metrics.retries_accepted);
        tracing::info!(
            message_id,
            retry_count = claimed.retry_count,
            max_retries = claimed.max_retries,
            "retry accepted"
        );

        let sent = self.ledger.dispatch(message_id, &self.publisher).await?;
        Ok(RetryDecision {
            message_id: message_id.to_string(),
            accepted: true,
            retry_count: sent.retry_count,
            max_retries: sent.max_retries,
            status: sent.status,
            rejection: None,
        })
    }
}
