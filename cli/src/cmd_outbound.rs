//! `chainrelay outbound`: record, publish and track cross-chain messages.
//! Messages that fail to publish stay `FAILED` until `chainrelay retry`.

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use chainrelay_bus::connect_bus;
use chainrelay_core::config::RelayConfig;
use chainrelay_core::error::RelayError;
use chainrelay_core::metrics::RelayMetrics;
use chainrelay_core::outbound::{OutboundLedger, OutboundMessage, OutboundStatus};
use chainrelay_core::publisher::EventPublisher;
use chainrelay_storage::open_stores;

async fn ledger(config: &RelayConfig) -> Result<OutboundLedger> {
    let stores = open_stores(config.checkpoint_store, &config.checkpoint_store_url).await?;
    Ok(OutboundLedger::new(stores.outbound))
}

/// Record a relay request with the configured retry budget and publish it.
pub async fn send(config: &RelayConfig, destination_chain: u64, payload: &str) -> Result<OutboundMessage> {
    serde_json::from_str::<serde_json::Value>(payload).context("payload must be JSON")?;
    let ledger = ledger(config).await?;
    let handle = connect_bus(&config.pubsub, config.publish_timeout())?;
    let publisher = EventPublisher::new(handle.bus, config.publish_timeout(), Arc::new(RelayMetrics::new()));

    let record = ledger
        .request_relay(config.chain_id, destination_chain, payload, config.max_retries)
        .await?;
    match ledger.dispatch(&record.message_id, &publisher).await {
        Ok(sent) => Ok(sent),
        Err(RelayError::Bus(e)) => {
            let failed = ledger.get(&record.message_id).await?;
            println!("{}", serde_json::to_string_pretty(&failed)?);
            bail!(
                "publishing {} failed ({e}); retry with `chainrelay retry {}`",
                record.message_id,
                record.message_id
            )
        }
        Err(e) => Err(e.into()),
    }
}

/// Report a delivery-pipeline transition (`CONFIRMED`, `DELIVERED`, `FAILED`).
pub async fn mark(
    config: &RelayConfig,
    message_id: &str,
    status: &str,
    error: Option<String>,
) -> Result<OutboundMessage> {
    let status: OutboundStatus = status.parse()?;
    let ledger = ledger(config).await?;
    let record = ledger
        .advance(message_id, status, error)
        .await
        .with_context(|| format!("marking {message_id} {status} failed"))?;
    Ok(record)
}

pub async fn show(config: &RelayConfig, message_id: &str) -> Result<OutboundMessage> {
    Ok(ledger(config).await?.get(message_id).await?)
}

pub async fn list(config: &RelayConfig, status: Option<&str>) -> Result<Vec<OutboundMessage>> {
    let status = status.map(str::parse::<OutboundStatus>).transpose()?;
    Ok(ledger(config).await?.store().list(status).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainrelay_core::retry::RetryCoordinator;

    fn config(dir: &tempfile::TempDir) -> RelayConfig {
        RelayConfig {
            chain_id: 5,
            max_retries: 2,
            checkpoint_store_url: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn send_records_the_configured_budget() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);

        let sent = send(&config, 10, r#"{"amount":"5"}"#).await.unwrap();
        assert_eq!(sent.status, OutboundStatus::Sent);
        assert_eq!(sent.max_retries, 2);
        assert_eq!(sent.source_chain, 5);

        let listed = list(&config, Some("sent")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].message_id, sent.message_id);
        assert!(send(&config, 10, "not json").await.is_err());
    }

    #[tokio::test]
    async fn failed_delivery_is_retried_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let sent = send(&config, 10, "{}").await.unwrap();

        let failed = mark(&config, &sent.message_id, "FAILED", Some("destination reverted".into()))
            .await
            .unwrap();
        assert_eq!(failed.last_error.as_deref(), Some("destination reverted"));
        assert!(mark(&config, &sent.message_id, "DELIVERED", None).await.is_err());

        let stores = open_stores(config.checkpoint_store, &config.checkpoint_store_url).await.unwrap();
        let handle = connect_bus(&config.pubsub, config.publish_timeout()).unwrap();
        let metrics = Arc::new(RelayMetrics::new());
        let publisher = Arc::new(EventPublisher::new(handle.bus, config.publish_timeout(), metrics.clone()));
        let coordinator = RetryCoordinator::new(OutboundLedger::new(stores.outbound), publisher, metrics);

        let decision = coordinator.retry(&sent.message_id).await.unwrap();
        assert!(decision.accepted);
        assert_eq!((decision.retry_count, decision.max_retries), (1, 2));
        assert_eq!(show(&config, &sent.message_id).await.unwrap().status, OutboundStatus::Sent);
    }
}
