//! `chainrelay checkpoint` and `chainrelay registry` — operator access to the
//! durable scan state.

use anyhow::{bail, Context, Result};
use serde_json::json;

use chainrelay_core::checkpoint::Checkpoint;
use chainrelay_core::config::RelayConfig;
use chainrelay_core::registry::{KnownEntityRegistry, RegistryStore};
use chainrelay_core::source::SourceId;
use chainrelay_storage::{open_stores, FileRegistryStore};

/// Configured sources, optionally narrowed to one contract.
fn selected_sources(config: &RelayConfig, contract: Option<&str>) -> Result<Vec<SourceId>> {
    let sources = config.sources();
    if sources.is_empty() {
        bail!("no contract configured (set CONTRACT_ADDRESS or --contracts)");
    }
    let Some(contract) = contract else {
        return Ok(sources);
    };
    let wanted = contract.trim().to_ascii_lowercase();
    let matched: Vec<SourceId> = sources.into_iter().filter(|s| s.contract == wanted).collect();
    if matched.is_empty() {
        bail!("contract {contract} is not among the configured contracts");
    }
    Ok(matched)
}

pub async fn checkpoint_show(config: &RelayConfig, contract: Option<&str>) -> Result<()> {
    let stores = open_stores(config.checkpoint_store, &config.checkpoint_store_url).await?;
    for source in selected_sources(config, contract)? {
        let key = source.key();
        let line = match stores.checkpoints.load(&key).await? {
            Some(cp) => json!({
                "source_id": key,
                "last_processed_position": cp.last_processed_position,
                "updated_at": chrono::DateTime::from_timestamp(cp.updated_at, 0).map(|t| t.to_rfc3339()),
            }),
            None => json!({ "source_id": key, "last_processed_position": null }),
        };
        println!("{line}");
    }
    Ok(())
}

pub async fn checkpoint_set(config: &RelayConfig, contract: Option<&str>, block: u64) -> Result<()> {
    let sources = selected_sources(config, contract)?;
    if sources.len() > 1 {
        bail!("{} contracts configured; pick one with --contract", sources.len());
    }
    let stores = open_stores(config.checkpoint_store, &config.checkpoint_store_url).await?;
    for source in sources {
        let key = source.key();
        let previous = stores.checkpoints.load(&key).await?;
        stores.checkpoints.save(Checkpoint::new(key.clone(), block)).await?;
        tracing::info!(
            source_id = %key,
            previous = previous.map(|cp| cp.last_processed_position),
            position = block,
            "checkpoint set"
        );
    }
    stores.checkpoints.close().await?;
    Ok(())
}

pub async fn checkpoint_reset(config: &RelayConfig, contract: Option<&str>) -> Result<()> {
    let stores = open_stores(config.checkpoint_store, &config.checkpoint_store_url).await?;
    for source in selected_sources(config, contract)? {
        let key = source.key();
        stores.checkpoints.delete(&key).await?;
        tracing::info!(source_id = %key, start_block = config.start_block, "checkpoint reset");
    }
    stores.checkpoints.close().await?;
    Ok(())
}

pub async fn registry_show(config: &RelayConfig) -> Result<()> {
    let path = config
        .registry_path
        .as_deref()
        .context("REGISTRY_PATH is not set; the registry only lives in memory")?;
    let store = FileRegistryStore::new(path);
    let Some(snapshot) = store.load().await? else {
        println!("{}", json!({ "escrows": [], "count": 0, "path": path }));
        return Ok(());
    };
    // Validates version and count before printing.
    KnownEntityRegistry::from_snapshot(&snapshot)?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrows_to_one_contract() {
        let config = RelayConfig {
            contracts: vec!["0xAAA".into(), "0xBBB".into()],
            event_names: vec!["Settled(bytes32)".into()],
            ..Default::default()
        };
        assert_eq!(selected_sources(&config, None).unwrap().len(), 2);
        let one = selected_sources(&config, Some("0xbbb")).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].contract, "0xbbb");
        assert!(selected_sources(&config, Some("0xccc")).is_err());
    }

    #[tokio::test]
    async fn set_show_reset_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig {
            contracts: vec!["0xAAA".into()],
            event_names: vec!["Settled(bytes32)".into()],
            checkpoint_store_url: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        checkpoint_set(&config, None, 120).await.unwrap();
        checkpoint_show(&config, None).await.unwrap();

        let stores = open_stores(config.checkpoint_store, &config.checkpoint_store_url).await.unwrap();
        let key = config.sources()[0].key();
        assert_eq!(stores.checkpoints.load(&key).await.unwrap().unwrap().last_processed_position, 120);

        checkpoint_reset(&config, None).await.unwrap();
        assert!(stores.checkpoints.load(&key).await.unwrap().is_none());
    }
}
