//! Embedded file backends.
//!
//! Every write goes to a temp file in the target directory, is fsynced, and
//! is then renamed over the target, so a crash leaves either the old or the
//! new content. A file that exists but does not parse is a load error.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use alloy_primitives::keccak256;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use chainrelay_core::checkpoint::{Checkpoint, CheckpointStore};
use chainrelay_core::error::RelayError;
use chainrelay_core::outbound::{OutboundMessage, OutboundStatus, OutboundStore};
use chainrelay_core::registry::{KnownEntityRegistry, RegistrySnapshot, RegistryStore};

/// Distinguishes concurrent writes to the same target within this process.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

fn storage_err(what: &str, path: &Path, e: impl std::fmt::Display) -> RelayError {
    RelayError::Storage(format!("{what} {}: {e}", path.display()))
}

/// Write `bytes` to `path` atomically (temp file, fsync, rename).
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RelayError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| storage_err("failed to create directory", parent, e))?;
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| RelayError::Storage(format!("not a file path: {}", path.display())))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(format!(
        ".tmp-{}-{}",
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let tmp = path.with_file_name(tmp_name);

    let written = async {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .await
            .map_err(|e| storage_err("failed to create", &tmp, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| storage_err("failed to write", &tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| storage_err("failed to sync", &tmp, e))?;
        drop(file);
        fs::rename(&tmp, path)
            .await
            .map_err(|e| storage_err("failed to replace", path, e))
    }
    .await;
    if written.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    written
}

/// Read and parse a JSON file; `Ok(None)` only if it does not exist.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, RelayError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(storage_err("failed to read", path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| storage_err("corrupt file", path, e))
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), RelayError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| storage_err("failed to encode", path, e))?;
    write_atomic(path, &bytes).await
}

// ─── Checkpoints ──────────────────────────────────────────────────────────────

/// One JSON checkpoint file per source under a directory.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File holding the checkpoint of `source_id`. Source keys contain
    /// characters that are not portable in file names, so the name is a
    /// hash of the key.
    pub fn path_for(&self, source_id: &str) -> PathBuf {
        let digest = keccak256(source_id.as_bytes());
        self.dir
            .join(format!("checkpoint-{}.json", hex::encode(&digest[..8])))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, source_id: &str) -> Result<Option<Checkpoint>, RelayError> {
        let path = self.path_for(source_id);
        let Some(checkpoint) = read_json::<Checkpoint>(&path).await? else {
            return Ok(None);
        };
        if checkpoint.source_id != source_id {
            return Err(RelayError::Storage(format!(
                "{} belongs to '{}', not '{source_id}'",
                path.display(),
                checkpoint.source_id
            )));
        }
        Ok(Some(checkpoint))
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), RelayError> {
        let path = self.path_for(&checkpoint.source_id);
        write_json(&path, &checkpoint).await?;
        debug!(
            source_id = %checkpoint.source_id,
            position = checkpoint.last_processed_position,
            path = %path.display(),
            "checkpoint saved"
        );
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<(), RelayError> {
        let path = self.path_for(source_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err("failed to delete", &path, e)),
        }
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Registry snapshot kept in a single JSON file.
///
/// The store is shared by every scanner of a process. Saves are serialized
/// and merged with the last snapshot written through this store, so a slow
/// writer holding an older snapshot can never drop entities from the file.
pub struct FileRegistryStore {
    path: PathBuf,
    last_written: Mutex<Option<RegistrySnapshot>>,
}

impl FileRegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_written: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RegistryStore for FileRegistryStore {
    async fn load(&self) -> Result<Option<RegistrySnapshot>, RelayError> {
        read_json(&self.path).await
    }

    async fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), RelayError> {
        let mut last_written = self.last_written.lock().await;
        let merged = match last_written.as_ref() {
            Some(previous) => {
                let registry = KnownEntityRegistry::from_snapshot(snapshot)?;
                registry.merge(previous)?;
                registry.snapshot()
            }
            None => snapshot.clone(),
        };
        write_json(&self.path, &merged).await?;
        debug!(count = merged.count, path = %self.path.display(), "registry snapshot saved");
        *last_written = Some(merged);
        Ok(())
    }
}

// ─── Outbound messages ────────────────────────────────────────────────────────

/// One JSON file per outbound message. Compare-and-swap is serialized
/// within this process.
pub struct FileOutboundStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileOutboundStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, message_id: &str) -> Result<PathBuf, RelayError> {
        if message_id.is_empty()
            || !message_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(RelayError::Storage(format!("invalid message id '{message_id}'")));
        }
        Ok(self.dir.join(format!("{message_id}.json")))
    }
}

#[async_trait]
impl OutboundStore for FileOutboundStore {
    async fn insert(&self, record: &OutboundMessage) -> Result<(), RelayError> {
        let path = self.path_for(&record.message_id)?;
        let _guard = self.write_lock.lock().await;
        if fs::try_exists(&path)
            .await
            .map_err(|e| storage_err("failed to stat", &path, e))?
        {
            return Err(RelayError::Storage(format!(
                "outbound message {} already exists",
                record.message_id
            )));
        }
        write_json(&path, record).await
    }

    async fn get(&self, message_id: &str) -> Result<Option<OutboundMessage>, RelayError> {
        read_json(&self.path_for(message_id)?).await
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        record: &OutboundMessage,
    ) -> Result<bool, RelayError> {
        let path = self.path_for(&record.message_id)?;
        let _guard = self.write_lock.lock().await;
        let stored: OutboundMessage = read_json(&path)
            .await?
            .ok_or_else(|| RelayError::NotFound(record.message_id.clone()))?;
        if stored.version != expected_version {
            return Ok(false);
        }
        write_json(&path, record).await?;
        Ok(true)
    }

    async fn list(&self, status: Option<OutboundStatus>) -> Result<Vec<OutboundMessage>, RelayError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(storage_err("failed to list", &self.dir, e)),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_err("failed to list", &self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = read_json::<OutboundMessage>(&path).await? {
                if status.map_or(true, |s| record.status == s) {
                    out.push(record);
                }
            }
        }
        out.sort_by(|a, b| (a.created_at, &a.message_id).cmp(&(b.created_at, &b.message_id)));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "1:0xabc:Funded(address)";

    #[tokio::test]
    async fn checkpoint_roundtrip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());

        assert!(store.load(SOURCE).await.unwrap().is_none());
        store.save(Checkpoint::new(SOURCE, 103)).await.unwrap();
        store.save(Checkpoint::new(SOURCE, 110)).await.unwrap();

        let loaded = store.load(SOURCE).await.unwrap().unwrap();
        assert_eq!(loaded.last_processed_position, 110);

        // The on-disk shape is the documented one.
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path_for(SOURCE)).unwrap()).unwrap();
        assert_eq!(raw["source_id"], SOURCE);
        assert_eq!(raw["last_processed_position"], 110);

        store.delete(SOURCE).await.unwrap();
        store.delete(SOURCE).await.unwrap();
        assert!(store.load(SOURCE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_checkpoint_is_an_error_not_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        std::fs::write(store.path_for(SOURCE), b"{\"source_id\": ").unwrap();

        assert!(matches!(store.load(SOURCE).await, Err(RelayError::Storage(_))));
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("nested"));
        store.save(Checkpoint::new(SOURCE, 1)).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("checkpoint-") && names[0].ends_with(".json"));
    }

    #[tokio::test]
    async fn registry_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRegistryStore::new(dir.path().join("registry.json"));
        assert!(store.load().await.unwrap().is_none());

        let registry = KnownEntityRegistry::new();
        registry.add("0xBEEF");
        registry.add("0xabc");
        store.save(&registry.snapshot()).await.unwrap();

        let restored = KnownEntityRegistry::from_snapshot(&store.load().await.unwrap().unwrap()).unwrap();
        assert!(restored.contains("0xbeef"));
        assert_eq!(restored.count(), 2);

        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!({"escrows": ["0xabc", "0xbeef"], "count": 2, "version": "1.0"}));
    }

    #[tokio::test]
    async fn outbound_compare_and_swap() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileOutboundStore::new(dir.path());
        let mut msg = OutboundMessage::new(1, 10, "{}", 3);
        store.insert(&msg).await.unwrap();
        assert!(store.insert(&msg).await.is_err());

        msg.version = 1;
        msg.status = OutboundStatus::Sent;
        assert!(store.compare_and_swap(0, &msg).await.unwrap());
        assert!(!store.compare_and_swap(0, &msg).await.unwrap());

        let sent = store.list(Some(OutboundStatus::Sent)).await.unwrap();
        assert_eq!(sent.len(), 1);
        assert!(store.list(Some(OutboundStatus::Failed)).await.unwrap().is_empty());
        assert!(store.get("../escape").await.is_err());
    }
}
