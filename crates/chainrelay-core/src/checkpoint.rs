//! Checkpoint manager — persists each source's scan position for crash recovery.
//!
//! A checkpoint stores the last block whose events were durably published.
//! On restart the scanner resumes from it instead of re-scanning from the
//! configured start block. A checkpoint that cannot be written is an error,
//! never a silent "start from zero".

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::source::SourceId;

/// A persisted checkpoint for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Source key (see [`SourceId::key`]).
    pub source_id: String,
    /// Last block whose events were published.
    pub last_processed_position: u64,
    /// Unix timestamp of when this checkpoint was saved.
    #[serde(default)]
    pub updated_at: i64,
}

impl Checkpoint {
    pub fn new(source_id: impl Into<String>, position: u64) -> Self {
        Self {
            source_id: source_id.into(),
            last_processed_position: position,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Trait for storing and loading checkpoints.
///
/// Implementations include [`MemoryCheckpointStore`] and, in
/// `chainrelay-storage`, `FileCheckpointStore` and `SqliteStorage`.
/// `save` must be atomic: a crash mid-write leaves either the old or the new
/// checkpoint, never a torn one.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for a source (`None` only if never saved).
    async fn load(&self, source_id: &str) -> Result<Option<Checkpoint>, RelayError>;

    /// Save (upsert) a checkpoint.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), RelayError>;

    /// Delete a checkpoint (operator reset).
    async fn delete(&self, source_id: &str) -> Result<(), RelayError>;

    /// Release any resources held by the store.
    async fn close(&self) -> Result<(), RelayError> {
        Ok(())
    }
}

/// Manages checkpoint reads/writes for one source.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    source_id: String,
    /// How often to save (every N blocks).
    save_interval: u64,
    /// Blocks processed since the last save.
    pending_blocks: u64,
    /// Highest position handed to `maybe_save` but not yet written.
    unsaved: Option<u64>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, source: &SourceId, save_interval: u64) -> Self {
        Self {
            store,
            source_id: source.key(),
            save_interval: save_interval.max(1),
            pending_blocks: 0,
            unsaved: None,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Load the saved position (returns `None` on first run).
    pub async fn load(&self) -> Result<Option<u64>, RelayError> {
        Ok(self
            .store
            .load(&self.source_id)
            .await?
            .map(|cp| cp.last_processed_position))
    }

    /// Record that `blocks` more blocks up to `position` are published, and
    /// save once at least `save_interval` blocks have accumulated.
    ///
    /// Returns `true` if a checkpoint was written.
    pub async fn maybe_save(&mut self, position: u64, blocks: u64) -> Result<bool, RelayError> {
        self.pending_blocks += blocks;
        self.unsaved = Some(position);
        if self.pending_blocks >= self.save_interval {
            self.force_save(position).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Immediately save a checkpoint.
    pub async fn force_save(&mut self, position: u64) -> Result<(), RelayError> {
        self.store
            .save(Checkpoint::new(self.source_id.clone(), position))
            .await?;
        self.pending_blocks = 0;
        self.unsaved = None;
        Ok(())
    }

    /// Write any position accumulated by `maybe_save` (used on shutdown).
    pub async fn flush(&mut self) -> Result<(), RelayError> {
        match self.unsaved {
            Some(position) => self.force_save(position).await,
            None => Ok(()),
        }
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// In-memory checkpoint store for tests and ephemeral relays.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Checkpoint>>, RelayError> {
        self.data
            .lock()
            .map_err(|_| RelayError::Storage("checkpoint map poisoned".into()))
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, source_id: &str) -> Result<Option<Checkpoint>, RelayError> {
        Ok(self.lock()?.get(source_id).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), RelayError> {
        self.lock()?.insert(checkpoint.source_id.clone(), checkpoint);
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<(), RelayError> {
        self.lock()?.remove(source_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SourceId {
        SourceId::new(1, "0xabc", &["Settled".into()])
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut mgr = CheckpointManager::new(store.clone(), &source(), 1);

        // No checkpoint initially
        assert!(mgr.load().await.unwrap().is_none());

        mgr.force_save(1000).await.unwrap();
        assert_eq!(mgr.load().await.unwrap(), Some(1000));

        let raw = store.load(&source().key()).await.unwrap().unwrap();
        assert_eq!(raw.source_id, "1:0xabc:Settled");
        assert!(raw.updated_at > 0);
    }

    #[tokio::test]
    async fn checkpoint_save_interval() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut mgr = CheckpointManager::new(store, &source(), 10);

        // 4 blocks, below the interval
        assert!(!mgr.maybe_save(104, 4).await.unwrap());
        assert!(mgr.load().await.unwrap().is_none());

        // 6 more, reaches the interval
        assert!(mgr.maybe_save(110, 6).await.unwrap());
        assert_eq!(mgr.load().await.unwrap(), Some(110));

        // Shutdown flushes whatever accumulated since
        mgr.maybe_save(113, 3).await.unwrap();
        mgr.flush().await.unwrap();
        assert_eq!(mgr.load().await.unwrap(), Some(113));
    }
}
