//! Deduplication registry of discovered entities (e.g. escrow contracts
//! announced by a factory).
//!
//! Membership is keyed by the lower-cased identifier, so `add` is idempotent
//! and case-insensitive. The registry is persisted as a [`RegistrySnapshot`]
//! and restored on startup so a restarted scanner does not re-announce
//! entities it already published.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Snapshot schema version written by this crate.
pub const SNAPSHOT_VERSION: &str = "1.0";

/// Persisted form of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Sorted, lower-cased identifiers.
    pub escrows: Vec<String>,
    pub count: usize,
    pub version: String,
    /// Block each identifier was learned at, where known. Older snapshots
    /// omit it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub learned_at: BTreeMap<String, u64>,
}

impl RegistrySnapshot {
    pub fn empty() -> Self {
        Self {
            escrows: vec![],
            count: 0,
            version: SNAPSHOT_VERSION.to_string(),
            learned_at: BTreeMap::new(),
        }
    }
}

/// Trait for persisting registry snapshots.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Load the last snapshot (`None` if none was ever written).
    async fn load(&self) -> Result<Option<RegistrySnapshot>, RelayError>;

    /// Atomically replace the stored snapshot.
    async fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), RelayError>;
}

/// Normalize an identifier for membership checks.
pub fn normalize(identifier: &str) -> String {
    identifier.trim().to_ascii_lowercase()
}

/// In-memory set of known entities, safe to share across source tasks.
#[derive(Debug, Default)]
pub struct KnownEntityRegistry {
    /// identifier → position it was learned at (`None` if unknown).
    entries: RwLock<BTreeMap<String, Option<u64>>>,
}

impl KnownEntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a snapshot.
    pub fn from_snapshot(snapshot: &RegistrySnapshot) -> Result<Self, RelayError> {
        let registry = Self::new();
        registry.restore(snapshot)?;
        Ok(registry)
    }

    /// Insert `identifier`; returns `true` if it was not already known.
    pub fn add(&self, identifier: &str) -> bool {
        self.insert(identifier, None)
    }

    /// Insert `identifier`, recording the block it was learned from.
    pub fn add_at(&self, identifier: &str, position: u64) -> bool {
        self.insert(identifier, Some(position))
    }

    fn insert(&self, identifier: &str, position: Option<u64>) -> bool {
        let key = normalize(identifier);
        if key.is_empty() {
            return false;
        }
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, position);
        true
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&normalize(identifier))
    }

    pub fn count(&self) -> usize {
        self.entries.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Block at which `identifier` was learned, if recorded.
    pub fn learned_at(&self, identifier: &str) -> Option<u64> {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&normalize(identifier))
            .copied()
            .flatten()
    }

    /// Sorted snapshot of all identifiers.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        let escrows: Vec<String> = entries.keys().cloned().collect();
        let learned_at = entries
            .iter()
            .filter_map(|(id, pos)| pos.map(|p| (id.clone(), p)))
            .collect();
        RegistrySnapshot {
            count: escrows.len(),
            escrows,
            version: SNAPSHOT_VERSION.to_string(),
            learned_at,
        }
    }

    /// Replace the registry contents with `snapshot`.
    ///
    /// Rejects snapshots with an unknown version or a `count` that disagrees
    /// with the identifier list.
    pub fn restore(&self, snapshot: &RegistrySnapshot) -> Result<(), RelayError> {
        let restored = Self::validated(snapshot)?;
        *self.entries.write().unwrap_or_else(|p| p.into_inner()) = restored;
        Ok(())
    }

    /// Add every identifier of `snapshot`, keeping what is already known.
    /// Returns how many identifiers were new.
    pub fn merge(&self, snapshot: &RegistrySnapshot) -> Result<usize, RelayError> {
        let incoming = Self::validated(snapshot)?;
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        let before = entries.len();
        for (id, pos) in incoming {
            entries.entry(id).or_insert(pos);
        }
        Ok(entries.len() - before)
    }

    fn validated(snapshot: &RegistrySnapshot) -> Result<BTreeMap<String, Option<u64>>, RelayError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(RelayError::Storage(format!(
                "unsupported registry snapshot version '{}'",
                snapshot.version
            )));
        }
        if snapshot.count != snapshot.escrows.len() {
            return Err(RelayError::Storage(format!(
                "registry snapshot count {} does not match {} identifiers",
                snapshot.count,
                snapshot.escrows.len()
            )));
        }
        let restored: BTreeMap<String, Option<u64>> = snapshot
            .escrows
            .iter()
            .map(|id| normalize(id))
            .filter(|id| !id.is_empty())
            .map(|id| {
                let pos = snapshot.learned_at.get(&id).copied();
                (id, pos)
            })
            .collect();
        Ok(restored)
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// Registry store that keeps the last snapshot in memory.
#[derive(Default)]
pub struct MemoryRegistryStore {
    snapshot: std::sync::Mutex<Option<RegistrySnapshot>>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn load(&self) -> Result<Option<RegistrySnapshot>, RelayError> {
        Ok(self
            .snapshot
            .lock()
            .map_err(|_| RelayError::Storage("registry snapshot poisoned".into()))?
            .clone())
    }

    async fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), RelayError> {
        *self
            .snapshot
            .lock()
            .map_err(|_| RelayError::Storage("registry snapshot poisoned".into()))? =
            Some(snapshot.clone());
        Ok(())
    }
}
