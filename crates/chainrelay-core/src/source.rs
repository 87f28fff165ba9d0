//! Source identity and same-source exclusivity.
//!
//! A *source* is one (chain, contract, event-set) tuple. Each source owns
//! exactly one checkpoint and may have at most one scan in flight at a time.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Identity of a scanned log stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId {
    /// Numeric EVM chain id (e.g. `1` for Ethereum mainnet).
    pub chain_id: u64,
    /// Lower-cased contract address (`0x…`).
    pub contract: String,
    /// Sorted event names watched on this contract.
    pub events: Vec<String>,
}

impl SourceId {
    pub fn new(chain_id: u64, contract: &str, events: &[String]) -> Self {
        let mut events: Vec<String> = events.iter().map(|e| e.trim().to_string()).collect();
        events.sort();
        events.dedup();
        Self {
            chain_id,
            contract: contract.trim().to_ascii_lowercase(),
            events,
        }
    }

    /// Stable string key used by checkpoint stores.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.chain_id, self.contract, self.events.join(","))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Tracks which sources currently have a scanner running.
///
/// Distinct sources never contend; acquiring a source that is already held
/// fails with [`RelayError::SourceBusy`].
#[derive(Debug, Clone, Default)]
pub struct SourceLeases {
    active: Arc<Mutex<HashSet<String>>>,
}

impl SourceLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take exclusive ownership of `source` until the returned lease drops.
    pub fn acquire(&self, source: &SourceId) -> Result<SourceLease, RelayError> {
        let key = source.key();
        let mut active = self
            .active
            .lock()
            .map_err(|_| RelayError::Other("source lease table poisoned".into()))?;
        if !active.insert(key.clone()) {
            return Err(RelayError::SourceBusy(key));
        }
        Ok(SourceLease {
            key,
            active: Arc::clone(&self.active),
        })
    }

    /// Returns `true` if `source` is currently leased.
    pub fn is_active(&self, source: &SourceId) -> bool {
        self.active
            .lock()
            .map(|a| a.contains(&source.key()))
            .unwrap_or(false)
    }
}

/// RAII guard for a leased source.
#[derive(Debug)]
pub struct SourceLease {
    key: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl SourceLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for SourceLease {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.key);
        }
    }
}
