//! chainrelay-storage — durable backends for ChainRelay.
//!
//! Backends:
//! - [`file`] — one JSON file per checkpoint / outbound record, plus the
//!   registry snapshot (always available)
//! - [`sqlite`] — SQLite via `sqlx` (checkpoints, outbound records, consumed
//!   events; `sqlite` feature)

use std::path::Path;
use std::sync::Arc;

use chainrelay_core::checkpoint::CheckpointStore;
use chainrelay_core::config::CheckpointStoreKind;
use chainrelay_core::error::RelayError;
use chainrelay_core::outbound::OutboundStore;

pub mod file;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file::{write_atomic, FileCheckpointStore, FileOutboundStore, FileRegistryStore};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteSession, SqliteStorage};

/// The stores one relay process runs on, opened from a single backend.
pub struct Stores {
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub outbound: Arc<dyn OutboundStore>,
    /// Set when the backend can also persist consumed events.
    #[cfg(feature = "sqlite")]
    pub sqlite: Option<SqliteStorage>,
}

/// Open the stores for `kind`.
///
/// `url` is a directory for [`CheckpointStoreKind::File`] (checkpoints at the
/// top level, outbound records under `outbound/`) and a database path or URL
/// for [`CheckpointStoreKind::Sqlite`].
pub async fn open_stores(kind: CheckpointStoreKind, url: &str) -> Result<Stores, RelayError> {
    match kind {
        CheckpointStoreKind::File => {
            let dir = Path::new(url);
            tracing::info!(dir = %dir.display(), "using file stores");
            Ok(Stores {
                checkpoints: Arc::new(FileCheckpointStore::new(dir)),
                outbound: Arc::new(FileOutboundStore::new(dir.join("outbound"))),
                #[cfg(feature = "sqlite")]
                sqlite: None,
            })
        }
        #[cfg(feature = "sqlite")]
        CheckpointStoreKind::Sqlite => {
            let storage = SqliteStorage::open(url).await?;
            tracing::info!(url, "using sqlite stores");
            Ok(Stores {
                checkpoints: Arc::new(storage.clone()),
                outbound: Arc::new(storage.clone()),
                sqlite: Some(storage),
            })
        }
        #[cfg(not(feature = "sqlite"))]
        CheckpointStoreKind::Sqlite => Err(RelayError::Config(
            "checkpoint store 'sqlite' needs chainrelay-storage built with the `sqlite` feature".into(),
        )),
    }
}
