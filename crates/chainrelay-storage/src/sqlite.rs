//! SQLite storage backend for ChainRelay.
//!
//! One database holds checkpoints, consumed events and outbound message
//! records. Uses `sqlx` with WAL mode.
//!
//! # Usage
//! ```rust,no_run
//! use chainrelay_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./relay.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;

use chainrelay_core::checkpoint::{Checkpoint, CheckpointStore};
use chainrelay_core::consumer::{Persistence, UpsertSession};
use chainrelay_core::error::RelayError;
use chainrelay_core::event::{CanonicalEvent, EventStatus};
use chainrelay_core::outbound::{OutboundMessage, OutboundStatus, OutboundStore};

fn db_err(e: sqlx::Error) -> RelayError {
    RelayError::Storage(e.to_string())
}

/// SQLite-backed storage for checkpoints, events and outbound messages.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./relay.db"`) or a full
    /// SQLite URL (`"sqlite:./relay.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, RelayError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| RelayError::Storage(format!("{}: {e}", parent.display())))?;
            }
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(db_err)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every connection to `sqlite::memory:` is its own database, so the
    /// pool is pinned to a single connection.
    pub async fn in_memory() -> Result<Self, RelayError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), RelayError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                source_id               TEXT    PRIMARY KEY,
                last_processed_position INTEGER NOT NULL,
                updated_at              INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                event_id     TEXT    PRIMARY KEY,
                event_type   TEXT    NOT NULL,
                command_id   TEXT    NOT NULL,
                workflow_id  TEXT    NOT NULL,
                status       TEXT    NOT NULL,
                payer        TEXT,
                payee        TEXT,
                amount       TEXT,
                chain_id     INTEGER NOT NULL,
                occurred_at  INTEGER,
                block_number INTEGER NOT NULL,
                tx_hash      TEXT    NOT NULL,
                log_index    INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_workflow ON events (workflow_id);")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS outbound_messages (
                message_id        TEXT    PRIMARY KEY,
                status            TEXT    NOT NULL,
                retry_count       INTEGER NOT NULL,
                max_retries       INTEGER NOT NULL,
                source_chain      INTEGER NOT NULL,
                destination_chain INTEGER NOT NULL,
                payload           TEXT    NOT NULL,
                last_error        TEXT,
                version           INTEGER NOT NULL,
                created_at        INTEGER NOT NULL,
                updated_at        INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_outbound_status ON outbound_messages (status);")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(())
    }

    // ─── Event storage ──────────────────────────────────────────────────────────

    pub async fn get_event(&self, event_id: &str) -> Result<Option<CanonicalEvent>, RelayError> {
        let row = sqlx::query("SELECT * FROM events WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(event_from_row).transpose()
    }

    /// Total number of stored events.
    pub async fn event_count(&self) -> Result<u64, RelayError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }
}

fn event_from_row(row: &SqliteRow) -> Result<CanonicalEvent, RelayError> {
    let status: String = row.get("status");
    Ok(CanonicalEvent {
        event_id: row.get("event_id"),
        event_type: row.get("event_type"),
        command_id: row.get("command_id"),
        workflow_id: row.get("workflow_id"),
        status: status.parse::<EventStatus>().map_err(RelayError::Storage)?,
        payer: row.get("payer"),
        payee: row.get("payee"),
        amount: row.get("amount"),
        chain_id: row.get::<i64, _>("chain_id") as u64,
        occurred_at: row.get("occurred_at"),
        block_number: row.get::<i64, _>("block_number") as u64,
        tx_hash: row.get("tx_hash"),
        log_index: row.get::<i64, _>("log_index") as u32,
    })
}

fn outbound_from_row(row: &SqliteRow) -> Result<OutboundMessage, RelayError> {
    let status: String = row.get("status");
    Ok(OutboundMessage {
        message_id: row.get("message_id"),
        status: status.parse::<OutboundStatus>()?,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        max_retries: row.get::<i64, _>("max_retries") as u32,
        source_chain: row.get::<i64, _>("source_chain") as u64,
        destination_chain: row.get::<i64, _>("destination_chain") as u64,
        payload: row.get("payload"),
        last_error: row.get("last_error"),
        version: row.get::<i64, _>("version") as u64,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn load(&self, source_id: &str) -> Result<Option<Checkpoint>, RelayError> {
        let row = sqlx::query(
            "SELECT source_id, last_processed_position, updated_at
             FROM checkpoints WHERE source_id = ?",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| Checkpoint {
            source_id: r.get("source_id"),
            last_processed_position: r.get::<i64, _>("last_processed_position") as u64,
            updated_at: r.get("updated_at"),
        }))
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints (source_id, last_processed_position, updated_at)
             VALUES (?, ?, ?)",
        )
        .bind(&checkpoint.source_id)
        .bind(checkpoint.last_processed_position as i64)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(
            source_id = %checkpoint.source_id,
            position = checkpoint.last_processed_position,
            "checkpoint saved"
        );
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<(), RelayError> {
        sqlx::query("DELETE FROM checkpoints WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.pool.close().await;
        Ok(())
    }
}

// ─── OutboundStore impl ──────────────────────────────────────────────────────

#[async_trait]
impl OutboundStore for SqliteStorage {
    async fn insert(&self, record: &OutboundMessage) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT INTO outbound_messages
             (message_id, status, retry_count, max_retries, source_chain, destination_chain,
              payload, last_error, version, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.message_id)
        .bind(record.status.as_str())
        .bind(record.retry_count as i64)
        .bind(record.max_retries as i64)
        .bind(record.source_chain as i64)
        .bind(record.destination_chain as i64)
        .bind(&record.payload)
        .bind(&record.last_error)
        .bind(record.version as i64)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, message_id: &str) -> Result<Option<OutboundMessage>, RelayError> {
        let row = sqlx::query("SELECT * FROM outbound_messages WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(outbound_from_row).transpose()
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        record: &OutboundMessage,
    ) -> Result<bool, RelayError> {
        let result = sqlx::query(
            "UPDATE outbound_messages
             SET status = ?, retry_count = ?, max_retries = ?, payload = ?, last_error = ?,
                 version = ?, updated_at = ?
             WHERE message_id = ? AND version = ?",
        )
        .bind(record.status.as_str())
        .bind(record.retry_count as i64)
        .bind(record.max_retries as i64)
        .bind(&record.payload)
        .bind(&record.last_error)
        .bind(record.version as i64)
        .bind(record.updated_at)
        .bind(&record.message_id)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get(&record.message_id).await? {
            Some(_) => Ok(false),
            None => Err(RelayError::NotFound(record.message_id.clone())),
        }
    }

    async fn list(&self, status: Option<OutboundStatus>) -> Result<Vec<OutboundMessage>, RelayError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM outbound_messages WHERE status = ?
                     ORDER BY created_at, message_id",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM outbound_messages ORDER BY created_at, message_id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(db_err)?;
        rows.iter().map(outbound_from_row).collect()
    }
}

// ─── Consumer persistence ────────────────────────────────────────────────────

/// An open SQLite transaction handed to event handlers.
pub struct SqliteSession(Transaction<'static, Sqlite>);

impl SqliteSession {
    /// The underlying transaction, for handlers that run their own SQL.
    pub fn transaction(&mut self) -> &mut Transaction<'static, Sqlite> {
        &mut self.0
    }
}

#[async_trait]
impl UpsertSession for SqliteSession {
    async fn upsert_event(&mut self, event: &CanonicalEvent) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT INTO events
             (event_id, event_type, command_id, workflow_id, status, payer, payee, amount,
              chain_id, occurred_at, block_number, tx_hash, log_index)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(event_id) DO UPDATE SET
                event_type = excluded.event_type,
                command_id = excluded.command_id,
                workflow_id = excluded.workflow_id,
                status = excluded.status,
                payer = excluded.payer,
                payee = excluded.payee,
                amount = excluded.amount,
                occurred_at = excluded.occurred_at",
        )
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(&event.command_id)
        .bind(&event.workflow_id)
        .bind(event.status.to_string())
        .bind(&event.payer)
        .bind(&event.payee)
        .bind(&event.amount)
        .bind(event.chain_id as i64)
        .bind(event.occurred_at)
        .bind(event.block_number as i64)
        .bind(&event.tx_hash)
        .bind(event.log_index as i64)
        .execute(&mut *self.0)
        .await
        .map_err(db_err)?;

        debug!(event_id = %event.event_id, "event upserted");
        Ok(())
    }
}

#[async_trait]
impl Persistence for SqliteStorage {
    type Session = SqliteSession;

    async fn begin(&self) -> Result<SqliteSession, RelayError> {
        self.pool.begin().await.map(SqliteSession).map_err(db_err)
    }

    async fn commit(&self, session: SqliteSession) -> Result<(), RelayError> {
        session.0.commit().await.map_err(db_err)
    }

    async fn rollback(&self, session: SqliteSession) -> Result<(), RelayError> {
        session.0.rollback().await.map_err(db_err)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
