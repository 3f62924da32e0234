//! `SQLite`-backed implementation of [`CheckpointStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use sluice_types::checkpoint::{Checkpoint, CheckpointRecord};
use sluice_types::state::{OperatorIndex, PipelineId};

use crate::backend::CheckpointStore;
use crate::error::{self, StateError};

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Idempotent DDL for checkpoint tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS operator_checkpoints (
    pipeline TEXT NOT NULL,
    operator INTEGER NOT NULL,
    epoch INTEGER NOT NULL,
    state BLOB NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (pipeline, operator, epoch)
);

CREATE TABLE IF NOT EXISTS committed_rounds (
    pipeline TEXT NOT NULL,
    epoch INTEGER NOT NULL,
    committed_at TEXT NOT NULL,
    PRIMARY KEY (pipeline, epoch)
);
";

/// `SQLite`-backed checkpoint storage.
///
/// Create with [`SqliteCheckpointStore::open`] for file-backed persistence
/// or [`SqliteCheckpointStore::in_memory`] for tests.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open or create a `SQLite` checkpoint database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(StateError::backend)?;
        Self::init(conn)
    }

    /// Create an in-memory `SQLite` store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::backend)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::backend_context("create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }

    #[allow(clippy::cast_sign_loss)]
    fn last_committed_locked(
        conn: &Connection,
        pipeline: &PipelineId,
    ) -> error::Result<Option<Checkpoint>> {
        let epoch: Option<i64> = conn
            .query_row(
                "SELECT MAX(epoch) FROM committed_rounds WHERE pipeline = ?1",
                [pipeline.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| StateError::backend_context("last_committed", e))?;
        Ok(epoch.map(|e| Checkpoint::new(e as u64)))
    }

    #[cfg(test)]
    fn count_records(&self, pipeline: &PipelineId) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM operator_checkpoints WHERE pipeline = ?1",
            [pipeline.as_str()],
            |row| row.get(0),
        )
        .map_err(StateError::backend)
    }
}

#[allow(clippy::cast_possible_wrap)]
fn sql_epoch(checkpoint: Checkpoint) -> i64 {
    checkpoint.epoch() as i64
}

#[allow(clippy::cast_possible_wrap)]
fn sql_operator(operator: OperatorIndex) -> i64 {
    operator.get() as i64
}

impl CheckpointStore for SqliteCheckpointStore {
    fn put(&self, record: &CheckpointRecord) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO operator_checkpoints (pipeline, operator, epoch, state, recorded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(pipeline, operator, epoch) \
             DO UPDATE SET state = ?4, recorded_at = ?5",
            rusqlite::params![
                record.pipeline.as_str(),
                sql_operator(record.operator),
                sql_epoch(record.checkpoint),
                record.state.as_ref(),
                Self::now_sqlite(),
            ],
        )
        .map_err(|e| StateError::backend_context("put: execute", e))?;
        Ok(())
    }

    fn commit(&self, pipeline: &PipelineId, checkpoint: Checkpoint) -> error::Result<()> {
        let conn = self.lock_conn()?;
        if let Some(committed) = Self::last_committed_locked(&conn, pipeline)? {
            if checkpoint <= committed {
                return Err(StateError::StaleCommit {
                    attempted: checkpoint.epoch(),
                    committed: committed.epoch(),
                });
            }
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("commit: begin tx", e))?;
        tx.execute(
            "INSERT INTO committed_rounds (pipeline, epoch, committed_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![pipeline.as_str(), sql_epoch(checkpoint), Self::now_sqlite()],
        )
        .map_err(|e| StateError::backend_context("commit: insert round", e))?;
        tx.execute(
            "DELETE FROM operator_checkpoints WHERE pipeline = ?1 AND epoch < ?2",
            rusqlite::params![pipeline.as_str(), sql_epoch(checkpoint)],
        )
        .map_err(|e| StateError::backend_context("commit: prune", e))?;
        tx.execute(
            "DELETE FROM committed_rounds WHERE pipeline = ?1 AND epoch < ?2",
            rusqlite::params![pipeline.as_str(), sql_epoch(checkpoint)],
        )
        .map_err(|e| StateError::backend_context("commit: prune rounds", e))?;
        tx.commit()
            .map_err(|e| StateError::backend_context("commit: commit tx", e))?;
        Ok(())
    }

    fn discard_uncommitted(&self, pipeline: &PipelineId) -> error::Result<usize> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM operator_checkpoints WHERE pipeline = ?1 AND epoch > \
             COALESCE((SELECT MAX(epoch) FROM committed_rounds WHERE pipeline = ?1), 0)",
            [pipeline.as_str()],
        )
        .map_err(|e| StateError::backend_context("discard_uncommitted", e))
    }

    fn get(&self, pipeline: &PipelineId, operator: OperatorIndex) -> error::Result<Option<Bytes>> {
        let conn = self.lock_conn()?;
        let state: Option<Vec<u8>> = conn
            .query_row(
                "SELECT state FROM operator_checkpoints \
                 WHERE pipeline = ?1 AND operator = ?2 AND epoch = \
                 (SELECT MAX(epoch) FROM committed_rounds WHERE pipeline = ?1)",
                rusqlite::params![pipeline.as_str(), sql_operator(operator)],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StateError::backend_context("get", e))?;
        Ok(state.map(Bytes::from))
    }

    fn last_committed(&self, pipeline: &PipelineId) -> error::Result<Option<Checkpoint>> {
        let conn = self.lock_conn()?;
        Self::last_committed_locked(&conn, pipeline)
    }
}
