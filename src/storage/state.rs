// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable engine state: the current phase, backfill checkpoints and the
//! per-class backfill lock.
//!
//! State survives restarts so a crashed backfill can resume from its last
//! committed cursor and the engine comes back up in the phase the operator
//! left it in.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::Row;

use super::sql::{text_column, SqlConnection};
use super::traits::StorageError;
use crate::backfill::{BackfillCheckpoint, RunId};
use crate::phase::PhaseState;
use crate::record::RecordClass;

/// Result of trying to take the backfill lock for a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    HeldBy(RunId),
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_phase(&self) -> Result<Option<PhaseState>, StorageError>;

    async fn save_phase(&self, state: &PhaseState) -> Result<(), StorageError>;

    async fn load_checkpoint(&self, run_id: &RunId) -> Result<Option<BackfillCheckpoint>, StorageError>;

    /// Insert or replace the checkpoint for its run.
    async fn save_checkpoint(&self, checkpoint: &BackfillCheckpoint) -> Result<(), StorageError>;

    /// Checkpoints of one class, most recently started first.
    async fn list_checkpoints(&self, class: RecordClass) -> Result<Vec<BackfillCheckpoint>, StorageError>;

    /// Take the class lock. Re-acquiring a lock already held by `run_id` succeeds.
    async fn acquire_run_lock(&self, class: RecordClass, run_id: &RunId) -> Result<LockOutcome, StorageError>;

    /// Release the class lock if `run_id` holds it. Otherwise a no-op.
    async fn release_run_lock(&self, class: RecordClass, run_id: &RunId) -> Result<(), StorageError>;

    async fn run_lock_holder(&self, class: RecordClass) -> Result<Option<RunId>, StorageError>;
}

fn serialization(e: serde_json::Error) -> StorageError {
    StorageError::Serialization(e.to_string())
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Process-local state, lost on restart. Used by tests and in-memory engines.
#[derive(Default)]
pub struct MemoryStateStore {
    phase: Mutex<Option<PhaseState>>,
    checkpoints: Mutex<HashMap<RunId, BackfillCheckpoint>>,
    locks: Mutex<HashMap<RecordClass, RunId>>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_phase(&self) -> Result<Option<PhaseState>, StorageError> {
        Ok(self.phase.lock().clone())
    }

    async fn save_phase(&self, state: &PhaseState) -> Result<(), StorageError> {
        *self.phase.lock() = Some(state.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, run_id: &RunId) -> Result<Option<BackfillCheckpoint>, StorageError> {
        Ok(self.checkpoints.lock().get(run_id).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &BackfillCheckpoint) -> Result<(), StorageError> {
        self.checkpoints
            .lock()
            .insert(checkpoint.run_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn list_checkpoints(&self, class: RecordClass) -> Result<Vec<BackfillCheckpoint>, StorageError> {
        let mut list: Vec<_> = self
            .checkpoints
            .lock()
            .values()
            .filter(|c| c.class == class)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(list)
    }

    async fn acquire_run_lock(&self, class: RecordClass, run_id: &RunId) -> Result<LockOutcome, StorageError> {
        let mut locks = self.locks.lock();
        match locks.get(&class) {
            Some(holder) if holder != run_id => Ok(LockOutcome::HeldBy(holder.clone())),
            _ => {
                locks.insert(class, run_id.clone());
                Ok(LockOutcome::Acquired)
            }
        }
    }

    async fn release_run_lock(&self, class: RecordClass, run_id: &RunId) -> Result<(), StorageError> {
        let mut locks = self.locks.lock();
        if locks.get(&class) == Some(run_id) {
            locks.remove(&class);
        }
        Ok(())
    }

    async fn run_lock_holder(&self, class: RecordClass) -> Result<Option<RunId>, StorageError> {
        Ok(self.locks.lock().get(&class).cloned())
    }
}

/// State kept next to the source tables in the relational store.
pub struct SqlStateStore {
    conn: SqlConnection,
}

impl SqlStateStore {
    pub async fn new(conn: SqlConnection) -> Result<Self, StorageError> {
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = if self.conn.is_sqlite() {
            vec![
                "CREATE TABLE IF NOT EXISTS migration_phase (
                    id INTEGER PRIMARY KEY,
                    state TEXT NOT NULL
                )"
                .to_string(),
                "CREATE TABLE IF NOT EXISTS backfill_checkpoints (
                    run_id TEXT PRIMARY KEY,
                    class TEXT NOT NULL,
                    started_at_ms INTEGER NOT NULL,
                    checkpoint TEXT NOT NULL
                )"
                .to_string(),
                "CREATE INDEX IF NOT EXISTS idx_checkpoints_class ON backfill_checkpoints (class, started_at_ms)"
                    .to_string(),
                "CREATE TABLE IF NOT EXISTS backfill_locks (
                    class TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL
                )"
                .to_string(),
            ]
        } else {
            vec![
                "CREATE TABLE IF NOT EXISTS migration_phase (
                    id INT PRIMARY KEY,
                    state TEXT NOT NULL
                )"
                .to_string(),
                "CREATE TABLE IF NOT EXISTS backfill_checkpoints (
                    run_id VARCHAR(128) PRIMARY KEY,
                    class VARCHAR(32) NOT NULL,
                    started_at_ms BIGINT NOT NULL,
                    checkpoint LONGTEXT NOT NULL,
                    INDEX idx_class (class, started_at_ms)
                )"
                .to_string(),
                "CREATE TABLE IF NOT EXISTS backfill_locks (
                    class VARCHAR(32) PRIMARY KEY,
                    run_id VARCHAR(128) NOT NULL
                )"
                .to_string(),
            ]
        };
        self.conn.run_ddl("sql_init_state_schema", &statements).await
    }

    fn decode_checkpoint(row: &sqlx::any::AnyRow) -> Result<BackfillCheckpoint, StorageError> {
        let json = text_column(row, "checkpoint")
            .ok_or_else(|| StorageError::Serialization("checkpoint is not text".into()))?;
        serde_json::from_str(&json).map_err(serialization)
    }
}

#[async_trait]
impl StateStore for SqlStateStore {
    async fn load_phase(&self) -> Result<Option<PhaseState>, StorageError> {
        let row = sqlx::query("SELECT state FROM migration_phase WHERE id = 1")
            .fetch_optional(self.conn.pool())
            .await
            .map_err(backend)?;
        match row.and_then(|r| text_column(&r, "state")) {
            Some(json) => serde_json::from_str(&json).map(Some).map_err(serialization),
            None => Ok(None),
        }
    }

    async fn save_phase(&self, state: &PhaseState) -> Result<(), StorageError> {
        let json = serde_json::to_string(state).map_err(serialization)?;
        let sql = if self.conn.is_sqlite() {
            "INSERT INTO migration_phase (id, state) VALUES (1, ?) \
             ON CONFLICT(id) DO UPDATE SET state = excluded.state"
        } else {
            "INSERT INTO migration_phase (id, state) VALUES (1, ?) \
             ON DUPLICATE KEY UPDATE state = VALUES(state)"
        };
        sqlx::query(sql)
            .bind(&json)
            .execute(self.conn.pool())
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn load_checkpoint(&self, run_id: &RunId) -> Result<Option<BackfillCheckpoint>, StorageError> {
        let row = sqlx::query("SELECT checkpoint FROM backfill_checkpoints WHERE run_id = ?")
            .bind(run_id.as_str())
            .fetch_optional(self.conn.pool())
            .await
            .map_err(backend)?;
        row.as_ref().map(Self::decode_checkpoint).transpose()
    }

    async fn save_checkpoint(&self, checkpoint: &BackfillCheckpoint) -> Result<(), StorageError> {
        let json = serde_json::to_string(checkpoint).map_err(serialization)?;
        let sql = if self.conn.is_sqlite() {
            "INSERT INTO backfill_checkpoints (run_id, class, started_at_ms, checkpoint) VALUES (?, ?, ?, ?) \
             ON CONFLICT(run_id) DO UPDATE SET checkpoint = excluded.checkpoint"
        } else {
            "INSERT INTO backfill_checkpoints (run_id, class, started_at_ms, checkpoint) VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE checkpoint = VALUES(checkpoint)"
        };
        sqlx::query(sql)
            .bind(checkpoint.run_id.as_str())
            .bind(checkpoint.class.as_str())
            .bind(checkpoint.started_at.timestamp_millis())
            .bind(&json)
            .execute(self.conn.pool())
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list_checkpoints(&self, class: RecordClass) -> Result<Vec<BackfillCheckpoint>, StorageError> {
        let rows = sqlx::query(
            "SELECT checkpoint FROM backfill_checkpoints WHERE class = ? ORDER BY started_at_ms DESC, run_id DESC",
        )
        .bind(class.as_str())
        .fetch_all(self.conn.pool())
        .await
        .map_err(backend)?;
        rows.iter().map(Self::decode_checkpoint).collect()
    }

    async fn acquire_run_lock(&self, class: RecordClass, run_id: &RunId) -> Result<LockOutcome, StorageError> {
        let insert = if self.conn.is_sqlite() {
            "INSERT OR IGNORE INTO backfill_locks (class, run_id) VALUES (?, ?)"
        } else {
            "INSERT IGNORE INTO backfill_locks (class, run_id) VALUES (?, ?)"
        };
        sqlx::query(insert)
            .bind(class.as_str())
            .bind(run_id.as_str())
            .execute(self.conn.pool())
            .await
            .map_err(backend)?;

        match self.run_lock_holder(class).await? {
            Some(holder) if &holder != run_id => Ok(LockOutcome::HeldBy(holder)),
            Some(_) => Ok(LockOutcome::Acquired),
            None => Err(StorageError::Backend(format!("lock row for {} vanished", class))),
        }
    }

    async fn release_run_lock(&self, class: RecordClass, run_id: &RunId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM backfill_locks WHERE class = ? AND run_id = ?")
            .bind(class.as_str())
            .bind(run_id.as_str())
            .execute(self.conn.pool())
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn run_lock_holder(&self, class: RecordClass) -> Result<Option<RunId>, StorageError> {
        let row = sqlx::query("SELECT run_id FROM backfill_locks WHERE class = ?")
            .bind(class.as_str())
            .fetch_optional(self.conn.pool())
            .await
            .map_err(backend)?;
        Ok(row.and_then(|r| text_column(&r, "run_id")).map(RunId::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::{BackfillOptions, RunStatus};
    use crate::phase::{MigrationPhase, PhaseOverrides};
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    fn checkpoint(class: RecordClass, run: &str, hour: u32) -> BackfillCheckpoint {
        let started = Utc.with_ymd_and_hms(2024, 4, 1, hour, 0, 0).unwrap();
        let options = BackfillOptions::new(started - Duration::days(1), started);
        BackfillCheckpoint::new(RunId::from(run), class, options, started)
    }

    async fn sql_store(dir: &TempDir) -> SqlStateStore {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("state.db").display());
        SqlStateStore::new(SqlConnection::connect(&url).await.unwrap()).await.unwrap()
    }

    async fn exercise_locks(store: &dyn StateStore) {
        let a = RunId::from("logs-a");
        let b = RunId::from("logs-b");

        assert_eq!(store.acquire_run_lock(RecordClass::Logs, &a).await.unwrap(), LockOutcome::Acquired);
        // Re-entrant for the holder
        assert_eq!(store.acquire_run_lock(RecordClass::Logs, &a).await.unwrap(), LockOutcome::Acquired);
        assert_eq!(
            store.acquire_run_lock(RecordClass::Logs, &b).await.unwrap(),
            LockOutcome::HeldBy(a.clone())
        );
        // Locks are per class
        assert_eq!(store.acquire_run_lock(RecordClass::Payments, &b).await.unwrap(), LockOutcome::Acquired);

        // Only the holder can release
        store.release_run_lock(RecordClass::Logs, &b).await.unwrap();
        assert_eq!(store.run_lock_holder(RecordClass::Logs).await.unwrap(), Some(a.clone()));
        store.release_run_lock(RecordClass::Logs, &a).await.unwrap();
        assert_eq!(store.run_lock_holder(RecordClass::Logs).await.unwrap(), None);
        assert_eq!(store.acquire_run_lock(RecordClass::Logs, &b).await.unwrap(), LockOutcome::Acquired);
    }

    async fn exercise_checkpoints(store: &dyn StateStore) {
        let older = checkpoint(RecordClass::Logs, "logs-older", 1);
        let mut newer = checkpoint(RecordClass::Logs, "logs-newer", 5);
        let payments = checkpoint(RecordClass::Payments, "payments-x", 3);

        store.save_checkpoint(&older).await.unwrap();
        store.save_checkpoint(&newer).await.unwrap();
        store.save_checkpoint(&payments).await.unwrap();

        newer.processed = 42;
        newer.status = RunStatus::Paused;
        store.save_checkpoint(&newer).await.unwrap();

        let loaded = store.load_checkpoint(&newer.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.processed, 42);
        assert_eq!(loaded.status, RunStatus::Paused);

        let listed = store.list_checkpoints(RecordClass::Logs).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|c| c.run_id.as_str()).collect();
        assert_eq!(ids, vec!["logs-newer", "logs-older"]);

        assert!(store.load_checkpoint(&RunId::from("missing")).await.unwrap().is_none());
    }

    async fn exercise_phase(store: &dyn StateStore) {
        assert!(store.load_phase().await.unwrap().is_none());

        let state = PhaseState::initial(MigrationPhase::DualWrite, PhaseOverrides::default());
        store.save_phase(&state).await.unwrap();
        let next = state.advance(MigrationPhase::DualWriteReadTarget, state.overrides, "ops");
        store.save_phase(&next).await.unwrap();

        let loaded = store.load_phase().await.unwrap().unwrap();
        assert_eq!(loaded.phase, MigrationPhase::DualWriteReadTarget);
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.changed_by, "ops");
    }

    #[tokio::test]
    async fn test_memory_state_store() {
        let store = MemoryStateStore::new();
        exercise_phase(&store).await;
        exercise_checkpoints(&store).await;
        exercise_locks(&store).await;
    }

    #[tokio::test]
    async fn test_sql_state_store() {
        let dir = TempDir::new().unwrap();
        let store = sql_store(&dir).await;
        exercise_phase(&store).await;
        exercise_checkpoints(&store).await;
        exercise_locks(&store).await;
    }

    #[tokio::test]
    async fn test_sql_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = sql_store(&dir).await;
            store.save_checkpoint(&checkpoint(RecordClass::Payments, "p-1", 2)).await.unwrap();
            store
                .acquire_run_lock(RecordClass::Payments, &RunId::from("p-1"))
                .await
                .unwrap();
        }

        let reopened = sql_store(&dir).await;
        assert!(reopened.load_checkpoint(&RunId::from("p-1")).await.unwrap().is_some());
        assert_eq!(
            reopened.run_lock_holder(RecordClass::Payments).await.unwrap(),
            Some(RunId::from("p-1"))
        );
    }
}
