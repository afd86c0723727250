// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for the relational system of record.
//!
//! One table per record class, keyed by natural key:
//! ```sql
//! CREATE TABLE integration_logs (
//!   scope VARCHAR(255) NOT NULL,   -- service name / customer id
//!   record_id BIGINT NOT NULL,
//!   ts_ms BIGINT NOT NULL,         -- record time, epoch millis
//!   owner_ref BIGINT,              -- application id / loan id
//!   payload LONGTEXT NOT NULL,     -- canonical record as JSON
//!   PRIMARY KEY (scope, record_id, ts_ms)
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver hands MySQL LONGTEXT back as bytes, so text columns are
//! read as `String` first and fall back to `Vec<u8>`. Payloads are stored as
//! TEXT rather than native JSON for the same reason.

use std::marker::PhantomData;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::warn;

use super::traits::{SourceRow, SourceStore, StorageError};
use crate::error::RecordConversionError;
use crate::record::{MigrationRecord, NaturalKey};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Read a text column, tolerating drivers that surface TEXT as bytes.
pub(crate) fn text_column(row: &AnyRow, name: &str) -> Option<String> {
    row.try_get::<String, _>(name).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(name)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

/// Shared connection pool plus the dialect it speaks.
#[derive(Clone)]
pub struct SqlConnection {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlConnection {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn connect(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        let conn = Self { pool, is_sqlite };
        if is_sqlite {
            conn.enable_wal_mode().await?;
        }
        Ok(conn)
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    #[must_use]
    pub fn is_sqlite(&self) -> bool {
        self.is_sqlite
    }

    /// WAL lets the validator read while backfill writes.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    /// Run DDL statements with startup retry.
    pub(crate) async fn run_ddl(&self, name: &str, statements: &[String]) -> Result<(), StorageError> {
        for sql in statements {
            retry(name, &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }
        Ok(())
    }
}

/// Relational store for one record class.
pub struct SqlSourceStore<R> {
    conn: SqlConnection,
    table: &'static str,
    _record: PhantomData<fn() -> R>,
}

impl<R: MigrationRecord> SqlSourceStore<R> {
    /// Open the class table on `conn`, creating it if missing.
    pub async fn new(conn: SqlConnection) -> Result<Self, StorageError> {
        let store = Self {
            conn,
            table: R::CLASS.source_table(),
            _record: PhantomData,
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &AnyPool {
        self.conn.pool()
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let t = self.table;
        let statements = if self.conn.is_sqlite {
            vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {t} (
                        scope TEXT NOT NULL,
                        record_id INTEGER NOT NULL,
                        ts_ms INTEGER NOT NULL,
                        owner_ref INTEGER,
                        payload TEXT NOT NULL,
                        PRIMARY KEY (scope, record_id, ts_ms)
                    )"
                ),
                format!("CREATE INDEX IF NOT EXISTS idx_{t}_ts ON {t} (ts_ms, scope, record_id)"),
                format!("CREATE INDEX IF NOT EXISTS idx_{t}_owner ON {t} (owner_ref)"),
            ]
        } else {
            // Binary collation keeps keyset order identical to NaturalKey's Ord
            vec![format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    scope VARCHAR(255) COLLATE utf8mb4_bin NOT NULL,
                    record_id BIGINT NOT NULL,
                    ts_ms BIGINT NOT NULL,
                    owner_ref BIGINT,
                    payload LONGTEXT NOT NULL,
                    PRIMARY KEY (scope, record_id, ts_ms),
                    INDEX idx_ts (ts_ms, scope, record_id),
                    INDEX idx_owner (owner_ref)
                )"
            )]
        };
        self.conn.run_ddl("sql_init_source_schema", &statements).await
    }

    fn upsert_sql(&self) -> String {
        let t = self.table;
        if self.conn.is_sqlite {
            format!(
                "INSERT INTO {t} (scope, record_id, ts_ms, owner_ref, payload) VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(scope, record_id, ts_ms) DO UPDATE SET \
                    owner_ref = excluded.owner_ref, \
                    payload = excluded.payload"
            )
        } else {
            format!(
                "INSERT INTO {t} (scope, record_id, ts_ms, owner_ref, payload) VALUES (?, ?, ?, ?, ?) \
                 ON DUPLICATE KEY UPDATE \
                    owner_ref = VALUES(owner_ref), \
                    payload = VALUES(payload)"
            )
        }
    }

    fn row_key(row: &AnyRow) -> Result<NaturalKey, StorageError> {
        let scope = text_column(row, "scope").ok_or_else(|| StorageError::Backend("row has no scope".into()))?;
        let record_id: i64 = row.try_get("record_id").map_err(backend)?;
        let ts_ms: i64 = row.try_get("ts_ms").map_err(backend)?;
        Ok(NaturalKey::new(ts_ms, scope, record_id))
    }

    fn decode_row(row: &AnyRow) -> Result<SourceRow<R>, StorageError> {
        let key = Self::row_key(row)?;
        let record = match text_column(row, "payload") {
            Some(json) => serde_json::from_str::<R>(&json)
                .map_err(|e| RecordConversionError::new(R::CLASS, &key.to_string(), e.to_string())),
            None => Err(RecordConversionError::new(R::CLASS, &key.to_string(), "payload is not text")),
        };
        Ok(SourceRow { key, record })
    }

    /// Decode rows for a read path. Unreadable rows are logged and skipped.
    fn decode_records(&self, rows: &[AnyRow]) -> Result<Vec<R>, StorageError> {
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match Self::decode_row(row)?.record {
                Ok(record) => records.push(record),
                Err(e) => warn!(table = self.table, error = %e, "Skipping unreadable source row"),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl<R: MigrationRecord> SourceStore<R> for SqlSourceStore<R> {
    async fn insert(&self, record: &R) -> Result<(), StorageError> {
        let payload = serde_json::to_string(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let key = record.natural_key();

        sqlx::query(&self.upsert_sql())
            .bind(&key.scope)
            .bind(key.id)
            .bind(key.timestamp_ms)
            .bind(record.owner_ref())
            .bind(&payload)
            .execute(self.conn.pool())
            .await
            .map_err(backend)?;
        Ok(())
    }

    /// Insert all records in one transaction.
    async fn insert_batch(&self, records: &[R]) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }
        let sql = self.upsert_sql();
        let mut tx = self.conn.pool().begin().await.map_err(backend)?;

        for record in records {
            let payload = serde_json::to_string(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
            let key = record.natural_key();
            sqlx::query(&sql)
                .bind(&key.scope)
                .bind(key.id)
                .bind(key.timestamp_ms)
                .bind(record.owner_ref())
                .bind(&payload)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)?;
        Ok(records.len())
    }

    async fn query_by_application(&self, owner: i64) -> Result<Vec<R>, StorageError> {
        let sql = format!(
            "SELECT scope, record_id, ts_ms, payload FROM {} WHERE owner_ref = ? \
             ORDER BY ts_ms DESC, scope DESC, record_id DESC",
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(owner)
            .fetch_all(self.conn.pool())
            .await
            .map_err(backend)?;
        self.decode_records(&rows)
    }

    async fn query_by_time_range(
        &self,
        scope: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<R>, StorageError> {
        let sql = format!(
            "SELECT scope, record_id, ts_ms, payload FROM {} \
             WHERE scope = ? AND ts_ms >= ? AND ts_ms <= ? \
             ORDER BY ts_ms DESC, record_id DESC",
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(scope)
            .bind(start.timestamp_millis())
            .bind(end.timestamp_millis())
            .fetch_all(self.conn.pool())
            .await
            .map_err(backend)?;
        self.decode_records(&rows)
    }

    async fn count_by_time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<u64, StorageError> {
        let sql = format!("SELECT COUNT(*) as cnt FROM {} WHERE ts_ms >= ? AND ts_ms <= ?", self.table);
        let row = sqlx::query(&sql)
            .bind(start.timestamp_millis())
            .bind(end.timestamp_millis())
            .fetch_one(self.conn.pool())
            .await
            .map_err(backend)?;
        let count: i64 = row.try_get("cnt").map_err(backend)?;
        Ok(count as u64)
    }

    async fn fetch_page(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        after: Option<&NaturalKey>,
        limit: usize,
    ) -> Result<Vec<SourceRow<R>>, StorageError> {
        let rows = match after {
            None => {
                let sql = format!(
                    "SELECT scope, record_id, ts_ms, payload FROM {} \
                     WHERE ts_ms >= ? AND ts_ms < ? \
                     ORDER BY ts_ms, scope, record_id LIMIT ?",
                    self.table
                );
                sqlx::query(&sql)
                    .bind(start.timestamp_millis())
                    .bind(end.timestamp_millis())
                    .bind(limit as i64)
                    .fetch_all(self.conn.pool())
                    .await
                    .map_err(backend)?
            }
            Some(cursor) => {
                let sql = format!(
                    "SELECT scope, record_id, ts_ms, payload FROM {} \
                     WHERE ts_ms >= ? AND ts_ms < ? \
                       AND (ts_ms > ? OR (ts_ms = ? AND (scope > ? OR (scope = ? AND record_id > ?)))) \
                     ORDER BY ts_ms, scope, record_id LIMIT ?",
                    self.table
                );
                sqlx::query(&sql)
                    .bind(start.timestamp_millis())
                    .bind(end.timestamp_millis())
                    .bind(cursor.timestamp_ms)
                    .bind(cursor.timestamp_ms)
                    .bind(&cursor.scope)
                    .bind(&cursor.scope)
                    .bind(cursor.id)
                    .bind(limit as i64)
                    .fetch_all(self.conn.pool())
                    .await
                    .map_err(backend)?
            }
        };

        rows.iter().map(Self::decode_row).collect()
    }

    async fn distinct_scopes(&self) -> Result<Vec<String>, StorageError> {
        let sql = format!("SELECT DISTINCT scope FROM {} ORDER BY scope", self.table);
        let rows = sqlx::query(&sql)
            .fetch_all(self.conn.pool())
            .await
            .map_err(backend)?;
        Ok(rows.iter().filter_map(|row| text_column(row, "scope")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LogRecord, PaymentRecord, PaymentStatus};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::TempDir;

    async fn open_store<R: MigrationRecord>(dir: &TempDir) -> SqlSourceStore<R> {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("source.db").display());
        let conn = SqlConnection::connect(&url).await.unwrap();
        SqlSourceStore::new(conn).await.unwrap()
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
    }

    fn log(id: i64, service: &str, minutes: i64) -> LogRecord {
        LogRecord::new(id, service, "REQUEST", base() + ChronoDuration::minutes(minutes))
    }

    #[tokio::test]
    async fn test_insert_and_query_by_time_range() {
        let dir = TempDir::new().unwrap();
        let store = open_store::<LogRecord>(&dir).await;

        store.insert(&log(1, "CreditBureau", 10)).await.unwrap();
        store.insert(&log(2, "CreditBureau", 20)).await.unwrap();
        store.insert(&log(3, "Payroll", 15)).await.unwrap();

        let records = store
            .query_by_time_range("CreditBureau", base(), base() + ChronoDuration::hours(1))
            .await
            .unwrap();
        let ids: Vec<i64> = records.iter().map(|r| r.log_id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_insert_is_upsert() {
        let dir = TempDir::new().unwrap();
        let store = open_store::<PaymentRecord>(&dir).await;

        let mut payment = PaymentRecord::new(9, 90, 900, 10_000, base(), "ACH");
        store.insert(&payment).await.unwrap();
        payment.update_status(PaymentStatus::Completed, base()).unwrap();
        store.insert(&payment).await.unwrap();

        let by_loan = store.query_by_application(90).await.unwrap();
        assert_eq!(by_loan.len(), 1);
        assert_eq!(by_loan[0].status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn test_insert_batch_and_count() {
        let dir = TempDir::new().unwrap();
        let store = open_store::<LogRecord>(&dir).await;

        let records: Vec<_> = (0..20).map(|i| log(i, "svc", i)).collect();
        assert_eq!(store.insert_batch(&records).await.unwrap(), 20);

        // Both ends inclusive
        let count = store
            .count_by_time_range(base() + ChronoDuration::minutes(5), base() + ChronoDuration::minutes(9))
            .await
            .unwrap();
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn test_fetch_page_resumes_after_cursor() {
        let dir = TempDir::new().unwrap();
        let store = open_store::<LogRecord>(&dir).await;

        // Two services share each instant so the cursor must break ties on scope
        let mut records = Vec::new();
        for i in 0..5 {
            records.push(log(i, "alpha", i));
            records.push(log(100 + i, "beta", i));
        }
        store.insert_batch(&records).await.unwrap();

        let end = base() + ChronoDuration::hours(1);
        let first = store.fetch_page(base(), end, None, 3).await.unwrap();
        let first_keys: Vec<_> = first.iter().map(|r| (r.key.scope.clone(), r.key.id)).collect();
        assert_eq!(
            first_keys,
            vec![("alpha".to_string(), 0), ("beta".to_string(), 100), ("alpha".to_string(), 1)]
        );

        let cursor = first.last().unwrap().key.clone();
        let rest = store.fetch_page(base(), end, Some(&cursor), 100).await.unwrap();
        assert_eq!(rest.len(), 7);
        assert!(rest.iter().all(|r| r.key > cursor));
    }

    #[tokio::test]
    async fn test_fetch_page_reports_malformed_payload() {
        let dir = TempDir::new().unwrap();
        let store = open_store::<LogRecord>(&dir).await;
        store.insert(&log(1, "svc", 1)).await.unwrap();

        sqlx::query("INSERT INTO integration_logs (scope, record_id, ts_ms, owner_ref, payload) VALUES (?, ?, ?, ?, ?)")
            .bind("svc")
            .bind(2i64)
            .bind((base() + ChronoDuration::minutes(2)).timestamp_millis())
            .bind(None::<i64>)
            .bind("{not json")
            .execute(store.pool())
            .await
            .unwrap();

        let page = store.fetch_page(base(), base() + ChronoDuration::hours(1), None, 10).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0].record.is_ok());
        let err = page[1].record.as_ref().unwrap_err();
        assert!(err.locator.contains("svc"));

        // Read paths skip the broken row
        let records = store
            .query_by_time_range("svc", base(), base() + ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_scopes() {
        let dir = TempDir::new().unwrap();
        let store = open_store::<LogRecord>(&dir).await;
        store
            .insert_batch(&[log(1, "b", 1), log(2, "a", 1), log(3, "b", 2)])
            .await
            .unwrap();

        assert_eq!(store.distinct_scopes().await.unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
