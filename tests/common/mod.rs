//! Shared helpers for integration tests: fault-injecting store wrappers and
//! record builders.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use migration_engine::codec::{DistributedItem, ItemKey};
use migration_engine::storage::memory::{MemorySourceStore, MemoryTargetStore};
use migration_engine::storage::traits::{BatchWriteResult, SortRange, SourceRow, SourceStore, StorageError, TargetStore};
use migration_engine::{LogRecord, MigrationRecord, NaturalKey};

// =============================================================================
// Fault injection
// =============================================================================

/// Decides which calls of a wrapped store fail.
pub struct Faults {
    calls: AtomicU64,
    /// Fail every call while set.
    failing: AtomicBool,
    /// Fail calls numbered at or above this (1-indexed); 0 disables.
    fail_from_call: AtomicU64,
    /// Backend errors are transient, serialization errors are not.
    transient: bool,
    message: String,
}

impl Faults {
    pub fn new(message: &str) -> Self {
        Self {
            calls: AtomicU64::new(0),
            failing: AtomicBool::new(false),
            fail_from_call: AtomicU64::new(0),
            transient: true,
            message: message.to_string(),
        }
    }

    /// Errors the router and backfill will not retry.
    pub fn permanent(message: &str) -> Self {
        Self {
            transient: false,
            ..Self::new(message)
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Let `n` more calls through, then fail every call.
    pub fn fail_after(&self, n: u64) {
        let seen = self.calls.load(Ordering::SeqCst);
        self.fail_from_call.store(seen + n + 1, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.failing.store(false, Ordering::SeqCst);
        self.fail_from_call.store(0, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StorageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let from = self.fail_from_call.load(Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) || (from > 0 && call >= from) {
            return Err(if self.transient {
                StorageError::Backend(self.message.clone())
            } else {
                StorageError::Serialization(self.message.clone())
            });
        }
        Ok(())
    }
}

/// Source store wrapper that fails on demand.
pub struct FailingSourceStore<R: MigrationRecord> {
    pub inner: Arc<MemorySourceStore<R>>,
    pub faults: Faults,
}

impl<R: MigrationRecord> FailingSourceStore<R> {
    pub fn new(inner: Arc<MemorySourceStore<R>>, faults: Faults) -> Self {
        Self { inner, faults }
    }
}

#[async_trait]
impl<R: MigrationRecord> SourceStore<R> for FailingSourceStore<R> {
    async fn insert(&self, record: &R) -> Result<(), StorageError> {
        self.faults.check()?;
        self.inner.insert(record).await
    }

    async fn insert_batch(&self, records: &[R]) -> Result<usize, StorageError> {
        self.faults.check()?;
        self.inner.insert_batch(records).await
    }

    async fn query_by_application(&self, owner: i64) -> Result<Vec<R>, StorageError> {
        self.faults.check()?;
        self.inner.query_by_application(owner).await
    }

    async fn query_by_time_range(
        &self,
        scope: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<R>, StorageError> {
        self.faults.check()?;
        self.inner.query_by_time_range(scope, start, end).await
    }

    async fn count_by_time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<u64, StorageError> {
        self.faults.check()?;
        self.inner.count_by_time_range(start, end).await
    }

    async fn fetch_page(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        after: Option<&NaturalKey>,
        limit: usize,
    ) -> Result<Vec<SourceRow<R>>, StorageError> {
        self.faults.check()?;
        self.inner.fetch_page(start, end, after, limit).await
    }

    async fn distinct_scopes(&self) -> Result<Vec<String>, StorageError> {
        self.faults.check()?;
        self.inner.distinct_scopes().await
    }
}

/// Target store wrapper that fails on demand.
pub struct FailingTargetStore {
    pub inner: Arc<MemoryTargetStore>,
    pub faults: Faults,
}

impl FailingTargetStore {
    pub fn new(inner: Arc<MemoryTargetStore>, faults: Faults) -> Self {
        Self { inner, faults }
    }
}

#[async_trait]
impl TargetStore for FailingTargetStore {
    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }

    async fn put_item(&self, item: &DistributedItem) -> Result<bool, StorageError> {
        self.faults.check()?;
        self.inner.put_item(item).await
    }

    async fn put_items(&self, items: &[DistributedItem]) -> Result<BatchWriteResult, StorageError> {
        self.faults.check()?;
        self.inner.put_items(items).await
    }

    async fn get_item(&self, key: &ItemKey) -> Result<Option<DistributedItem>, StorageError> {
        self.faults.check()?;
        self.inner.get_item(key).await
    }

    async fn query_partition(
        &self,
        partition: &str,
        range: Option<&SortRange>,
    ) -> Result<Vec<DistributedItem>, StorageError> {
        self.faults.check()?;
        self.inner.query_partition(partition, range).await
    }

    async fn query_index(&self, index: &str, key: &str) -> Result<Vec<DistributedItem>, StorageError> {
        self.faults.check()?;
        self.inner.query_index(index, key).await
    }

    async fn count_between(&self, start_ms: i64, end_ms: i64) -> Result<u64, StorageError> {
        self.faults.check()?;
        self.inner.count_between(start_ms, end_ms).await
    }
}

// =============================================================================
// Record builders
// =============================================================================

/// `per_day` logs on each of `days` consecutive days starting at `base`.
pub fn daily_logs(base: DateTime<Utc>, days: i64, per_day: i64) -> Vec<LogRecord> {
    let mut records = Vec::new();
    for day in 0..days {
        for i in 0..per_day {
            let at = base + Duration::days(day) + Duration::minutes(7 * i + 1);
            records.push(LogRecord::new(day * 10_000 + i, "CreditBureau", "REQUEST", at).with_application(day));
        }
    }
    records
}

/// Start of a recent whole-day window, well inside log retention.
pub fn recent_base(days_ago: i64) -> DateTime<Utc> {
    let day = (Utc::now() - Duration::days(days_ago)).date_naive();
    day.and_hms_opt(0, 0, 0).map(|t| t.and_utc()).unwrap_or_else(Utc::now)
}
