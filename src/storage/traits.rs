// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::codec::{DistributedItem, ItemKey};
use crate::error::RecordConversionError;
use crate::record::{MigrationRecord, NaturalKey};

/// DynamoDB-style ceiling on items per batch write.
pub const DEFAULT_MAX_BATCH_ITEMS: usize = 25;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Batch of {size} items exceeds the store maximum of {max}")]
    BatchTooLarge { size: usize, max: usize },
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Network/timeout class failures worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// Result of a batch write operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchWriteResult {
    /// Unique batch ID for this write (for log correlation)
    pub batch_id: String,
    /// Number of items successfully written
    pub written: usize,
    /// Items left alone because the store held a newer revision
    pub superseded: usize,
}

/// Inclusive sort-key range for partition queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortRange {
    pub from: String,
    pub to: String,
}

impl SortRange {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    #[must_use]
    pub fn contains(&self, sort_key: &str) -> bool {
        self.from.as_str() <= sort_key && sort_key <= self.to.as_str()
    }
}

/// One row read from the source during backfill.
///
/// Malformed rows still carry their natural key so the cursor can move past them.
#[derive(Debug, Clone)]
pub struct SourceRow<R> {
    pub key: NaturalKey,
    pub record: Result<R, RecordConversionError>,
}

impl<R: MigrationRecord> SourceRow<R> {
    pub fn valid(record: R) -> Self {
        Self {
            key: record.natural_key(),
            record: Ok(record),
        }
    }
}

/// Relational system of record for one record class.
#[async_trait]
pub trait SourceStore<R: MigrationRecord>: Send + Sync {
    async fn insert(&self, record: &R) -> Result<(), StorageError>;

    /// Insert a batch. Default implementation falls back to sequential inserts.
    async fn insert_batch(&self, records: &[R]) -> Result<usize, StorageError> {
        for record in records {
            self.insert(record).await?;
        }
        Ok(records.len())
    }

    /// Records owned by `owner` (application id / loan id), newest first.
    async fn query_by_application(&self, owner: i64) -> Result<Vec<R>, StorageError>;

    /// Records of `scope` with `start <= timestamp <= end`, newest first.
    async fn query_by_time_range(
        &self,
        scope: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<R>, StorageError>;

    /// Count of records with `start <= timestamp <= end`, all scopes.
    async fn count_by_time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<u64, StorageError>;

    /// Keyset page of rows with `start <= timestamp < end`, ordered by
    /// natural key, strictly after `after` when given.
    async fn fetch_page(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        after: Option<&NaturalKey>,
        limit: usize,
    ) -> Result<Vec<SourceRow<R>>, StorageError>;

    /// Distinct scopes (service names / customers) present in the store.
    async fn distinct_scopes(&self) -> Result<Vec<String>, StorageError>;
}

/// Distributed key-value store holding one record class.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Largest batch accepted by [`put_items`](Self::put_items).
    fn max_batch_size(&self) -> usize {
        DEFAULT_MAX_BATCH_ITEMS
    }

    /// Insert or overwrite an item by its key, unless the stored item has a
    /// higher revision. Returns whether the item was applied.
    async fn put_item(&self, item: &DistributedItem) -> Result<bool, StorageError>;

    /// Write a batch of at most [`max_batch_size`](Self::max_batch_size) items.
    /// Default implementation falls back to sequential puts.
    async fn put_items(&self, items: &[DistributedItem]) -> Result<BatchWriteResult, StorageError> {
        if items.len() > self.max_batch_size() {
            return Err(StorageError::BatchTooLarge {
                size: items.len(),
                max: self.max_batch_size(),
            });
        }
        let mut superseded = 0;
        for item in items {
            if !self.put_item(item).await? {
                superseded += 1;
            }
        }
        Ok(BatchWriteResult {
            batch_id: String::new(),
            written: items.len(),
            superseded,
        })
    }

    async fn get_item(&self, key: &ItemKey) -> Result<Option<DistributedItem>, StorageError>;

    /// Items of one partition in ascending sort-key order.
    async fn query_partition(
        &self,
        partition: &str,
        range: Option<&SortRange>,
    ) -> Result<Vec<DistributedItem>, StorageError>;

    /// Items indexed under `index`/`key`, ascending by time.
    async fn query_index(&self, index: &str, key: &str) -> Result<Vec<DistributedItem>, StorageError>;

    /// Count of live items with `start_ms <= timestamp_ms <= end_ms`.
    async fn count_between(&self, start_ms: i64, end_ms: i64) -> Result<u64, StorageError>;
}
