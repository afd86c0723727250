// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::traits::{SortRange, SourceRow, SourceStore, StorageError, TargetStore, DEFAULT_MAX_BATCH_ITEMS};
use crate::codec::{system_clock, Clock, DistributedItem, ItemKey};
use crate::error::RecordConversionError;
use crate::record::{MigrationRecord, NaturalKey};

/// In-process relational stand-in, ordered by natural key.
pub struct MemorySourceStore<R> {
    rows: RwLock<BTreeMap<NaturalKey, Result<R, RecordConversionError>>>,
}

impl<R: MigrationRecord> MemorySourceStore<R> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    /// Seed the store without going through the trait.
    pub fn with_records(records: impl IntoIterator<Item = R>) -> Self {
        let store = Self::new();
        {
            let mut rows = store.rows.write();
            for record in records {
                rows.insert(record.natural_key(), Ok(record));
            }
        }
        store
    }

    /// Store a row that will fail conversion when read back.
    pub fn insert_malformed(&self, key: NaturalKey, reason: &str) {
        let error = RecordConversionError::new(R::CLASS, &key.to_string(), reason);
        self.rows.write().insert(key, Err(error));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    fn valid_records(&self) -> Vec<R> {
        self.rows
            .read()
            .values()
            .filter_map(|row| row.as_ref().ok().cloned())
            .collect()
    }
}

impl<R: MigrationRecord> Default for MemorySourceStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

fn newest_first<R: MigrationRecord>(mut records: Vec<R>) -> Vec<R> {
    records.sort_by(|a, b| b.natural_key().cmp(&a.natural_key()));
    records
}

#[async_trait]
impl<R: MigrationRecord> SourceStore<R> for MemorySourceStore<R> {
    async fn insert(&self, record: &R) -> Result<(), StorageError> {
        self.rows.write().insert(record.natural_key(), Ok(record.clone()));
        Ok(())
    }

    async fn insert_batch(&self, records: &[R]) -> Result<usize, StorageError> {
        let mut rows = self.rows.write();
        for record in records {
            rows.insert(record.natural_key(), Ok(record.clone()));
        }
        Ok(records.len())
    }

    async fn query_by_application(&self, owner: i64) -> Result<Vec<R>, StorageError> {
        let matching = self
            .valid_records()
            .into_iter()
            .filter(|r| r.owner_ref() == Some(owner))
            .collect();
        Ok(newest_first(matching))
    }

    async fn query_by_time_range(
        &self,
        scope: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<R>, StorageError> {
        let matching = self
            .valid_records()
            .into_iter()
            .filter(|r| r.scope() == scope && r.timestamp() >= start && r.timestamp() <= end)
            .collect();
        Ok(newest_first(matching))
    }

    async fn count_by_time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<u64, StorageError> {
        let (start_ms, end_ms) = (start.timestamp_millis(), end.timestamp_millis());
        let count = self
            .rows
            .read()
            .keys()
            .filter(|k| k.timestamp_ms >= start_ms && k.timestamp_ms <= end_ms)
            .count();
        Ok(count as u64)
    }

    async fn fetch_page(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        after: Option<&NaturalKey>,
        limit: usize,
    ) -> Result<Vec<SourceRow<R>>, StorageError> {
        let (start_ms, end_ms) = (start.timestamp_millis(), end.timestamp_millis());
        let lower = match after {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Included(NaturalKey::new(start_ms, String::new(), i64::MIN)),
        };
        let rows = self.rows.read();
        let page = rows
            .range((lower, Bound::Unbounded))
            .filter(|(k, _)| k.timestamp_ms >= start_ms)
            .take_while(|(k, _)| k.timestamp_ms < end_ms)
            .take(limit)
            .map(|(k, row)| SourceRow {
                key: k.clone(),
                record: row.clone(),
            })
            .collect();
        Ok(page)
    }

    async fn distinct_scopes(&self) -> Result<Vec<String>, StorageError> {
        let scopes: BTreeSet<String> = self.rows.read().keys().map(|k| k.scope.clone()).collect();
        Ok(scopes.into_iter().collect())
    }
}

/// In-process key-value stand-in. Expiry is evaluated at read time.
pub struct MemoryTargetStore {
    items: DashMap<ItemKey, DistributedItem>,
    max_batch: usize,
    clock: Clock,
}

impl MemoryTargetStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
            max_batch: DEFAULT_MAX_BATCH_ITEMS,
            clock: system_clock(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    /// Number of stored items, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&self) {
        self.items.clear();
    }

    fn live_items(&self) -> Vec<DistributedItem> {
        let now = (self.clock)();
        self.items
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .map(|entry| entry.value().clone())
            .collect()
    }
}

impl Default for MemoryTargetStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    fn max_batch_size(&self) -> usize {
        self.max_batch
    }

    async fn put_item(&self, item: &DistributedItem) -> Result<bool, StorageError> {
        let now = (self.clock)();
        match self.items.entry(item.key.clone()) {
            Entry::Occupied(mut stored) => {
                if !stored.get().is_expired(now) && item.is_superseded_by(stored.get()) {
                    return Ok(false);
                }
                stored.insert(item.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(item.clone());
            }
        }
        Ok(true)
    }

    async fn get_item(&self, key: &ItemKey) -> Result<Option<DistributedItem>, StorageError> {
        let now = (self.clock)();
        Ok(self
            .items
            .get(key)
            .map(|r| r.value().clone())
            .filter(|item| !item.is_expired(now)))
    }

    async fn query_partition(
        &self,
        partition: &str,
        range: Option<&SortRange>,
    ) -> Result<Vec<DistributedItem>, StorageError> {
        let mut items: Vec<DistributedItem> = self
            .live_items()
            .into_iter()
            .filter(|item| item.key.partition == partition)
            .filter(|item| range.map_or(true, |r| r.contains(&item.key.sort)))
            .collect();
        items.sort_by(|a, b| a.key.sort.cmp(&b.key.sort));
        Ok(items)
    }

    async fn query_index(&self, index: &str, key: &str) -> Result<Vec<DistributedItem>, StorageError> {
        let mut items: Vec<DistributedItem> = self
            .live_items()
            .into_iter()
            .filter(|item| item.indexes.iter().any(|e| e.index == index && e.key == key))
            .collect();
        items.sort_by(|a, b| (a.timestamp_ms, &a.key.sort).cmp(&(b.timestamp_ms, &b.key.sort)));
        Ok(items)
    }

    async fn count_between(&self, start_ms: i64, end_ms: i64) -> Result<u64, StorageError> {
        let count = self
            .live_items()
            .iter()
            .filter(|item| item.timestamp_ms >= start_ms && item.timestamp_ms <= end_ms)
            .count();
        Ok(count as u64)
    }
}
