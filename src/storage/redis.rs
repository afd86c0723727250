// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend for the distributed key-value store.
//!
//! Each record class lives in its own namespace (`{prefix}{table}:`):
//!
//! ```text
//! {ns}item:{pk}|{sk}           STRING  item JSON, EXPIREAT = record expiry
//! {ns}part:{pk}                ZSET    sort keys of the partition (lex ordered)
//! {ns}idx:{index}:{key}        ZSET    "pk|sk" members scored by record time
//! {ns}time                     ZSET    every "pk|sk", scored by record time
//! ```
//!
//! Writes go through a small Lua script so an item never moves back to a
//! lower revision, even when a stale batch races a live update.
//!
//! Redis drops expired item keys on its own; the sorted sets are only
//! pointers. Reads resolve pointers with MGET and skip anything that has
//! expired or been rewritten under a different index key, pruning the
//! stale member as they go.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, Client};
use tracing::debug;

use super::traits::{BatchWriteResult, SortRange, StorageError, TargetStore, DEFAULT_MAX_BATCH_ITEMS};
use crate::codec::{DistributedItem, ItemKey};
use crate::record::RecordClass;
use crate::resilience::retry::{retry, RetryConfig};

/// Members resolved per MGET / EXISTS round trip.
const RESOLVE_CHUNK: usize = 500;

/// Writes one item unless the stored document carries a higher revision.
///
/// KEYS: item, partition set, time set, then one set per index entry.
/// ARGV: document, expires_at, sort key, member, timestamp_ms, revision.
const PUT_IF_NOT_OLDER: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
  local ok, stored = pcall(cjson.decode, current)
  if ok and type(stored) == 'table' and (tonumber(stored['revision']) or 0) > tonumber(ARGV[6]) then
    return 0
  end
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('EXPIREAT', KEYS[1], ARGV[2])
redis.call('ZADD', KEYS[2], 0, ARGV[3])
for i = 3, #KEYS do
  redis.call('ZADD', KEYS[i], ARGV[5], ARGV[4])
end
return 1
"#;

fn backend(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub struct RedisTargetStore {
    connection: ConnectionManager,
    /// Namespace for this class, prefix included (e.g. "lending:payments:")
    namespace: String,
    max_batch: usize,
}

impl RedisTargetStore {
    /// Connect with startup-mode retry and scope all keys to `class`.
    ///
    /// ```rust,no_run
    /// # use migration_engine::storage::redis::RedisTargetStore;
    /// # use migration_engine::RecordClass;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // Keys look like "lending:integration-logs:item:..."
    /// let store = RedisTargetStore::connect("redis://localhost", Some("lending:"), RecordClass::Logs).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(
        connection_string: &str,
        prefix: Option<&str>,
        class: RecordClass,
    ) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(backend)?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(backend)?;

        Ok(Self::with_connection(connection, prefix, class))
    }

    /// Share an existing connection between class stores.
    #[must_use]
    pub fn with_connection(connection: ConnectionManager, prefix: Option<&str>, class: RecordClass) -> Self {
        Self {
            connection,
            namespace: format!("{}{}:", prefix.unwrap_or(""), class.target_table()),
            max_batch: DEFAULT_MAX_BATCH_ITEMS,
        }
    }

    #[must_use]
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn item_key(&self, member: &str) -> String {
        format!("{}item:{}", self.namespace, member)
    }

    fn partition_key(&self, partition: &str) -> String {
        format!("{}part:{}", self.namespace, partition)
    }

    fn index_key(&self, index: &str, key: &str) -> String {
        format!("{}idx:{}:{}", self.namespace, index, key)
    }

    fn time_key(&self) -> String {
        format!("{}time", self.namespace)
    }

    /// Queue the conditional write for one item. Overwrites at the same
    /// revision are idempotent.
    fn queue_item(&self, pipeline: &mut redis::Pipeline, item: &DistributedItem) -> Result<(), StorageError> {
        let doc = item.to_json().map_err(|e| StorageError::Serialization(e.to_string()))?;
        let member = item.key.to_string();

        let mut keys = vec![
            self.item_key(&member),
            self.partition_key(&item.key.partition),
            self.time_key(),
        ];
        keys.extend(item.indexes.iter().map(|e| self.index_key(&e.index, &e.key)));

        pipeline
            .cmd("EVAL")
            .arg(PUT_IF_NOT_OLDER)
            .arg(keys.len())
            .arg(keys)
            .arg(doc)
            .arg(item.expires_at)
            .arg(&item.key.sort)
            .arg(&member)
            .arg(item.timestamp_ms)
            .arg(item.revision);
        Ok(())
    }

    /// Returns how many items were applied.
    async fn write_atomic(&self, items: &[DistributedItem]) -> Result<usize, StorageError> {
        let mut pipeline = pipe();
        pipeline.atomic();
        for item in items {
            self.queue_item(&mut pipeline, item)?;
        }
        let mut conn = self.connection.clone();
        let applied: Vec<i64> = pipeline.query_async(&mut conn).await.map_err(backend)?;
        Ok(applied.iter().filter(|&&a| a == 1).count())
    }

    /// Resolve "pk|sk" members to live items, preserving member order.
    /// Returns the items and the members that no longer resolve.
    async fn resolve(&self, members: &[String]) -> Result<(Vec<DistributedItem>, Vec<String>), StorageError> {
        let now = Utc::now();
        let mut items = Vec::with_capacity(members.len());
        let mut stale = Vec::new();

        for chunk in members.chunks(RESOLVE_CHUNK) {
            if chunk.is_empty() {
                continue;
            }
            let keys: Vec<String> = chunk.iter().map(|m| self.item_key(m)).collect();
            let mut conn = self.connection.clone();
            let docs: Vec<Option<String>> = cmd("MGET").arg(&keys).query_async(&mut conn).await.map_err(backend)?;

            for (member, doc) in chunk.iter().zip(docs) {
                let parsed = doc.and_then(|d| DistributedItem::from_json(&d).ok());
                match parsed {
                    Some(item) if !item.is_expired(now) => items.push(item),
                    _ => stale.push(member.clone()),
                }
            }
        }
        Ok((items, stale))
    }

    async fn prune(&self, set_key: &str, members: &[String]) {
        if members.is_empty() {
            return;
        }
        let mut conn = self.connection.clone();
        let result: Result<(), redis::RedisError> = cmd("ZREM").arg(set_key).arg(members.to_vec()).query_async(&mut conn).await;
        match result {
            Ok(()) => debug!(set = set_key, pruned = members.len(), "Pruned stale members"),
            Err(e) => debug!(set = set_key, error = %e, "Failed to prune stale members"),
        }
    }
}

#[async_trait]
impl TargetStore for RedisTargetStore {
    fn max_batch_size(&self) -> usize {
        self.max_batch
    }

    async fn put_item(&self, item: &DistributedItem) -> Result<bool, StorageError> {
        Ok(self.write_atomic(std::slice::from_ref(item)).await? == 1)
    }

    /// All items land in one MULTI/EXEC, so a batch is all-or-nothing.
    async fn put_items(&self, items: &[DistributedItem]) -> Result<BatchWriteResult, StorageError> {
        if items.len() > self.max_batch {
            return Err(StorageError::BatchTooLarge {
                size: items.len(),
                max: self.max_batch,
            });
        }
        if items.is_empty() {
            return Ok(BatchWriteResult {
                batch_id: String::new(),
                written: 0,
                superseded: 0,
            });
        }

        let batch_id = uuid::Uuid::new_v4().to_string();
        let applied = self.write_atomic(items).await?;
        let superseded = items.len().saturating_sub(applied);
        debug!(
            batch_id = %batch_id,
            count = items.len(),
            superseded,
            namespace = %self.namespace,
            "Batch written"
        );

        Ok(BatchWriteResult {
            batch_id,
            written: items.len(),
            superseded,
        })
    }

    async fn get_item(&self, key: &ItemKey) -> Result<Option<DistributedItem>, StorageError> {
        let mut conn = self.connection.clone();
        let doc: Option<String> = cmd("GET")
            .arg(self.item_key(&key.to_string()))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        match doc {
            Some(d) => {
                let item = DistributedItem::from_json(&d).map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(item).filter(|i| !i.is_expired(Utc::now())))
            }
            None => Ok(None),
        }
    }

    async fn query_partition(
        &self,
        partition: &str,
        range: Option<&SortRange>,
    ) -> Result<Vec<DistributedItem>, StorageError> {
        let (min, max) = match range {
            Some(r) => (format!("[{}", r.from), format!("[{}", r.to)),
            None => ("-".to_string(), "+".to_string()),
        };
        let set_key = self.partition_key(partition);
        let mut conn = self.connection.clone();
        let sort_keys: Vec<String> = cmd("ZRANGEBYLEX")
            .arg(&set_key)
            .arg(&min)
            .arg(&max)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        let members: Vec<String> = sort_keys
            .iter()
            .map(|sk| ItemKey::new(partition, sk.as_str()).to_string())
            .collect();
        let (items, stale) = self.resolve(&members).await?;

        // Partition sets hold bare sort keys
        let stale_sorts: Vec<String> = stale
            .iter()
            .filter_map(|m| m.rsplit_once('|').map(|(_, sk)| sk.to_string()))
            .collect();
        self.prune(&set_key, &stale_sorts).await;

        Ok(items)
    }

    async fn query_index(&self, index: &str, key: &str) -> Result<Vec<DistributedItem>, StorageError> {
        let set_key = self.index_key(index, key);
        let mut conn = self.connection.clone();
        let members: Vec<String> = cmd("ZRANGE")
            .arg(&set_key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        let (resolved, mut stale) = self.resolve(&members).await?;

        // An overwrite can move an item to a different index key (payment status)
        let mut items = Vec::with_capacity(resolved.len());
        for item in resolved {
            if item.indexes.iter().any(|e| e.index == index && e.key == key) {
                items.push(item);
            } else {
                stale.push(item.key.to_string());
            }
        }
        self.prune(&set_key, &stale).await;

        Ok(items)
    }

    /// Counts pointers in the time set whose item key still exists.
    async fn count_between(&self, start_ms: i64, end_ms: i64) -> Result<u64, StorageError> {
        let set_key = self.time_key();
        let mut conn = self.connection.clone();
        let members: Vec<String> = cmd("ZRANGEBYSCORE")
            .arg(&set_key)
            .arg(start_ms)
            .arg(end_ms)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        let mut live = 0u64;
        let mut stale = Vec::new();
        for chunk in members.chunks(RESOLVE_CHUNK) {
            let mut pipeline = pipe();
            for member in chunk {
                pipeline.exists(self.item_key(member));
            }
            let exists: Vec<bool> = pipeline.query_async(&mut conn).await.map_err(backend)?;
            for (member, present) in chunk.iter().zip(exists) {
                if present {
                    live += 1;
                } else {
                    stale.push(member.clone());
                }
            }
        }
        self.prune(&set_key, &stale).await;

        Ok(live)
    }
}
