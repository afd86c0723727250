// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Time-bounded lookup cache.
//!
//! Caches slow-changing lookup values (distinct service names, customer
//! scopes) with a fixed expiry. It sits beside the engine, never on the
//! write path: a stale entry only delays a new value showing up in a
//! lookup list.
//!
//! ```text
//! get_or_load(key)
//!       │
//!       ├─→ Hit + not expired → return cached value
//!       │
//!       └─→ Miss OR expired → run loader, cache result
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::metrics;

#[derive(Clone, Debug)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

/// Key → value cache where every entry lives for the same fixed TTL.
pub struct TimedCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq)]
pub struct TimedCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: usize,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

impl<V: Clone> TimedCache<V> {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached value if present and younger than the TTL.
    pub fn get(&self, key: &str) -> Option<V> {
        if let Some(entry) = self.entries.get(key) {
            if entry.stored_at.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_lookup_cache(true);
                return Some(entry.value.clone());
            }
            drop(entry); // Release read lock before removing
            self.entries.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_lookup_cache(false);
        None
    }

    pub fn insert(&self, key: &str, value: V) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Return the cached value or run `load` and cache its result.
    /// Loader errors are passed through and nothing is cached.
    pub async fn get_or_load<F, Fut, E>(&self, key: &str, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = load().await?;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn stats(&self) -> TimedCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        TimedCacheStats {
            hits,
            misses,
            entry_count: self.entries.len(),
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = TimedCache::new(Duration::from_secs(60));
        cache.insert("services", vec!["Bureau".to_string()]);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get("services").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("services").is_none());
        assert_eq!(cache.stats().entry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_load_runs_loader_once_per_ttl() {
        let cache = TimedCache::new(Duration::from_secs(300));
        let loads = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let loads = loads.clone();
            let value: Result<u32, String> = cache
                .get_or_load("count", || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await;
            assert_eq!(value.unwrap(), 7);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        let loads2 = loads.clone();
        let _: Result<u32, String> = cache
            .get_or_load("count", || async move {
                loads2.fetch_add(1, Ordering::SeqCst);
                Ok(8)
            })
            .await;
        assert_eq!(loads.load(Ordering::SeqCst), 2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn test_loader_error_is_not_cached() {
        let cache: TimedCache<u32> = TimedCache::new(Duration::from_secs(300));

        let first: Result<u32, String> = cache.get_or_load("k", || async { Err("down".to_string()) }).await;
        assert!(first.is_err());

        let second: Result<u32, String> = cache.get_or_load("k", || async { Ok(1) }).await;
        assert_eq!(second.unwrap(), 1);
    }

    #[test]
    fn test_invalidate() {
        let cache = TimedCache::new(Duration::from_secs(300));
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.invalidate("a");
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b"), Some(2));
        cache.clear();
        assert!(cache.get("b").is_none());
    }
}
