//! Best-effort cache facade over a [`CacheStore`].
//!
//! Every method degrades to a miss or a no-op on transport errors. The cache
//! is an optimization; callers must never depend on a write having landed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::keys::NAMESPACES;
use crate::metrics;
use crate::store::{CacheStore, MemoryStore};

/// Snapshot returned by [`Cache::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub connected: bool,
    pub mode: &'static str,
    /// Live key count per namespace; empty when the store is unreachable.
    pub keys: BTreeMap<&'static str, usize>,
}

#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn CacheStore>,
}

impl Cache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Cache over a fresh in-process store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// The underlying store, for callers that need raw error reporting.
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn mode(&self) -> &'static str {
        self.store.mode()
    }

    /// Read and deserialize `key`. Transport and decode errors count as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                tracing::debug!(key = %key, "cache miss");
                metrics::record_cache_miss();
                return None;
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache GET error");
                metrics::record_cache_error("get");
                metrics::record_cache_miss();
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                tracing::debug!(key = %key, "cache hit");
                metrics::record_cache_hit();
                Some(value)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cached value does not decode, treating as miss");
                metrics::record_cache_miss();
                None
            }
        }
    }

    /// Serialize and store `value` with expiry.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to serialize cache value");
                return;
            }
        };
        match self.store.set(key, &raw, ttl).await {
            Ok(()) => tracing::debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "cache set"),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache SET error");
                metrics::record_cache_error("set");
            }
        }
    }

    /// Delete a single key. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> bool {
        match self.store.delete(&[key.to_string()]).await {
            Ok(removed) => removed > 0,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache DEL error");
                metrics::record_cache_error("delete");
                false
            }
        }
    }

    /// Delete every key matching a Redis glob. No-op when nothing matches.
    pub async fn delete_pattern(&self, pattern: &str) -> u64 {
        let keys = match self.store.scan(pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Cache SCAN error");
                metrics::record_cache_error("scan");
                return 0;
            }
        };
        if keys.is_empty() {
            return 0;
        }

        match self.store.delete(&keys).await {
            Ok(removed) => {
                tracing::debug!(pattern = %pattern, removed, "cache pattern deleted");
                metrics::record_invalidated_keys(removed);
                removed
            }
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Cache pattern DEL error");
                metrics::record_cache_error("delete");
                0
            }
        }
    }

    /// Atomic increment; the expiry is applied when the counter is created.
    /// `None` when the store is unreachable.
    pub async fn increment_and_expire(&self, key: &str, ttl: Duration) -> Option<i64> {
        match self.store.incr_and_expire(key, ttl).await {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache INCR error");
                metrics::record_cache_error("incr");
                None
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.store.ping().await.is_ok()
    }

    pub async fn stats(&self) -> CacheStats {
        let connected = self.is_connected().await;
        let mut keys = BTreeMap::new();
        if connected {
            for namespace in NAMESPACES {
                match self.store.scan(&format!("{namespace}:*")).await {
                    Ok(found) => {
                        keys.insert(*namespace, found.len());
                    }
                    Err(e) => {
                        tracing::warn!(namespace = %namespace, error = %e, "Cache stats scan failed");
                    }
                }
            }
        }
        CacheStats {
            connected,
            mode: self.mode(),
            keys,
        }
    }

    /// Release the store's connections.
    pub async fn close(&self) {
        self.store.close().await;
    }
}
