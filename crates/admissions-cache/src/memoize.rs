//! Stampede-safe memoization.
//!
//! On a miss, the first caller takes `<key>:lock` (set-if-absent with expiry)
//! and computes; concurrent callers poll the key until the value appears.
//! The lock expiry bounds how long a crashed holder can block others.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::cache::Cache;
use crate::error::CacheError;
use crate::keys::CacheKeys;
use crate::metrics;
use crate::store::CacheStore;

/// Memoizer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoizerConfig {
    /// TTL for values written by `get_or_set` / `cached_query`, in seconds
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Lock expiry, in seconds
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Sleep between polls while another caller holds the lock
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_lock_ttl_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for MemoizerConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl MemoizerConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Lock key guarding the computation of `key`.
pub fn lock_key(key: &str) -> String {
    format!("{key}:lock")
}

/// A held distributed lock.
///
/// The owner token makes release a compare-and-delete, so a holder whose lock
/// already expired cannot delete a lock taken over by someone else. Dropping
/// the guard without calling [`LockGuard::release`] (panic, cancelled future)
/// still releases it from a spawned task.
pub struct LockGuard {
    store: Arc<dyn CacheStore>,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    /// Try to take `key`. `Ok(None)` means someone else holds it.
    pub async fn acquire(
        store: Arc<dyn CacheStore>,
        key: String,
        ttl: Duration,
    ) -> Result<Option<Self>, CacheError> {
        let token = uuid::Uuid::new_v4().to_string();
        if store.set_if_absent(&key, &token, ttl).await? {
            Ok(Some(Self {
                store,
                key,
                token,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock if this guard still owns it.
    pub async fn release(mut self) -> bool {
        self.released = true;
        match self.store.delete_if_equals(&self.key, &self.token).await {
            Ok(released) => released,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Failed to release lock, it will expire");
                false
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = store.delete_if_equals(&key, &token).await {
                tracing::warn!(key = %key, error = %e, "Failed to release dropped lock");
            }
        });
    }
}

/// Read-through cache with stampede protection.
#[derive(Clone)]
pub struct Memoizer {
    cache: Cache,
    config: MemoizerConfig,
}

impl Memoizer {
    pub fn new(cache: Cache, config: MemoizerConfig) -> Self {
        Self { cache, config }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn config(&self) -> &MemoizerConfig {
        &self.config
    }

    /// Return the cached value for `key`, computing it at most once across
    /// all callers sharing the store.
    ///
    /// Waiters poll until the value appears or the lock is free again. Once
    /// `lock_ttl` (plus one poll) has passed without either, the caller
    /// computes without caching. A failing lock primitive also computes
    /// without caching. Errors from `compute` are returned unchanged and are
    /// never cached.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        lock_ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let poll = self.config.poll_interval();
        let deadline = Instant::now() + lock_ttl + poll;
        let lock = lock_key(key);

        loop {
            if let Some(value) = self.cache.get::<T>(key).await {
                return Ok(value);
            }

            match LockGuard::acquire(Arc::clone(self.cache.store()), lock.clone(), lock_ttl).await {
                Ok(Some(guard)) => {
                    // The previous holder may have filled the key between our
                    // read and the acquire.
                    if let Some(value) = self.cache.get::<T>(key).await {
                        guard.release().await;
                        return Ok(value);
                    }

                    metrics::record_compute("locked");
                    let result = compute().await;
                    if let Ok(value) = &result {
                        self.cache.set(key, value, ttl).await;
                    }
                    guard.release().await;
                    return result;
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        tracing::warn!(
                            key = %key,
                            lock_ttl_ms = lock_ttl.as_millis() as u64,
                            "Gave up waiting for cache lock, computing without cache"
                        );
                        break;
                    }
                    tokio::time::sleep(poll).await;
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Cache lock error, computing without cache");
                    break;
                }
            }
        }

        metrics::record_compute("uncached");
        compute().await
    }

    /// Plain read-through without the lock: read, else compute and store.
    pub async fn get_or_set<T, E, F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.cache.get::<T>(key).await {
            return Ok(value);
        }
        let value = compute().await?;
        self.cache.set(key, &value, ttl).await;
        Ok(value)
    }

    /// Locked read-through under the query namespace
    /// (`prisma:<operation>:<key>`) with the configured lock TTL.
    pub async fn cached_query<T, E, F, Fut>(
        &self,
        operation: &str,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let cache_key = CacheKeys::query(operation, key);
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        self.get_or_compute(&cache_key, ttl, self.config.lock_ttl(), compute)
            .await
    }

    /// Drop every cached result of one query operation.
    pub async fn invalidate_query(&self, operation: &str) -> u64 {
        self.cache
            .delete_pattern(&CacheKeys::query(operation, "*"))
            .await
    }
}
