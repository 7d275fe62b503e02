//! Key/value store backends.
//!
//! ## Backends
//!
//! - **Redis**: shared across every web and worker process; the only backend
//!   that gives fleet-wide lock and counter semantics
//! - **Memory**: single-process fallback used when Redis is disabled or
//!   unreachable, and as the fake in tests
//!
//! Every primitive that has to be atomic across processes (lock acquisition,
//! owner-checked release, increment-with-expiry) is a single store call so the
//! Redis backend can execute it as one command or script.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheError;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisStore, create_pool};

/// Raw key/value operations on serialized values.
///
/// Implementations report transport failures as errors; the best-effort
/// behaviour callers see is layered on top by [`crate::Cache`].
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Backend name for stats and logs ("redis" or "local").
    fn mode(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Atomic "set if not exists" with expiry. Returns `true` when the key
    /// was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, CacheError>;

    /// Delete `key` only while it still holds `expected`. Returns `true` when
    /// the key was removed.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, CacheError>;

    /// Delete the given keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// Enumerate keys matching a Redis-style glob pattern.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Atomic increment. When the counter is created by this call (new value
    /// is 1) the expiry is applied.
    async fn incr_and_expire(&self, key: &str, ttl: Duration) -> Result<i64, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;

    /// Release underlying connections.
    async fn close(&self) {}
}

/// Expiry in milliseconds; Redis rejects a zero expiry.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}
