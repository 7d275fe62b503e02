//! Caching core for the admissions portal.
//!
//! - [`CacheStore`]: raw key/value primitives, backed by Redis or memory
//! - [`Cache`]: best-effort typed facade (errors degrade to miss / no-op)
//! - [`Memoizer`]: read-through with a distributed lock against stampedes
//! - [`Invalidator`]: tag and change-type driven pattern deletes
//! - [`RateLimiter`]: fixed-window counters that fail open
//!
//! Clients are constructed explicitly and passed to whoever needs them:
//!
//! ```ignore
//! let store = connect_store(&redis_config).await;
//! let cache = Cache::new(store);
//! let memoizer = Memoizer::new(cache.clone(), MemoizerConfig::default());
//! let stats = memoizer
//!     .get_or_compute(&CacheKeys::statistics(None), ttl, lock_ttl, || load_stats())
//!     .await?;
//! ```

use std::sync::Arc;

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod invalidate;
pub mod keys;
pub mod memoize;
pub mod metrics;
pub mod rate_limit;
pub mod store;

pub use cache::{Cache, CacheStats};
pub use config::RedisConfig;
pub use error::CacheError;
pub use invalidate::{CacheTag, ChangeContext, ChangeType, InvalidationPlan, Invalidator};
pub use keys::{CacheKeys, derive_key};
pub use memoize::{LockGuard, Memoizer, MemoizerConfig};
pub use rate_limit::{RateLimitDecision, RateLimiter};
pub use store::{CacheStore, MemoryStore, RedisStore};

/// Connect the configured store.
///
/// Falls back to the in-process store when Redis is disabled or unreachable,
/// so a missing cache never prevents startup.
pub async fn connect_store(config: &RedisConfig) -> Arc<dyn CacheStore> {
    if !config.enabled {
        tracing::info!("Redis disabled, using local cache store");
        return Arc::new(MemoryStore::new());
    }

    match RedisStore::connect(config).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(
                url = %config.redacted_url(),
                error = %e,
                "Redis unavailable, falling back to local cache store"
            );
            Arc::new(MemoryStore::new())
        }
    }
}
