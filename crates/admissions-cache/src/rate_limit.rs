//! Fixed-window rate limiting on the shared store.
//!
//! Each `(key, window)` pair is a counter at `rate_limit:<key>:<window>` where
//! `window = floor(now_ms / window_ms)`, expiring after one window length.
//! Fixed windows allow a burst of up to twice the limit across a boundary.
//! The read-then-increment is not a single atomic step, so concurrent callers
//! can overshoot the limit by a few requests; that overshoot is tolerated.
//!
//! Store errors fail open: rate limiting protects capacity, not correctness.

use std::time::Duration;

use serde::Serialize;

use crate::cache::Cache;
use crate::clock;
use crate::keys::CacheKeys;
use crate::metrics;

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Unix milliseconds at which the current window ends.
    pub reset_time: i64,
}

const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct RateLimiter {
    cache: Cache,
}

impl RateLimiter {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }

    pub async fn check(&self, key: &str, limit: u32, window: Duration) -> RateLimitDecision {
        self.check_at(key, limit, window, clock::now_millis()).await
    }

    /// [`RateLimiter::check`] at an explicit wall-clock time.
    pub async fn check_at(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now_ms: i64,
    ) -> RateLimitDecision {
        let window_ms = (window.as_millis() as i64).max(1);
        let index = now_ms.div_euclid(window_ms);
        let reset_time = (index + 1) * window_ms;
        let counter = CacheKeys::rate_limit(key, index);
        let fail_open = RateLimitDecision {
            allowed: true,
            remaining: limit,
            reset_time: now_ms + window_ms,
        };

        let store = self.cache.store();
        let current = match store.get(&counter).await {
            Ok(raw) => raw.and_then(|raw| raw.parse::<i64>().ok()).unwrap_or(0),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Rate limit check failed, allowing request");
                return fail_open;
            }
        };

        if current >= i64::from(limit) {
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_time,
            };
        }

        match store.incr_and_expire(&counter, window).await {
            Ok(count) => RateLimitDecision {
                allowed: true,
                remaining: (i64::from(limit) - count).clamp(0, i64::from(limit)) as u32,
                reset_time,
            },
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Rate limit increment failed, allowing request");
                fail_open
            }
        }
    }

    async fn limit_scoped(
        &self,
        scope: &str,
        name: &str,
        identifier: &str,
        limit: u32,
        window: Duration,
    ) -> bool {
        let key = format!("{scope}:{name}:{identifier}");
        let decision = self.check(&key, limit, window).await;
        if !decision.allowed {
            tracing::warn!(scope = %scope, name = %name, identifier = %identifier, "Rate limit exceeded");
            metrics::record_rate_limited(scope);
        }
        decision.allowed
    }

    /// `api:<endpoint>:<identifier>`, 100 per minute unless overridden.
    pub async fn limit_api_request(
        &self,
        endpoint: &str,
        identifier: &str,
        limit: Option<u32>,
        window: Option<Duration>,
    ) -> bool {
        self.limit_scoped(
            "api",
            endpoint,
            identifier,
            limit.unwrap_or(100),
            window.unwrap_or(DEFAULT_WINDOW),
        )
        .await
    }

    /// `cache:<operation>:<identifier>`, 50 per minute unless overridden.
    pub async fn limit_cache_operation(
        &self,
        operation: &str,
        identifier: &str,
        limit: Option<u32>,
        window: Option<Duration>,
    ) -> bool {
        self.limit_scoped(
            "cache",
            operation,
            identifier,
            limit.unwrap_or(50),
            window.unwrap_or(DEFAULT_WINDOW),
        )
        .await
    }

    /// `db:<query type>:<identifier>`, 200 per minute unless overridden.
    pub async fn limit_db_query(
        &self,
        query_type: &str,
        identifier: &str,
        limit: Option<u32>,
        window: Option<Duration>,
    ) -> bool {
        self.limit_scoped(
            "db",
            query_type,
            identifier,
            limit.unwrap_or(200),
            window.unwrap_or(DEFAULT_WINDOW),
        )
        .await
    }
}
