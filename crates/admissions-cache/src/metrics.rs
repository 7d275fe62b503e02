//! Cache-side metrics.
//!
//! Only the `metrics` facade is used here; installing a recorder (and
//! exporting) is up to the embedding process.

use metrics::counter;

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_ERRORS_TOTAL: &str = "cache_errors_total";
    pub const CACHE_INVALIDATED_KEYS_TOTAL: &str = "cache_invalidated_keys_total";
    pub const MEMOIZER_COMPUTES_TOTAL: &str = "memoizer_computes_total";
    pub const RATE_LIMIT_REJECTED_TOTAL: &str = "rate_limit_rejected_total";
}

pub fn record_cache_hit() {
    counter!(names::CACHE_HITS_TOTAL).increment(1);
}

pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

/// Record a degraded store call.
pub fn record_cache_error(operation: &'static str) {
    counter!(names::CACHE_ERRORS_TOTAL, "operation" => operation).increment(1);
}

pub fn record_invalidated_keys(count: u64) {
    counter!(names::CACHE_INVALIDATED_KEYS_TOTAL).increment(count);
}

/// Record a memoizer compute, labelled by whether its result was cached
/// (`locked`) or computed without the lock (`uncached`).
pub fn record_compute(mode: &'static str) {
    counter!(names::MEMOIZER_COMPUTES_TOTAL, "mode" => mode).increment(1);
}

pub fn record_rate_limited(scope: &str) {
    counter!(names::RATE_LIMIT_REJECTED_TOTAL, "scope" => scope.to_string()).increment(1);
}
