//! Cache key derivation.
//!
//! Keys are shared with deployments that already hold data, so the formats
//! below are stable: `<namespace>:<compact JSON with sorted keys>` for query
//! shaped keys and plain `:`-joined segments for everything else.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::CacheError;

/// Namespaces counted by [`crate::Cache::stats`].
pub const NAMESPACES: &[&str] = &[
    "enrollments",
    "applicants",
    "statistics",
    "dashboard",
    "user",
    "rate_limit",
    "prisma",
];

/// Prefix of keys written through [`crate::Memoizer::cached_query`].
pub const QUERY_PREFIX: &str = "prisma";

/// Key generators for every cache namespace.
pub struct CacheKeys;

impl CacheKeys {
    pub fn enrollments<P: Serialize + ?Sized>(params: &P) -> Result<String, CacheError> {
        derive_key("enrollments", params)
    }

    pub fn applicants<P: Serialize + ?Sized>(params: &P) -> Result<String, CacheError> {
        derive_key("applicants", params)
    }

    /// `statistics:<cohort>`, or `statistics:all` without a cohort.
    pub fn statistics(cohort_id: Option<&str>) -> String {
        format!("statistics:{}", cohort_or_all(cohort_id))
    }

    /// `dashboard:<cohort>`, or `dashboard:all` without a cohort.
    pub fn dashboard(cohort_id: Option<&str>) -> String {
        format!("dashboard:{}", cohort_or_all(cohort_id))
    }

    pub fn user_enrollments(email: &str) -> String {
        format!("user:enrollments:{email}")
    }

    /// Counter for one fixed window. `key` is already `<scope>:<identifier>`.
    pub fn rate_limit(key: &str, window: i64) -> String {
        format!("rate_limit:{key}:{window}")
    }

    pub fn query(operation: &str, key: &str) -> String {
        format!("{QUERY_PREFIX}:{operation}:{key}")
    }
}

fn cohort_or_all(cohort_id: Option<&str>) -> &str {
    cohort_id.filter(|id| !id.is_empty()).unwrap_or("all")
}

/// Derive `<namespace>:<params>` where params are rendered as compact JSON
/// with object keys sorted, so logically equal parameter sets always map to
/// the same key regardless of insertion order.
pub fn derive_key<P: Serialize + ?Sized>(namespace: &str, params: &P) -> Result<String, CacheError> {
    let canonical = canonicalize(serde_json::to_value(params)?);
    Ok(format!("{namespace}:{}", serde_json::to_string(&canonical)?))
}

/// Rebuild every object with its keys in sorted order.
///
/// `serde_json::Map` keeps insertion order when `preserve_order` is enabled
/// anywhere in the dependency graph, so sorting is done explicitly.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = Map::with_capacity(entries.len());
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
