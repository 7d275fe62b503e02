//! In-process store backed by DashMap.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use globset::{GlobBuilder, GlobMatcher};
use tokio::time::Instant;

use super::CacheStore;
use crate::error::CacheError;

#[derive(Clone, Debug)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Single-instance store: local DashMap only.
///
/// Atomicity holds within one process (each primitive runs under the shard
/// lock of its key), which is enough for tests and single-process
/// deployments but not for a fleet of workers.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Compile a Redis-style glob (`*`, `?`, `[...]`, `\` escapes).
///
/// Braces are literal in Redis but alternations in globset, so unescaped
/// braces are escaped before compiling (cache keys embed JSON objects).
pub(crate) fn compile_pattern(pattern: &str) -> Result<GlobMatcher, CacheError> {
    let mut translated = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                translated.push('\\');
                if let Some(next) = chars.next() {
                    translated.push(next);
                }
            }
            '{' | '}' => {
                translated.push('\\');
                translated.push(c);
            }
            _ => translated.push(c),
        }
    }

    GlobBuilder::new(&translated)
        .literal_separator(false)
        .backslash_escape(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| CacheError::Pattern(format!("{pattern}: {e}")))
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn mode(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Ok(Some(entry.value.clone()));
            }
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired());
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .insert(key.to_string(), MemoryEntry::new(value.to_string(), Some(ttl)));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(MemoryEntry::new(value.to_string(), Some(ttl)));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry::new(value.to_string(), Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        Ok(self
            .entries
            .remove_if(key, |_, e| !e.is_expired() && e.value == expected)
            .is_some())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        let mut removed = 0;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(key)
                && !entry.is_expired()
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let matcher = compile_pattern(pattern)?;
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.is_expired() && matcher.is_match(e.key().as_str()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn incr_and_expire(&self, key: &str, ttl: Duration) -> Result<i64, CacheError> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired() => {
                let entry = occupied.get_mut();
                let current: i64 = entry
                    .value
                    .parse()
                    .map_err(|_| CacheError::NotAnInteger(key.to_string()))?;
                let next = current + 1;
                entry.value = next.to_string();
                Ok(next)
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(MemoryEntry::new("1".to_string(), Some(ttl)));
                Ok(1)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry::new("1".to_string(), Some(ttl)));
                Ok(1)
            }
        }
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let store = MemoryStore::new();
        store
            .set("statistics:all", "42", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(store.get("statistics:all").await.unwrap().as_deref(), Some("42"));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(store.get("statistics:all").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_takes_over_expired_key() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(1);
        assert!(store.set_if_absent("k:lock", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent("k:lock", "b", ttl).await.unwrap());

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(store.set_if_absent("k:lock", "b", ttl).await.unwrap());
        assert_eq!(store.get("k:lock").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_delete_if_equals_checks_owner() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);
        store.set_if_absent("k:lock", "owner-1", ttl).await.unwrap();

        assert!(!store.delete_if_equals("k:lock", "owner-2").await.unwrap());
        assert!(store.delete_if_equals("k:lock", "owner-1").await.unwrap());
        assert_eq!(store.get("k:lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_uses_redis_glob_semantics() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);
        for key in [
            "enrollments:{\"cohort\":\"c1\"}",
            "dashboard:all",
            "user:enrollments:ada@example.com",
            "report:cohort:c1:summary",
        ] {
            store.set(key, "1", ttl).await.unwrap();
        }

        assert_eq!(
            store.scan("enrollments:*").await.unwrap(),
            vec!["enrollments:{\"cohort\":\"c1\"}".to_string()]
        );
        assert_eq!(
            store.scan("*cohort:c1*").await.unwrap(),
            vec!["report:cohort:c1:summary".to_string()]
        );
        assert_eq!(store.scan("*").await.unwrap().len(), 4);
        assert_eq!(
            store.scan("enrollments:{\"cohort\":*").await.unwrap().len(),
            1
        );
        assert!(store.scan("nothing:*").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_applies_ttl_on_first_increment_only() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(1);
        assert_eq!(store.incr_and_expire("rate_limit:a:b:1", ttl).await.unwrap(), 1);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(store.incr_and_expire("rate_limit:a:b:1", ttl).await.unwrap(), 2);

        // Expiry was set by the first increment, not extended by the second.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(store.get("rate_limit:a:b:1").await.unwrap(), None);
        assert_eq!(store.incr_and_expire("rate_limit:a:b:1", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_incr_rejects_non_integer() {
        let store = MemoryStore::new();
        store
            .set("not-a-counter", "\"text\"", Duration::from_secs(5))
            .await
            .unwrap();
        let err = store
            .incr_and_expire("not-a-counter", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NotAnInteger(_)));
    }
}
