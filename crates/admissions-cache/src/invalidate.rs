//! Tag-based invalidation.
//!
//! A tag is a fixed list of key patterns. A change type maps to tags plus
//! patterns scoped by the change context (cohort, user email). Deletion is
//! best-effort: a failing store leaves entries to expire on their TTL.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::keys::QUERY_PREFIX;

/// Logical cache groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTag {
    Enrollments,
    Applicants,
    Statistics,
    Dashboard,
    Users,
}

impl CacheTag {
    pub const ALL: [CacheTag; 5] = [
        CacheTag::Enrollments,
        CacheTag::Applicants,
        CacheTag::Statistics,
        CacheTag::Dashboard,
        CacheTag::Users,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTag::Enrollments => "enrollments",
            CacheTag::Applicants => "applicants",
            CacheTag::Statistics => "statistics",
            CacheTag::Dashboard => "dashboard",
            CacheTag::Users => "users",
        }
    }

    /// Key patterns deleted when this tag is invalidated.
    pub fn patterns(&self) -> Vec<String> {
        match self {
            CacheTag::Enrollments => vec![
                "enrollments:*".to_string(),
                format!("{QUERY_PREFIX}:enrollments:*"),
            ],
            CacheTag::Applicants => vec![
                "applicants:*".to_string(),
                format!("{QUERY_PREFIX}:applicants:*"),
            ],
            CacheTag::Statistics => vec![
                "statistics:*".to_string(),
                format!("{QUERY_PREFIX}:statistics:*"),
            ],
            CacheTag::Dashboard => vec!["dashboard:*".to_string()],
            CacheTag::Users => vec!["user:*".to_string()],
        }
    }
}

impl fmt::Display for CacheTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of data change that triggers invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Enrollment,
    Applicant,
    Statistics,
    User,
}

/// Scope of a change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeContext {
    pub cohort_id: Option<String>,
    pub user_email: Option<String>,
}

impl ChangeContext {
    pub fn cohort(cohort_id: impl Into<String>) -> Self {
        Self {
            cohort_id: Some(cohort_id.into()),
            user_email: None,
        }
    }

    pub fn user(email: impl Into<String>) -> Self {
        Self {
            cohort_id: None,
            user_email: Some(email.into()),
        }
    }

    fn cohort_id(&self) -> Option<&str> {
        self.cohort_id.as_deref().filter(|id| !id.is_empty())
    }

    fn user_email(&self) -> Option<&str> {
        self.user_email.as_deref().filter(|email| !email.is_empty())
    }
}

/// Tags and extra patterns resolved for one change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationPlan {
    pub tags: Vec<CacheTag>,
    pub patterns: Vec<String>,
}

impl InvalidationPlan {
    /// Every pattern to delete, tag patterns first, without duplicates.
    pub fn all_patterns(&self) -> Vec<String> {
        let mut all: Vec<String> = Vec::new();
        for pattern in self
            .tags
            .iter()
            .flat_map(CacheTag::patterns)
            .chain(self.patterns.iter().cloned())
        {
            if !all.contains(&pattern) {
                all.push(pattern);
            }
        }
        all
    }
}

impl ChangeType {
    pub fn plan(&self, context: &ChangeContext) -> InvalidationPlan {
        let cohort_patterns = || {
            context
                .cohort_id()
                .map(|id| vec![format!("*cohort:{}*", escape_glob(id))])
                .unwrap_or_default()
        };

        match self {
            ChangeType::Enrollment => InvalidationPlan {
                tags: vec![CacheTag::Enrollments, CacheTag::Dashboard],
                patterns: cohort_patterns(),
            },
            ChangeType::Applicant => InvalidationPlan {
                tags: vec![CacheTag::Applicants, CacheTag::Dashboard],
                patterns: cohort_patterns(),
            },
            ChangeType::Statistics => InvalidationPlan {
                tags: vec![CacheTag::Statistics, CacheTag::Dashboard],
                patterns: cohort_patterns(),
            },
            ChangeType::User => match context.user_email() {
                Some(email) => {
                    let email = escape_glob(email);
                    InvalidationPlan {
                        tags: Vec::new(),
                        patterns: vec![format!("user:*{email}*"), format!("*{email}*")],
                    }
                }
                None => InvalidationPlan {
                    tags: vec![CacheTag::Users],
                    patterns: Vec::new(),
                },
            },
        }
    }
}

/// Escape Redis glob metacharacters in a literal.
pub fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[derive(Clone)]
pub struct Invalidator {
    cache: Cache,
}

impl Invalidator {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }

    /// Delete every key matching the tags' patterns. Returns keys removed.
    pub async fn invalidate(&self, tags: &[CacheTag]) -> u64 {
        let plan = InvalidationPlan {
            tags: tags.to_vec(),
            patterns: Vec::new(),
        };
        self.apply(&plan).await
    }

    pub async fn invalidate_after_change(&self, change: ChangeType, context: &ChangeContext) -> u64 {
        let plan = change.plan(context);
        let removed = self.apply(&plan).await;
        tracing::info!(
            change = ?change,
            cohort_id = ?context.cohort_id(),
            removed,
            "Cache invalidated after change"
        );
        removed
    }

    /// Drop the whole keyspace.
    pub async fn invalidate_everything(&self) -> u64 {
        let removed = self.cache.delete_pattern("*").await;
        tracing::warn!(removed, "Invalidated every cache key");
        removed
    }

    async fn apply(&self, plan: &InvalidationPlan) -> u64 {
        let mut removed = 0;
        for pattern in plan.all_patterns() {
            removed += self.cache.delete_pattern(&pattern).await;
        }
        removed
    }
}
