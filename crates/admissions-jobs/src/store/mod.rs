//! Job storage.
//!
//! Every state transition is a single store call so the Redis backend can
//! run it atomically; workers in different processes only coordinate through
//! these calls. All times are Unix milliseconds supplied by the caller.
//!
//! A claim hands out a lock token. `complete`, `retry_later` and `fail` only
//! apply while the job is still active under that token and return
//! [`JobError::LeaseLost`] otherwise, so a worker whose lease expired cannot
//! overwrite the state of a requeued or reclaimed job.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Retention;
use crate::error::JobError;
use crate::types::{Job, JobCounts, JobState, StalledJobs};

pub use self::memory::MemoryJobStore;
pub use self::redis::RedisJobStore;

/// Highest priority value honoured; larger values are clamped.
pub const MAX_PRIORITY: u32 = 900;

/// Rank of a waiting job: priority first, then the time it became ready.
///
/// Priorities are clamped so the rank stays below 2^53 and is exact as a
/// Redis sorted-set score.
/// Reason recorded on jobs failed by the stalled-job sweep.
pub const STALLED_REASON: &str = "job stalled more than allowable limit";

pub(crate) fn waiting_rank(priority: u32, ready_at: i64) -> u64 {
    const PRIORITY_SPAN: u64 = 10_000_000_000_000;
    u64::from(priority.min(MAX_PRIORITY)) * PRIORITY_SPAN + ready_at.max(0) as u64
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Backend name ("redis" or "memory").
    fn backend(&self) -> &'static str;

    /// Create the job unless one with the same id exists. Returns `true` when
    /// created. A job in the `Delayed` state becomes claimable at `run_at`.
    async fn add(&self, job: &Job) -> Result<bool, JobError>;

    async fn get(&self, queue: &str, id: &str) -> Result<Option<Job>, JobError>;

    /// Promote due delayed jobs, then take the waiting job with the lowest
    /// score and mark it active with a lease ending at `now + lease`. The
    /// returned job carries a fresh `lock_token`.
    async fn claim(&self, queue: &str, now: i64, lease: Duration) -> Result<Option<Job>, JobError>;

    async fn update_progress(&self, queue: &str, id: &str, progress: &Value)
    -> Result<(), JobError>;

    async fn complete(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        result: &Value,
        now: i64,
    ) -> Result<(), JobError>;

    /// Record a failed attempt and park the job until `run_at`.
    async fn retry_later(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        attempts_made: u32,
        reason: &str,
        run_at: i64,
    ) -> Result<(), JobError>;

    /// Record the last failed attempt; the job is kept for inspection.
    async fn fail(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        attempts_made: u32,
        reason: &str,
        now: i64,
    ) -> Result<(), JobError>;

    /// Drop finished jobs (completed or failed) outside the retention window.
    async fn prune(
        &self,
        queue: &str,
        state: JobState,
        retention: &Retention,
        now: i64,
    ) -> Result<u64, JobError>;

    /// Return active jobs whose lease expired to the waiting set. Each
    /// expiry counts against the job; once a job has stalled more than
    /// `max_stalled` times it is failed instead.
    async fn requeue_stalled(
        &self,
        queue: &str,
        now: i64,
        max_stalled: u32,
    ) -> Result<StalledJobs, JobError>;

    async fn counts(&self, queue: &str) -> Result<JobCounts, JobError>;
}
