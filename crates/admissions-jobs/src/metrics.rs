//! Queue metrics, recorded through the `metrics` facade.

use std::time::Duration;

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_ENQUEUED_TOTAL: &str = "jobs_enqueued_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "jobs_completed_total";
    pub const JOBS_RETRIED_TOTAL: &str = "jobs_retried_total";
    pub const JOBS_FAILED_TOTAL: &str = "jobs_failed_total";
    pub const JOBS_STALLED_TOTAL: &str = "jobs_stalled_total";
    pub const JOBS_LEASE_LOST_TOTAL: &str = "jobs_lease_lost_total";
    pub const JOB_DURATION_SECONDS: &str = "job_duration_seconds";
}

/// Record an enqueue; `created` is false for idempotent no-ops.
pub fn record_enqueued(queue: &str, created: bool) {
    counter!(
        names::JOBS_ENQUEUED_TOTAL,
        "queue" => queue.to_string(),
        "created" => if created { "true" } else { "false" }
    )
    .increment(1);
}

pub fn record_completed(queue: &str, duration: Duration) {
    counter!(names::JOBS_COMPLETED_TOTAL, "queue" => queue.to_string()).increment(1);
    histogram!(names::JOB_DURATION_SECONDS, "queue" => queue.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_retried(queue: &str) {
    counter!(names::JOBS_RETRIED_TOTAL, "queue" => queue.to_string()).increment(1);
}

pub fn record_failed(queue: &str) {
    record_failed_by(queue, 1);
}

pub fn record_failed_by(queue: &str, count: u64) {
    counter!(names::JOBS_FAILED_TOTAL, "queue" => queue.to_string()).increment(count);
}

pub fn record_stalled(queue: &str, count: u64) {
    counter!(names::JOBS_STALLED_TOTAL, "queue" => queue.to_string()).increment(count);
}

/// A finished job whose outcome was dropped because its claim had expired.
pub fn record_lease_lost(queue: &str) {
    counter!(names::JOBS_LEASE_LOST_TOTAL, "queue" => queue.to_string()).increment(1);
}
