//! Durable job queues for the admissions portal.
//!
//! Producers enqueue through a [`Queue`]; [`Worker`]s claim jobs from the
//! shared [`JobStore`], run the queue's [`JobHandler`] and record the outcome.
//! Failed attempts are retried with the queue's backoff until `max_attempts`
//! is reached, after which the job is kept as failed for inspection.
//! Finished jobs are pruned according to the queue's retention.
//!
//! Delivery is at-least-once: a job whose worker dies is handed to another
//! worker once its lease expires, so handlers must be idempotent.

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod queue;
pub mod store;
pub mod types;
pub mod worker;

pub use config::{
    BackoffPolicy, ENROLLMENT_QUEUE, EXPORT_QUEUE, NOTIFICATION_EMAIL_QUEUE, QueueConfig,
    QueueOverrides, Retention, Throughput,
};
pub use error::{JobError, JobResult};
pub use queue::Queue;
pub use store::{JobStore, MemoryJobStore, RedisJobStore};
pub use types::{Enqueued, Job, JobCounts, JobOptions, JobProgress, JobState, StalledJobs};
pub use worker::{HandlerRegistry, JobContext, JobHandler, JobOutcome, Worker};
