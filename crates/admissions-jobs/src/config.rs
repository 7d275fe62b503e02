//! Queue configuration.
//!
//! Each queue starts from a preset and may be adjusted by
//! [`QueueOverrides`] loaded at process start. The resolved [`QueueConfig`]
//! is immutable afterwards.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::JobError;

pub const EXPORT_QUEUE: &str = "applicant-exports";
pub const NOTIFICATION_EMAIL_QUEUE: &str = "notification-emails";
pub const ENROLLMENT_QUEUE: &str = "enrollment-processing";

/// Extra lease time on top of the job timeout before an active job counts
/// as stalled (its worker presumably died).
pub const STALL_GRACE: Duration = Duration::from_secs(30);

/// Lease expiries a job survives before it is failed instead of requeued.
pub const DEFAULT_MAX_STALLED_COUNT: u32 = 1;

/// Delay before retrying a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Retry as soon as a worker is free.
    None,
    Fixed { delay_ms: u64 },
    /// `delay_ms * 2^(attempts_made - 1)`
    Exponential { delay_ms: u64 },
}

impl BackoffPolicy {
    pub fn exponential(base: Duration) -> Self {
        BackoffPolicy::Exponential {
            delay_ms: base.as_millis() as u64,
        }
    }

    /// Delay after the `attempts_made`-th failed attempt (1-based).
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            BackoffPolicy::None => Duration::ZERO,
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffPolicy::Exponential { delay_ms } => {
                let exponent = attempts_made.saturating_sub(1).min(32);
                Duration::from_millis(delay_ms.saturating_mul(1u64 << exponent))
            }
        }
    }
}

/// How long finished jobs are kept. Both limits apply when set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    pub max_age_secs: Option<u64>,
    pub max_count: Option<u64>,
}

impl Retention {
    pub fn age_and_count(age: Duration, count: u64) -> Self {
        Self {
            max_age_secs: Some(age.as_secs()),
            max_count: Some(count),
        }
    }

    pub fn age(age: Duration) -> Self {
        Self {
            max_age_secs: Some(age.as_secs()),
            max_count: None,
        }
    }

    pub fn count(count: u64) -> Self {
        Self {
            max_age_secs: None,
            max_count: Some(count),
        }
    }

    /// Finish time (Unix ms) before which jobs are pruned, if age-bounded.
    pub fn cutoff(&self, now_ms: i64) -> Option<i64> {
        self.max_age_secs
            .map(|secs| now_ms - (secs as i64).saturating_mul(1000))
    }
}

/// Fleet-wide start rate: at most `max` jobs per `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throughput {
    pub max: u32,
    pub window_ms: u64,
}

impl Throughput {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Jobs run in parallel per worker process
    pub concurrency: usize,
    /// Total attempts including the first
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    pub remove_on_complete: Retention,
    pub remove_on_fail: Retention,
    pub throughput: Option<Throughput>,
    /// A handler still running after this counts as a failed attempt
    pub job_timeout_secs: u64,
    /// Sleep between claims while the queue is empty
    pub poll_interval_ms: u64,
    /// A job whose lease expires more often than this is failed
    pub max_stalled_count: u32,
}

impl QueueConfig {
    /// Bulk applicant exports: one at a time, never retried.
    pub fn export() -> Self {
        Self {
            name: EXPORT_QUEUE.to_string(),
            concurrency: 1,
            attempts: 1,
            backoff: BackoffPolicy::None,
            remove_on_complete: Retention::age_and_count(Duration::from_secs(3600), 100),
            remove_on_fail: Retention::age(Duration::from_secs(24 * 3600)),
            throughput: None,
            job_timeout_secs: 30 * 60,
            poll_interval_ms: 1000,
            max_stalled_count: DEFAULT_MAX_STALLED_COUNT,
        }
    }

    /// Transactional notification email, throttled to respect SMTP limits.
    pub fn notification_email() -> Self {
        Self {
            name: NOTIFICATION_EMAIL_QUEUE.to_string(),
            concurrency: 5,
            attempts: 3,
            backoff: BackoffPolicy::exponential(Duration::from_secs(2)),
            remove_on_complete: Retention::age_and_count(Duration::from_secs(3600), 1000),
            remove_on_fail: Retention::age(Duration::from_secs(24 * 3600)),
            throughput: Some(Throughput {
                max: 10,
                window_ms: 1000,
            }),
            job_timeout_secs: 60,
            poll_interval_ms: 1000,
            max_stalled_count: DEFAULT_MAX_STALLED_COUNT,
        }
    }

    /// Enrollment events fed by the webhook pipeline.
    pub fn enrollment() -> Self {
        Self {
            name: ENROLLMENT_QUEUE.to_string(),
            concurrency: 5,
            attempts: 3,
            backoff: BackoffPolicy::exponential(Duration::from_secs(2)),
            remove_on_complete: Retention::count(100),
            remove_on_fail: Retention::count(50),
            throughput: None,
            job_timeout_secs: 120,
            poll_interval_ms: 1000,
            max_stalled_count: DEFAULT_MAX_STALLED_COUNT,
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Lease on a claimed job; expiry marks the job as stalled.
    pub fn lease(&self) -> Duration {
        self.job_timeout() + STALL_GRACE
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.name.is_empty() {
            return Err(JobError::InvalidConfig("queue name is empty".into()));
        }
        if self.concurrency == 0 {
            return Err(JobError::InvalidConfig(format!(
                "{}: concurrency must be at least 1",
                self.name
            )));
        }
        if self.attempts == 0 {
            return Err(JobError::InvalidConfig(format!(
                "{}: attempts must be at least 1",
                self.name
            )));
        }
        if self.job_timeout_secs == 0 {
            return Err(JobError::InvalidConfig(format!(
                "{}: job timeout must be positive",
                self.name
            )));
        }
        if let Some(throughput) = self.throughput
            && (throughput.max == 0 || throughput.window_ms == 0)
        {
            return Err(JobError::InvalidConfig(format!(
                "{}: throughput needs a positive max and window",
                self.name
            )));
        }
        Ok(())
    }
}

/// Environment/file overrides for one queue. Unset fields keep the preset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOverrides {
    pub concurrency: Option<usize>,
    pub attempts: Option<u32>,
    /// Exponential backoff base; 0 disables backoff
    pub backoff_ms: Option<u64>,
    pub completed_max_age_secs: Option<u64>,
    pub completed_max_count: Option<u64>,
    pub failed_max_age_secs: Option<u64>,
    pub failed_max_count: Option<u64>,
    pub throughput_max: Option<u32>,
    pub throughput_window_ms: Option<u64>,
    pub job_timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub max_stalled_count: Option<u32>,
}

impl QueueOverrides {
    pub fn apply(&self, mut config: QueueConfig) -> QueueConfig {
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(attempts) = self.attempts {
            config.attempts = attempts;
        }
        if let Some(backoff_ms) = self.backoff_ms {
            config.backoff = if backoff_ms == 0 {
                BackoffPolicy::None
            } else {
                BackoffPolicy::Exponential {
                    delay_ms: backoff_ms,
                }
            };
        }
        if self.completed_max_age_secs.is_some() {
            config.remove_on_complete.max_age_secs = self.completed_max_age_secs;
        }
        if self.completed_max_count.is_some() {
            config.remove_on_complete.max_count = self.completed_max_count;
        }
        if self.failed_max_age_secs.is_some() {
            config.remove_on_fail.max_age_secs = self.failed_max_age_secs;
        }
        if self.failed_max_count.is_some() {
            config.remove_on_fail.max_count = self.failed_max_count;
        }
        match (self.throughput_max, self.throughput_window_ms) {
            (Some(0), _) => config.throughput = None,
            (Some(max), window) => {
                let window_ms = window
                    .or(config.throughput.map(|t| t.window_ms))
                    .unwrap_or(1000);
                config.throughput = Some(Throughput { max, window_ms });
            }
            (None, Some(window_ms)) => {
                if let Some(throughput) = config.throughput.as_mut() {
                    throughput.window_ms = window_ms;
                }
            }
            (None, None) => {}
        }
        if let Some(timeout) = self.job_timeout_secs {
            config.job_timeout_secs = timeout;
        }
        if let Some(poll) = self.poll_interval_ms {
            config.poll_interval_ms = poll;
        }
        if let Some(max_stalled) = self.max_stalled_count {
            config.max_stalled_count = max_stalled;
        }
        config
    }
}
