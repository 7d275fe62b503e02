use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(JobState::Waiting),
            "delayed" => Some(JobState::Delayed),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued unit of work. Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub payload: Value,
    pub state: JobState,
    /// Lower is served first.
    pub priority: u32,
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Times the job was found active with an expired lease.
    #[serde(default)]
    pub stalled_count: u32,
    /// Set while active; finishing the job requires the token of the
    /// current claim.
    #[serde(skip)]
    pub lock_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    pub created_at: i64,
    /// Earliest start for delayed jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
}

/// Per-enqueue options; unset fields fall back to the queue's defaults.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Idempotency key. Enqueueing an id that already exists is a no-op.
    pub job_id: Option<String>,
    pub priority: Option<u32>,
    pub delay: Option<std::time::Duration>,
    pub attempts: Option<u32>,
}

impl JobOptions {
    pub fn with_id(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Default::default()
        }
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Result of [`crate::Queue::add`].
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub job: Job,
    /// `false` when a job with the same id already existed.
    pub created: bool,
}

/// Structured progress reported by long-running handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub stage: String,
    pub percent: u8,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl JobProgress {
    pub fn new(stage: impl Into<String>, percent: u8, logs: &[&str]) -> Self {
        Self {
            stage: stage.into(),
            percent: percent.min(100),
            logs: logs.iter().map(|l| l.to_string()).collect(),
        }
    }
}

/// Number of jobs per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Result of a stalled-job sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StalledJobs {
    /// Returned to the waiting set.
    pub requeued: u64,
    /// Stalled more often than the queue allows; moved to failed.
    pub failed: u64,
}

impl StalledJobs {
    pub fn is_empty(&self) -> bool {
        self.requeued == 0 && self.failed == 0
    }
}
