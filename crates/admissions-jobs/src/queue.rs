use std::sync::Arc;

use admissions_cache::clock;
use serde_json::Value;

use crate::config::QueueConfig;
use crate::error::JobError;
use crate::metrics;
use crate::store::JobStore;
use crate::types::{Enqueued, Job, JobCounts, JobOptions, JobState};

/// Producer-side handle to one named queue.
#[derive(Clone)]
pub struct Queue {
    config: Arc<QueueConfig>,
    store: Arc<dyn JobStore>,
}

impl Queue {
    pub fn new(config: QueueConfig, store: Arc<dyn JobStore>) -> Self {
        Self {
            config: Arc::new(config),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Enqueue a job.
    ///
    /// With `options.job_id` set the call is idempotent: if a job with that id
    /// is still retained, nothing is written and the existing job is returned
    /// with `created == false`.
    pub async fn add(
        &self,
        name: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<Enqueued, JobError> {
        self.add_at(name, payload, options, clock::now_millis()).await
    }

    /// [`Queue::add`] at an explicit enqueue time (Unix ms).
    pub async fn add_at(
        &self,
        name: &str,
        payload: Value,
        options: JobOptions,
        now: i64,
    ) -> Result<Enqueued, JobError> {
        let run_at = options
            .delay
            .filter(|delay| !delay.is_zero())
            .map(|delay| now + delay.as_millis() as i64);
        let job = Job {
            id: options
                .job_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            queue: self.config.name.clone(),
            name: name.to_string(),
            payload,
            state: if run_at.is_some() {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            priority: options.priority.unwrap_or(0),
            attempts_made: 0,
            max_attempts: options.attempts.unwrap_or(self.config.attempts).max(1),
            stalled_count: 0,
            lock_token: None,
            progress: None,
            result: None,
            failed_reason: None,
            created_at: now,
            run_at,
            processed_at: None,
            finished_at: None,
        };

        let created = self.store.add(&job).await?;
        metrics::record_enqueued(&self.config.name, created);
        if created {
            tracing::debug!(queue = %self.config.name, job_id = %job.id, name, "Job enqueued");
            return Ok(Enqueued { job, created });
        }

        tracing::debug!(queue = %self.config.name, job_id = %job.id, "Job already exists, skipping enqueue");
        // The existing job may have been pruned between the two calls.
        let existing = self.store.get(&self.config.name, &job.id).await?;
        Ok(Enqueued {
            job: existing.unwrap_or(job),
            created: false,
        })
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>, JobError> {
        self.store.get(&self.config.name, id).await
    }

    pub async fn counts(&self) -> Result<JobCounts, JobError> {
        self.store.counts(&self.config.name).await
    }
}
