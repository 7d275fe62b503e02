//! Queue workers.
//!
//! A [`Worker`] polls one queue, runs up to `concurrency` jobs at a time
//! through its [`JobHandler`], and records the outcome in the job store.
//! Workers in separate processes coordinate only through the store's atomic
//! claim, so any number of them may serve the same queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use admissions_cache::{RateLimiter, clock};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::error::JobError;
use crate::metrics;
use crate::queue::Queue;
use crate::store::JobStore;
use crate::types::{Job, JobProgress, JobState};

/// Processes the jobs of one queue.
///
/// Any error (or a panic-free timeout) counts as a failed attempt.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> anyhow::Result<Value>;
}

/// Per-job handle passed to handlers.
pub struct JobContext {
    store: Arc<dyn JobStore>,
    queue: String,
    job_id: String,
}

impl JobContext {
    pub fn new(store: Arc<dyn JobStore>, job: &Job) -> Self {
        Self {
            store,
            queue: job.queue.clone(),
            job_id: job.id.clone(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Publish progress for pollers. Failures are logged, never returned.
    pub async fn report_progress(&self, progress: &JobProgress) {
        let value = match serde_json::to_value(progress) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize job progress");
                return;
            }
        };
        if let Err(e) = self
            .store
            .update_progress(&self.queue, &self.job_id, &value)
            .await
        {
            tracing::warn!(
                queue = %self.queue,
                job_id = %self.job_id,
                stage = %progress.stage,
                error = %e,
                "Failed to update job progress"
            );
        }
    }
}

/// What happened to a processed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Parked as delayed; claimable again after `delay`.
    Retrying { delay: Duration },
    /// Attempts exhausted.
    Failed,
    /// The lease expired before the handler returned; the job now belongs
    /// to the stalled-job sweep or another worker and the outcome was dropped.
    LeaseLost,
}

/// Handlers by queue name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, queue: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(queue.into(), handler);
        self
    }

    pub fn get(&self, queue: &str) -> Result<Arc<dyn JobHandler>, JobError> {
        self.handlers
            .get(queue)
            .cloned()
            .ok_or_else(|| JobError::NoHandler(queue.to_string()))
    }

    pub fn contains(&self, queue: &str) -> bool {
        self.handlers.contains_key(queue)
    }

    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

pub struct Worker {
    queue: Queue,
    handler: Arc<dyn JobHandler>,
    /// Fleet-wide start limiter, used when the queue has a throughput cap
    throttle: Option<RateLimiter>,
    stall_check_interval: Duration,
}

impl Worker {
    pub fn new(queue: Queue, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            queue,
            handler,
            throttle: None,
            stall_check_interval: Duration::from_secs(30),
        }
    }

    /// Enforce the queue's throughput cap through a shared rate limiter.
    pub fn with_throttle(mut self, limiter: RateLimiter) -> Self {
        self.throttle = Some(limiter);
        self
    }

    /// How often to look for active jobs whose lease expired.
    pub fn with_stall_check_interval(mut self, interval: Duration) -> Self {
        self.stall_check_interval = interval;
        self
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped), then
    /// wait for in-flight jobs to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), JobError> {
        let config = self.queue.config().clone();
        config.validate()?;
        tracing::info!(
            queue = %config.name,
            concurrency = config.concurrency,
            attempts = config.attempts,
            "Starting queue worker"
        );

        let worker = Arc::new(self);
        let permits = Arc::new(Semaphore::new(config.concurrency));
        let mut tasks = JoinSet::new();
        let mut last_stall_check: Option<Instant> = None;

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(queue = %config.name, error = %e, "Job task panicked");
                }
            }

            if last_stall_check.is_none_or(|at| at.elapsed() >= worker.stall_check_interval) {
                worker.requeue_stalled().await;
                last_stall_check = Some(Instant::now());
            }

            let permit = tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown) => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let claimed = worker
                .queue
                .store()
                .claim(&config.name, clock::now_millis(), config.lease())
                .await;
            match claimed {
                Ok(Some(job)) => {
                    worker.throttle().await;
                    let worker = Arc::clone(&worker);
                    tasks.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = worker.process(job).await {
                            tracing::error!(
                                queue = %worker.queue.name(),
                                error = %e,
                                "Failed to record job outcome"
                            );
                        }
                    });
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(queue = %config.name, error = %e, "Failed to claim job");
                }
            }
            drop(permit);

            tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown) => break,
                _ = tokio::time::sleep(config.poll_interval()) => {}
            }
        }

        if !tasks.is_empty() {
            tracing::info!(
                queue = %config.name,
                in_flight = tasks.len(),
                "Waiting for in-flight jobs"
            );
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(queue = %config.name, error = %e, "Job task panicked");
            }
        }
        tracing::info!(queue = %config.name, "Queue worker stopped");
        Ok(())
    }

    /// Run a claimed job and record the outcome.
    pub async fn process(&self, job: Job) -> Result<JobOutcome, JobError> {
        let config = self.queue.config();
        let store = self.queue.store();
        let ctx = JobContext::new(Arc::clone(store), &job);
        let started = Instant::now();

        let result = match tokio::time::timeout(config.job_timeout(), self.handler.handle(&job, &ctx))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "job timed out after {}s",
                config.job_timeout_secs
            )),
        };

        match self.record(&job, result, started).await {
            Err(JobError::LeaseLost { .. }) => {
                metrics::record_lease_lost(&config.name);
                tracing::warn!(
                    queue = %config.name,
                    job_id = %job.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job lease expired before it finished, dropping its outcome"
                );
                Ok(JobOutcome::LeaseLost)
            }
            recorded => recorded,
        }
    }

    async fn record(
        &self,
        job: &Job,
        result: anyhow::Result<Value>,
        started: Instant,
    ) -> Result<JobOutcome, JobError> {
        let config = self.queue.config();
        let store = self.queue.store();
        let now = clock::now_millis();
        let token = job.lock_token.as_deref().unwrap_or_default();

        match result {
            Ok(value) => {
                store
                    .complete(&config.name, &job.id, token, &value, now)
                    .await?;
                metrics::record_completed(&config.name, started.elapsed());
                tracing::info!(
                    queue = %config.name,
                    job_id = %job.id,
                    name = %job.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job completed"
                );
                self.prune(JobState::Completed, now).await;
                Ok(JobOutcome::Completed)
            }
            Err(e) => {
                let reason = format!("{e:#}");
                let attempts_made = job.attempts_made + 1;
                if attempts_made < job.max_attempts {
                    let delay = config.backoff.delay_for(attempts_made);
                    let run_at = now + delay.as_millis() as i64;
                    store
                        .retry_later(&config.name, &job.id, token, attempts_made, &reason, run_at)
                        .await?;
                    metrics::record_retried(&config.name);
                    tracing::warn!(
                        queue = %config.name,
                        job_id = %job.id,
                        attempt = attempts_made,
                        max_attempts = job.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "Job failed, scheduling retry"
                    );
                    Ok(JobOutcome::Retrying { delay })
                } else {
                    store
                        .fail(&config.name, &job.id, token, attempts_made, &reason, now)
                        .await?;
                    metrics::record_failed(&config.name);
                    tracing::error!(
                        queue = %config.name,
                        job_id = %job.id,
                        attempts = attempts_made,
                        error = %reason,
                        "Job failed permanently"
                    );
                    self.prune(JobState::Failed, now).await;
                    Ok(JobOutcome::Failed)
                }
            }
        }
    }

    async fn prune(&self, state: JobState, now: i64) {
        let config = self.queue.config();
        let retention = match state {
            JobState::Completed => &config.remove_on_complete,
            _ => &config.remove_on_fail,
        };
        match self
            .queue
            .store()
            .prune(&config.name, state, retention, now)
            .await
        {
            Ok(0) => {}
            Ok(removed) => {
                tracing::debug!(queue = %config.name, state = %state, removed, "Pruned finished jobs");
            }
            Err(e) => {
                tracing::warn!(queue = %config.name, state = %state, error = %e, "Failed to prune jobs");
            }
        }
    }

    async fn requeue_stalled(&self) {
        let name = self.queue.name();
        let max_stalled = self.queue.config().max_stalled_count;
        match self
            .queue
            .store()
            .requeue_stalled(name, clock::now_millis(), max_stalled)
            .await
        {
            Ok(swept) if swept.is_empty() => {}
            Ok(swept) => {
                metrics::record_stalled(name, swept.requeued + swept.failed);
                if swept.requeued > 0 {
                    tracing::warn!(queue = %name, count = swept.requeued, "Requeued stalled jobs");
                }
                if swept.failed > 0 {
                    metrics::record_failed_by(name, swept.failed);
                    tracing::error!(
                        queue = %name,
                        count = swept.failed,
                        max_stalled,
                        "Failed jobs that stalled too often"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(queue = %name, error = %e, "Failed to check for stalled jobs");
            }
        }
    }

    /// Wait until the fleet-wide start budget allows another job.
    async fn throttle(&self) {
        let (Some(limiter), Some(throughput)) = (&self.throttle, self.queue.config().throughput)
        else {
            return;
        };
        let key = format!("queue:{}", self.queue.name());
        loop {
            let decision = limiter
                .check(&key, throughput.max, throughput.window())
                .await;
            if decision.allowed {
                return;
            }
            let wait_ms = (decision.reset_time - clock::now_millis()).clamp(1, throughput.window_ms as i64);
            tracing::debug!(queue = %self.queue.name(), wait_ms, "Queue throughput limit reached");
            tokio::time::sleep(Duration::from_millis(wait_ms as u64)).await;
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Sender dropped
            return;
        }
    }
}
