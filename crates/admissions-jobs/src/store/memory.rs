//! In-process job store.
//!
//! Mirrors the Redis layout (one ordered set per state) under a single
//! mutex. Useful for tests and single-process development without Redis.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{JobStore, STALLED_REASON, waiting_rank};
use crate::config::Retention;
use crate::error::JobError;
use crate::types::{Job, JobCounts, JobState, StalledJobs};

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    waiting: BTreeSet<(u64, String)>,
    delayed: BTreeSet<(i64, String)>,
    /// id -> lease deadline
    active: HashMap<String, i64>,
    completed: BTreeSet<(i64, String)>,
    failed: BTreeSet<(i64, String)>,
}

impl QueueState {
    fn job_mut(&mut self, queue: &str, id: &str) -> Result<&mut Job, JobError> {
        self.jobs.get_mut(id).ok_or_else(|| JobError::NotFound {
            queue: queue.to_string(),
            id: id.to_string(),
        })
    }

    fn make_waiting(&mut self, id: &str, ready_at: i64) {
        if let Some(job) = self.jobs.get_mut(id) {
            job.state = JobState::Waiting;
            self.waiting
                .insert((waiting_rank(job.priority, ready_at), id.to_string()));
        }
    }

    /// Take a job out of `active` if `token` still holds its claim.
    fn release_claim(&mut self, queue: &str, id: &str, token: &str) -> Result<&mut Job, JobError> {
        let token_matches = self.job_mut(queue, id)?.lock_token.as_deref() == Some(token);
        if !token_matches || !self.active.contains_key(id) {
            return Err(JobError::LeaseLost {
                queue: queue.to_string(),
                id: id.to_string(),
            });
        }
        self.active.remove(id);
        let job = self.job_mut(queue, id)?;
        job.lock_token = None;
        Ok(job)
    }
}

#[derive(Clone, Default)]
pub struct MemoryJobStore {
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn add(&self, job: &Job) -> Result<bool, JobError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(job.queue.clone()).or_default();
        if state.jobs.contains_key(&job.id) {
            return Ok(false);
        }

        state.jobs.insert(job.id.clone(), job.clone());
        match (job.state, job.run_at) {
            (JobState::Delayed, Some(run_at)) => {
                state.delayed.insert((run_at, job.id.clone()));
            }
            _ => state.make_waiting(&job.id, job.created_at),
        }
        Ok(true)
    }

    async fn get(&self, queue: &str, id: &str) -> Result<Option<Job>, JobError> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).and_then(|state| state.jobs.get(id).cloned()))
    }

    async fn claim(&self, queue: &str, now: i64, lease: Duration) -> Result<Option<Job>, JobError> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let due: Vec<(i64, String)> = state
            .delayed
            .iter()
            .take_while(|(run_at, _)| *run_at <= now)
            .cloned()
            .collect();
        for (run_at, id) in due {
            state.delayed.remove(&(run_at, id.clone()));
            state.make_waiting(&id, run_at);
        }

        let Some((_, id)) = state.waiting.pop_first() else {
            return Ok(None);
        };
        let lease_until = now + lease.as_millis() as i64;
        state.active.insert(id.clone(), lease_until);
        let job = state.job_mut(queue, &id)?;
        job.state = JobState::Active;
        job.processed_at = Some(now);
        job.lock_token = Some(uuid::Uuid::new_v4().to_string());
        Ok(Some(job.clone()))
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &str,
        progress: &Value,
    ) -> Result<(), JobError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.job_mut(queue, id)?.progress = Some(progress.clone());
        Ok(())
    }

    async fn complete(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        result: &Value,
        now: i64,
    ) -> Result<(), JobError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        let job = state.release_claim(queue, id, token)?;
        job.state = JobState::Completed;
        job.result = Some(result.clone());
        job.finished_at = Some(now);
        state.completed.insert((now, id.to_string()));
        Ok(())
    }

    async fn retry_later(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        attempts_made: u32,
        reason: &str,
        run_at: i64,
    ) -> Result<(), JobError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        let job = state.release_claim(queue, id, token)?;
        job.state = JobState::Delayed;
        job.attempts_made = attempts_made;
        job.failed_reason = Some(reason.to_string());
        job.run_at = Some(run_at);
        state.delayed.insert((run_at, id.to_string()));
        Ok(())
    }

    async fn fail(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        attempts_made: u32,
        reason: &str,
        now: i64,
    ) -> Result<(), JobError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        let job = state.release_claim(queue, id, token)?;
        job.state = JobState::Failed;
        job.attempts_made = attempts_made;
        job.failed_reason = Some(reason.to_string());
        job.finished_at = Some(now);
        state.failed.insert((now, id.to_string()));
        Ok(())
    }

    async fn prune(
        &self,
        queue: &str,
        job_state: JobState,
        retention: &Retention,
        now: i64,
    ) -> Result<u64, JobError> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(0);
        };
        let finished = match job_state {
            JobState::Completed => &mut state.completed,
            JobState::Failed => &mut state.failed,
            _ => return Ok(0),
        };

        let mut removed = Vec::new();
        if let Some(cutoff) = retention.cutoff(now) {
            while let Some(first) = finished.first() {
                if first.0 >= cutoff {
                    break;
                }
                if let Some((_, id)) = finished.pop_first() {
                    removed.push(id);
                }
            }
        }
        if let Some(max_count) = retention.max_count {
            while finished.len() as u64 > max_count {
                match finished.pop_first() {
                    Some((_, id)) => removed.push(id),
                    None => break,
                }
            }
        }

        for id in &removed {
            state.jobs.remove(id);
        }
        Ok(removed.len() as u64)
    }

    async fn requeue_stalled(
        &self,
        queue: &str,
        now: i64,
        max_stalled: u32,
    ) -> Result<StalledJobs, JobError> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(StalledJobs::default());
        };

        let stalled: Vec<String> = state
            .active
            .iter()
            .filter(|(_, lease_until)| **lease_until <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let mut swept = StalledJobs::default();
        for id in &stalled {
            state.active.remove(id);
            let Some(job) = state.jobs.get_mut(id) else {
                continue;
            };
            job.lock_token = None;
            job.stalled_count += 1;
            if job.stalled_count > max_stalled {
                job.state = JobState::Failed;
                job.failed_reason = Some(STALLED_REASON.to_string());
                job.finished_at = Some(now);
                state.failed.insert((now, id.clone()));
                swept.failed += 1;
            } else {
                state.make_waiting(id, now);
                swept.requeued += 1;
            }
        }
        Ok(swept)
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, JobError> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(queue)
            .map(|state| JobCounts {
                waiting: state.waiting.len() as u64,
                delayed: state.delayed.len() as u64,
                active: state.active.len() as u64,
                completed: state.completed.len() as u64,
                failed: state.failed.len() as u64,
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const Q: &str = "notification-emails";
    const NOW: i64 = 1_767_084_657_000;
    const LEASE: Duration = Duration::from_secs(90);

    fn job(id: &str, priority: u32, created_at: i64) -> Job {
        Job {
            id: id.to_string(),
            queue: Q.to_string(),
            name: "send".to_string(),
            payload: json!({"n": id}),
            state: JobState::Waiting,
            priority,
            attempts_made: 0,
            max_attempts: 3,
            stalled_count: 0,
            lock_token: None,
            progress: None,
            result: None,
            failed_reason: None,
            created_at,
            run_at: None,
            processed_at: None,
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn test_add_is_create_if_absent() {
        let store = MemoryJobStore::new();
        assert!(store.add(&job("evt-1", 1, NOW)).await.unwrap());
        assert!(!store.add(&job("evt-1", 3, NOW + 5)).await.unwrap());

        let stored = store.get(Q, "evt-1").await.unwrap().unwrap();
        assert_eq!(stored.priority, 1);
        assert_eq!(store.counts(Q).await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_claim_order_is_priority_then_age() {
        let store = MemoryJobStore::new();
        store.add(&job("created", 3, NOW)).await.unwrap();
        store.add(&job("progress", 2, NOW + 1)).await.unwrap();
        store.add(&job("completed", 1, NOW + 2)).await.unwrap();
        store.add(&job("completed-later", 1, NOW + 3)).await.unwrap();

        let mut order = Vec::new();
        while let Some(job) = store.claim(Q, NOW + 10, LEASE).await.unwrap() {
            assert_eq!(job.state, JobState::Active);
            order.push(job.id);
        }
        assert_eq!(order, ["completed", "completed-later", "progress", "created"]);
        assert_eq!(store.counts(Q).await.unwrap().active, 4);
    }

    #[tokio::test]
    async fn test_delayed_job_becomes_claimable_at_run_at() {
        let store = MemoryJobStore::new();
        store.add(&job("a", 0, NOW)).await.unwrap();
        let claimed = store.claim(Q, NOW, LEASE).await.unwrap().unwrap();
        let token = claimed.lock_token.unwrap();
        store
            .retry_later(Q, "a", &token, 1, "smtp down", NOW + 2000)
            .await
            .unwrap();

        let delayed = store.get(Q, "a").await.unwrap().unwrap();
        assert_eq!(delayed.state, JobState::Delayed);
        assert_eq!(delayed.attempts_made, 1);
        assert_eq!(delayed.failed_reason.as_deref(), Some("smtp down"));

        assert!(store.claim(Q, NOW + 1999, LEASE).await.unwrap().is_none());
        let job = store.claim(Q, NOW + 2000, LEASE).await.unwrap().unwrap();
        assert_eq!(job.id, "a");
        assert_eq!(job.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_complete_fail_and_prune() {
        let store = MemoryJobStore::new();
        for i in 0..5 {
            let id = format!("job-{i}");
            store.add(&job(&id, 0, NOW + i)).await.unwrap();
            let claimed = store.claim(Q, NOW + 10, LEASE).await.unwrap().unwrap();
            let token = claimed.lock_token.unwrap();
            store
                .complete(Q, &id, &token, &json!({"ok": true}), NOW + 1000 * i)
                .await
                .unwrap();
        }
        store.add(&job("bad", 0, NOW)).await.unwrap();
        let claimed = store.claim(Q, NOW, LEASE).await.unwrap().unwrap();
        let token = claimed.lock_token.unwrap();
        store.fail(Q, "bad", &token, 3, "boom", NOW).await.unwrap();

        let counts = store.counts(Q).await.unwrap();
        assert_eq!((counts.completed, counts.failed, counts.active), (5, 1, 0));

        // Keep the last 3 completed.
        let removed = store
            .prune(Q, JobState::Completed, &Retention::count(3), NOW + 10_000)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(store.get(Q, "job-0").await.unwrap().is_none());
        assert!(store.get(Q, "job-4").await.unwrap().is_some());

        // Age: everything finished more than 1s before NOW + 4500 goes.
        let retention = Retention {
            max_age_secs: Some(1),
            max_count: None,
        };
        let removed = store
            .prune(Q, JobState::Completed, &retention, NOW + 4500)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.counts(Q).await.unwrap().completed, 1);

        let failed = store.get(Q, "bad").await.unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.finished_at, Some(NOW));
    }

    #[tokio::test]
    async fn test_stalled_jobs_are_requeued() {
        let store = MemoryJobStore::new();
        store.add(&job("a", 0, NOW)).await.unwrap();
        store.claim(Q, NOW, LEASE).await.unwrap().unwrap();

        assert!(store.requeue_stalled(Q, NOW + 1000, 1).await.unwrap().is_empty());
        let lease_end = NOW + LEASE.as_millis() as i64;
        let swept = store.requeue_stalled(Q, lease_end, 1).await.unwrap();
        assert_eq!(swept, StalledJobs { requeued: 1, failed: 0 });

        let job = store.get(Q, "a").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.stalled_count, 1);
        assert!(store.claim(Q, lease_end, LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_late_finish_after_stall_is_rejected() {
        let store = MemoryJobStore::new();
        store.add(&job("evt-1", 0, NOW)).await.unwrap();
        let first = store
            .claim(Q, NOW, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let stale_token = first.lock_token.unwrap();
        store.requeue_stalled(Q, NOW + 100, 1).await.unwrap();

        // The first worker finishes after its lease ran out.
        let err = store
            .complete(Q, "evt-1", &stale_token, &json!({"ok": true}), NOW + 150)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::LeaseLost { .. }));
        let counts = store.counts(Q).await.unwrap();
        assert_eq!((counts.waiting, counts.completed), (1, 0));

        // A second worker now holds the job; the stale token cannot touch it.
        let second = store.claim(Q, NOW + 200, LEASE).await.unwrap().unwrap();
        assert_eq!(second.id, "evt-1");
        let err = store
            .fail(Q, "evt-1", &stale_token, 1, "late", NOW + 250)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::LeaseLost { .. }));
        let err = store
            .retry_later(Q, "evt-1", &stale_token, 1, "late", NOW + 250)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::LeaseLost { .. }));

        let token = second.lock_token.unwrap();
        assert_ne!(token, stale_token);
        store
            .complete(Q, "evt-1", &token, &json!({"ok": true}), NOW + 300)
            .await
            .unwrap();
        let counts = store.counts(Q).await.unwrap();
        assert_eq!(
            (counts.waiting, counts.active, counts.completed),
            (0, 0, 1)
        );
        assert!(store.claim(Q, NOW + 400, LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repeatedly_stalled_job_is_failed() {
        let store = MemoryJobStore::new();
        store.add(&job("crashy", 0, NOW)).await.unwrap();
        let lease = Duration::from_millis(10);

        store.claim(Q, NOW, lease).await.unwrap().unwrap();
        let swept = store.requeue_stalled(Q, NOW + 10, 1).await.unwrap();
        assert_eq!(swept, StalledJobs { requeued: 1, failed: 0 });

        store.claim(Q, NOW + 20, lease).await.unwrap().unwrap();
        let swept = store.requeue_stalled(Q, NOW + 30, 1).await.unwrap();
        assert_eq!(swept, StalledJobs { requeued: 0, failed: 1 });

        let job = store.get(Q, "crashy").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.stalled_count, 2);
        assert_eq!(job.failed_reason.as_deref(), Some(STALLED_REASON));
        assert_eq!(job.finished_at, Some(NOW + 30));
        let counts = store.counts(Q).await.unwrap();
        assert_eq!((counts.waiting, counts.active, counts.failed), (0, 0, 1));
        assert!(store.claim(Q, NOW + 40, lease).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_job_transitions_error() {
        let store = MemoryJobStore::new();
        let err = store
            .complete(Q, "nope", "token", &json!(null), NOW)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::NotFound { .. }));
    }
}
