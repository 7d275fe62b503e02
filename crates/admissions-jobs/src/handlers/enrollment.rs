//! Enrollment events received through the webhook pipeline.

use std::sync::Arc;
use std::time::Instant;

use admissions_cache::{ChangeContext, ChangeType, Invalidator};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::types::Job;
use crate::worker::{JobContext, JobHandler};

/// Enrollment fields carried by an event. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentUpdate {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub user_id: Option<i64>,
    pub course_id: i64,
    #[serde(default)]
    pub activated_at: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub expiry_date: Option<String>,
    #[serde(default)]
    pub percentage_completed: Option<f64>,
    #[serde(default)]
    pub is_free_trial: Option<bool>,
    #[serde(default)]
    pub completed: Option<bool>,
    #[serde(default)]
    pub expired: Option<bool>,
}

/// Outcome of applying an update.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedEnrollment {
    pub enrollment_id: String,
    /// Cohort whose cached views are now stale, when known
    pub cohort_id: Option<String>,
}

/// Write side of the enrollment table.
#[async_trait]
pub trait EnrollmentSink: Send + Sync {
    /// Whether the enrollment this update targets is already completed.
    async fn is_completed(&self, update: &EnrollmentUpdate) -> anyhow::Result<bool>;

    /// Insert or update the enrollment. Must be idempotent.
    async fn upsert(&self, update: &EnrollmentUpdate) -> anyhow::Result<AppliedEnrollment>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnrollmentEvent {
    event_id: String,
    event_type: String,
    enrollment_data: Value,
}

pub struct EnrollmentEventHandler {
    sink: Arc<dyn EnrollmentSink>,
    invalidator: Option<Invalidator>,
}

impl EnrollmentEventHandler {
    pub fn new(sink: Arc<dyn EnrollmentSink>) -> Self {
        Self {
            sink,
            invalidator: None,
        }
    }

    /// Drop cached enrollment views once an event has been applied.
    pub fn with_invalidator(mut self, invalidator: Invalidator) -> Self {
        self.invalidator = Some(invalidator);
        self
    }
}

#[async_trait]
impl JobHandler for EnrollmentEventHandler {
    async fn handle(&self, job: &Job, _ctx: &JobContext) -> anyhow::Result<Value> {
        let started = Instant::now();
        let event: EnrollmentEvent = serde_json::from_value(job.payload.clone())?;
        tracing::info!(
            job_id = %job.id,
            event_id = %event.event_id,
            event_type = %event.event_type,
            "Processing enrollment event"
        );

        // A malformed enrollment will not improve on retry.
        let update: EnrollmentUpdate = match serde_json::from_value(event.enrollment_data) {
            Ok(update) => update,
            Err(e) => {
                tracing::error!(
                    event_id = %event.event_id,
                    error = %e,
                    "Non-retryable enrollment event"
                );
                return Ok(json!({"status": "failed", "error": e.to_string()}));
            }
        };

        if self.sink.is_completed(&update).await? {
            tracing::info!(
                event_id = %event.event_id,
                enrollment_id = ?update.id,
                "Enrollment already completed, skipping"
            );
            return Ok(json!({"status": "skipped", "reason": "already_completed"}));
        }

        let applied = self.sink.upsert(&update).await?;
        let processing_time = started.elapsed().as_millis() as u64;

        if let Some(invalidator) = &self.invalidator {
            let context = ChangeContext {
                cohort_id: applied.cohort_id.clone(),
                user_email: None,
            };
            invalidator
                .invalidate_after_change(ChangeType::Enrollment, &context)
                .await;
        }

        tracing::info!(
            event_id = %event.event_id,
            enrollment_id = %applied.enrollment_id,
            processing_time_ms = processing_time,
            "Enrollment event applied"
        );
        Ok(json!({
            "status": "success",
            "enrollmentId": applied.enrollment_id,
            "processingTime": processing_time,
            "eventType": event.event_type,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::Queue;
    use crate::store::MemoryJobStore;
    use crate::types::JobOptions;
    use admissions_cache::Cache;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Enrollments {
        rows: Mutex<HashMap<(Option<i64>, i64), EnrollmentUpdate>>,
        fail_upserts: bool,
    }

    #[async_trait]
    impl EnrollmentSink for Enrollments {
        async fn is_completed(&self, update: &EnrollmentUpdate) -> anyhow::Result<bool> {
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .get(&(update.id, update.course_id))
                .and_then(|row| row.completed)
                .unwrap_or(false))
        }

        async fn upsert(&self, update: &EnrollmentUpdate) -> anyhow::Result<AppliedEnrollment> {
            if self.fail_upserts {
                anyhow::bail!("connection reset");
            }
            self.rows
                .lock()
                .unwrap()
                .insert((update.id, update.course_id), update.clone());
            Ok(AppliedEnrollment {
                enrollment_id: format!("enr-{}", update.id.unwrap_or_default()),
                cohort_id: Some("c7".into()),
            })
        }
    }

    async fn run(handler: &EnrollmentEventHandler, id: &str, data: Value) -> anyhow::Result<Value> {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Queue::new(QueueConfig::enrollment(), store.clone());
        let payload = json!({
            "eventId": id,
            "eventType": "enrollment.completed",
            "enrollmentData": data,
            "receivedAt": "2026-01-01T00:00:00Z"
        });
        let enqueued = queue.add(id, payload, JobOptions::with_id(id)).await.unwrap();
        let ctx = JobContext::new(store, &enqueued.job);
        handler.handle(&enqueued.job, &ctx).await
    }

    #[tokio::test]
    async fn test_applies_then_skips_completed_enrollment() {
        let handler = EnrollmentEventHandler::new(Arc::new(Enrollments::default()));
        let data = json!({"id": 11, "user_id": 5, "course_id": 3, "completed": true});

        let first = run(&handler, "evt-1", data.clone()).await.unwrap();
        assert_eq!(first["status"], "success");
        assert_eq!(first["enrollmentId"], "enr-11");
        assert_eq!(first["eventType"], "enrollment.completed");

        let second = run(&handler, "evt-2", data).await.unwrap();
        assert_eq!(second, json!({"status": "skipped", "reason": "already_completed"}));
    }

    #[tokio::test]
    async fn test_malformed_enrollment_is_not_retried() {
        let handler = EnrollmentEventHandler::new(Arc::new(Enrollments::default()));
        let result = run(&handler, "evt-1", json!({"id": 11})).await.unwrap();
        assert_eq!(result["status"], "failed");
    }

    #[tokio::test]
    async fn test_sink_errors_propagate() {
        let handler = EnrollmentEventHandler::new(Arc::new(Enrollments {
            fail_upserts: true,
            ..Default::default()
        }));
        let err = run(&handler, "evt-1", json!({"course_id": 3})).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_invalidates_cohort_caches() {
        let cache = Cache::in_memory();
        let ttl = Duration::from_secs(60);
        cache.set("enrollments:{\"page\":1}", &1, ttl).await;
        cache.set("statistics:cohort:c7", &2, ttl).await;
        cache.set("statistics:cohort:c8", &3, ttl).await;

        let handler = EnrollmentEventHandler::new(Arc::new(Enrollments::default()))
            .with_invalidator(Invalidator::new(cache.clone()));
        run(&handler, "evt-1", json!({"id": 1, "course_id": 3})).await.unwrap();

        assert_eq!(cache.get::<i32>("enrollments:{\"page\":1}").await, None);
        assert_eq!(cache.get::<i32>("statistics:cohort:c7").await, None);
        assert_eq!(cache.get::<i32>("statistics:cohort:c8").await, Some(3));
    }
}
