use std::collections::BTreeMap;
use std::time::Duration;

use admissions_cache::clock;
use admissions_jobs::handlers::ExportRequest;
use admissions_jobs::{EXPORT_QUEUE, Job, JobCounts, JobError, JobOptions, JobState};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::metrics;
use crate::state::AppState;

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Ready while the cache store answers. A local fallback store always does.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.cache.is_connected().await {
        (
            StatusCode::OK,
            Json(json!({ "status": "ready", "cache": state.cache.mode() })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "cache": state.cache.mode() })),
        )
    }
}

pub async fn metrics_handler() -> Response {
    match metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}

// =============================================================================
// Jobs
// =============================================================================

fn iso_millis(ms: Option<i64>) -> Value {
    ms.and_then(|ms| OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok())
        .and_then(|at| at.format(&Rfc3339).ok())
        .map(Value::String)
        .unwrap_or(Value::Null)
}

/// Polling view of a job: state, progress and the state-specific fields.
pub fn job_status_body(job: &Job) -> Value {
    let progress = match &job.progress {
        Some(Value::Number(n)) => json!({ "percent": n }),
        Some(p @ Value::Object(_)) => p.clone(),
        _ => json!({ "percent": 0 }),
    };

    let mut body = Map::new();
    body.insert("jobId".into(), json!(job.id));
    body.insert("queue".into(), json!(job.queue));
    body.insert("status".into(), json!(job.state));
    body.insert("attemptsMade".into(), json!(job.attempts_made));

    match job.state {
        JobState::Completed => {
            let result = job.result.as_ref();
            let field = |name: &str| result.and_then(|r| r.get(name)).cloned();
            body.insert("downloadLink".into(), field("downloadLink").unwrap_or(Value::Null));
            body.insert("fileName".into(), field("fileName").unwrap_or(Value::Null));
            body.insert("result".into(), result.cloned().unwrap_or(Value::Null));
            body.insert("completedAt".into(), iso_millis(job.finished_at));
        }
        JobState::Failed => {
            body.insert("error".into(), json!(job.failed_reason));
            body.insert("failedAt".into(), iso_millis(job.finished_at));
        }
        JobState::Waiting | JobState::Delayed | JobState::Active => {
            let logs = progress.get("logs").cloned().unwrap_or_else(|| json!([]));
            let stage = progress
                .get("stage")
                .cloned()
                .unwrap_or_else(|| json!("queued"));
            body.insert("logs".into(), logs);
            body.insert("stage".into(), stage);
        }
    }
    body.insert("progress".into(), progress);
    Value::Object(body)
}

pub async fn job_status(
    State(state): State<AppState>,
    Path((queue, id)): Path<(String, String)>,
) -> Response {
    let Some(queue) = state.queues.get(&queue) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Queue not found", "queue": queue })),
        )
            .into_response();
    };

    match queue.get_job(&id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job_status_body(&job))).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Job not found", "status": "not_found" })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(queue = %queue.name(), job_id = %id, error = %e, "Failed to read job");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to check job status", "message": e.to_string() })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExport {
    #[serde(default)]
    pub mobilizer_id: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

/// Queue an applicant export and point the caller at its status URL.
pub async fn create_export(
    State(state): State<AppState>,
    body: Option<Json<CreateExport>>,
) -> Response {
    let Json(body) = body.unwrap_or_default();
    let request = ExportRequest {
        mobilizer_id: body.mobilizer_id.filter(|m| !m.is_empty()),
        requested_by: body.requested_by,
        requested_at: OffsetDateTime::now_utc().format(&Rfc3339).ok(),
    };

    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let job_id = format!("export-{}-{}", clock::now_millis(), &suffix[..9]);
    let payload = match serde_json::to_value(&request) {
        Ok(payload) => payload,
        Err(e) => return export_failed(&JobError::from(e)),
    };

    let queue = &state.queues.export;
    match queue
        .add(
            "export-applicants",
            payload,
            JobOptions::with_id(&job_id).priority(request.priority()),
        )
        .await
    {
        Ok(enqueued) => {
            tracing::info!(job_id = %enqueued.job.id, mobilizer_id = ?request.mobilizer_id, "Export job queued");
            let mut body = json!({
                "success": true,
                "jobId": enqueued.job.id,
                "message": "Export job queued successfully",
                "statusUrl": format!("/api/jobs/{}/{}", queue.name(), enqueued.job.id),
            });
            if !state.is_processed(queue.name()) {
                tracing::warn!(job_id = %enqueued.job.id, queue = %queue.name(), "Export queued but no worker processes this queue");
                body["warning"] = json!(
                    "No export worker is configured; the job will stay queued until one runs"
                );
            }
            (StatusCode::ACCEPTED, Json(body)).into_response()
        }
        Err(e) => export_failed(&e),
    }
}

fn export_failed(e: &JobError) -> Response {
    tracing::error!(queue = EXPORT_QUEUE, error = %e, "Failed to queue export");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Failed to queue export job", "message": e.to_string() })),
    )
        .into_response()
}

/// Per-queue counts, memoized briefly so dashboards polling this do not
/// hammer the job store.
pub async fn queue_stats(State(state): State<AppState>) -> Response {
    let queues = state.queues.clone();
    let counts = state
        .memoizer
        .cached_query(
            "queueCounts",
            "all",
            Some(Duration::from_secs(5)),
            || async move {
                let mut counts = BTreeMap::new();
                for queue in queues.all() {
                    counts.insert(queue.name().to_string(), queue.counts().await?);
                }
                Ok::<BTreeMap<String, JobCounts>, JobError>(counts)
            },
        )
        .await;

    match counts {
        Ok(counts) => (StatusCode::OK, Json(json!({ "queues": counts }))).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to read queue counts");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to read queue counts", "message": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cache.stats().await)
}
