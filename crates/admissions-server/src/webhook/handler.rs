use admissions_cache::{ChangeContext, ChangeType};
use admissions_jobs::{JobCounts, JobOptions};
use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::event::{EnrollmentEventType, WebhookEvent};
use super::signature::verify_signature;
use crate::metrics::record_webhook_event;
use crate::state::AppState;

/// Rejections of a webhook delivery.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("invalid webhook signature")]
    Unauthorized,
    #[error("invalid webhook event structure")]
    BadRequest,
    #[error("failed to enqueue webhook event: {0}")]
    Internal(String),
}

impl WebhookError {
    fn outcome(&self) -> &'static str {
        match self {
            Self::MethodNotAllowed => "method_not_allowed",
            Self::Unauthorized => "unauthorized",
            Self::BadRequest => "invalid",
            Self::Internal(_) => "error",
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        record_webhook_event(self.outcome());
        let (status, error, message) = match &self {
            Self::MethodNotAllowed => (
                StatusCode::METHOD_NOT_ALLOWED,
                "Method not allowed",
                "Only POST requests are accepted",
            ),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "Unauthorized",
                "Invalid webhook signature",
            ),
            Self::BadRequest => (
                StatusCode::BAD_REQUEST,
                "Bad Request",
                "Invalid webhook event structure",
            ),
            Self::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
                "Failed to process webhook",
            ),
        };
        (status, Json(json!({ "error": error, "message": message }))).into_response()
    }
}

fn acknowledge(outcome: &'static str, body: serde_json::Value) -> Response {
    record_webhook_event(outcome);
    (StatusCode::OK, Json(body)).into_response()
}

fn already_processed(event_id: &str) -> Response {
    tracing::info!(event_id = %event_id, "Webhook event already processed, skipping");
    acknowledge(
        "duplicate",
        json!({ "message": "Event already processed", "eventId": event_id }),
    )
}

/// Webhook endpoint. Mounted for every method so non-POST requests get the
/// JSON 405 rather than an empty one.
pub async fn receive_webhook(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, WebhookError> {
    if method != Method::POST {
        return Err(WebhookError::MethodNotAllowed);
    }

    let header = state.webhook.signature_header();
    let signature = headers
        .get(header.as_str())
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let secret = state.webhook.secret.as_deref().unwrap_or_default();
    if !verify_signature(&body, signature, secret) {
        tracing::warn!(
            header = %header,
            signature_present = !signature.is_empty(),
            secret_configured = !secret.is_empty(),
            payload_len = body.len(),
            "Rejected webhook with invalid signature"
        );
        return Err(WebhookError::Unauthorized);
    }

    let Some(event) = WebhookEvent::parse(&body) else {
        tracing::warn!(payload_len = body.len(), "Invalid webhook event structure");
        return Err(WebhookError::BadRequest);
    };

    let Some(event_type) = EnrollmentEventType::parse(&event.event_type) else {
        tracing::warn!(event_id = %event.id, event_type = %event.event_type, "Unsupported webhook event type");
        return Ok(acknowledge(
            "unsupported",
            json!({ "message": "Event type not supported, but webhook received successfully" }),
        ));
    };

    let queue = &state.queues.enrollment;

    // Fast path for redeliveries; the enqueue below is idempotent either way.
    match queue.get_job(&event.id).await {
        Ok(Some(_)) => return Ok(already_processed(&event.id)),
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(event_id = %event.id, error = %e, "Duplicate check failed, relying on idempotent enqueue");
        }
    }

    let received_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    let payload = json!({
        "eventId": event.id,
        "eventType": event_type.as_str(),
        "enrollmentData": event.data,
        "receivedAt": received_at,
    });
    let enqueued = queue
        .add(
            &event.id,
            payload,
            JobOptions::with_id(&event.id).priority(event_type.priority()),
        )
        .await
        .map_err(|e| {
            tracing::error!(event_id = %event.id, error = %e, "Failed to enqueue webhook event");
            WebhookError::Internal(e.to_string())
        })?;

    if !enqueued.created {
        return Ok(already_processed(&event.id));
    }

    tracing::info!(
        event_id = %event.id,
        event_type = event_type.as_str(),
        job_id = %enqueued.job.id,
        priority = event_type.priority(),
        "Queued enrollment event"
    );

    let invalidator = state.invalidator.clone();
    tokio::spawn(async move {
        let removed = invalidator
            .invalidate_after_change(ChangeType::Enrollment, &ChangeContext::default())
            .await;
        tracing::debug!(removed, "Cache invalidated for enrollment webhook");
    });

    let counts = queue.counts().await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to read enrollment queue counts");
        JobCounts::default()
    });

    Ok(acknowledge(
        "accepted",
        json!({
            "message": "Webhook processed successfully",
            "eventId": event.id,
            "eventType": event_type.as_str(),
            "jobId": enqueued.job.id,
            "queueStatus": {
                "waiting": counts.waiting,
                "failed": counts.failed,
            },
        }),
    ))
}
