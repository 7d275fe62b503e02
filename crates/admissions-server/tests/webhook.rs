//! Webhook pipeline driven through the router with in-memory stores.

use std::sync::Arc;

use admissions_cache::{Cache, CacheKeys, MemoryStore};
use admissions_jobs::{EXPORT_QUEUE, JobState, MemoryJobStore};
use admissions_server::config::AppConfig;
use admissions_server::webhook::sign;
use admissions_server::{AppState, build_app};
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
};
use serde_json::{Value, json};
use std::time::Duration;
use tower::ServiceExt;

const SECRET: &str = "test-secret";
const PATH: &str = "/api/webhooks/enrollment";
const SIGNATURE_HEADER: &str = "X-Thinkific-Hmac-SHA256";

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.redis.enabled = false;
    cfg.webhook.secret = Some(SECRET.into());
    cfg
}

fn test_app(cfg: &AppConfig) -> (Router, AppState) {
    let state = AppState::from_parts(
        cfg,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryJobStore::new()),
    );
    (build_app(state.clone(), cfg), state)
}

fn signed_post(body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(PATH)
        .header("content-type", "application/json")
        .header(SIGNATURE_HEADER, sign(body.as_bytes(), SECRET))
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn event(id: &str, event_type: &str) -> String {
    json!({
        "id": id,
        "type": event_type,
        "data": {"id": 501, "user_id": 77, "course_id": 12, "percentage_completed": 0.0},
    })
    .to_string()
}

#[tokio::test]
async fn test_valid_event_is_enqueued() {
    let cfg = test_config();
    let (app, state) = test_app(&cfg);

    let (status, body) = send(&app, signed_post(&event("evt-1", "enrollment.completed"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Webhook processed successfully");
    assert_eq!(body["eventId"], "evt-1");
    assert_eq!(body["eventType"], "enrollment.completed");
    assert_eq!(body["jobId"], "evt-1");
    assert_eq!(body["queueStatus"]["waiting"], 1);
    assert_eq!(body["queueStatus"]["failed"], 0);

    let job = state.queues.enrollment.get_job("evt-1").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.priority, 1);
    assert_eq!(job.payload["eventId"], "evt-1");
    assert_eq!(job.payload["eventType"], "enrollment.completed");
    assert_eq!(job.payload["enrollmentData"]["course_id"], 12);
    assert!(job.payload["receivedAt"].is_string());
}

#[tokio::test]
async fn test_duplicate_delivery_enqueues_once() {
    let cfg = test_config();
    let (app, state) = test_app(&cfg);
    let body = event("evt-dup", "enrollment.created");

    let (first_status, first) = send(&app, signed_post(&body)).await;
    let (second_status, second) = send(&app, signed_post(&body)).await;

    assert_eq!(first_status, StatusCode::OK);
    assert_eq!(first["message"], "Webhook processed successfully");
    assert_eq!(second_status, StatusCode::OK);
    assert_eq!(second["message"], "Event already processed");
    assert_eq!(second["eventId"], "evt-dup");

    let counts = state.queues.enrollment.counts().await.unwrap();
    assert_eq!(counts.waiting, 1);
}

#[tokio::test]
async fn test_invalid_signature_is_rejected_without_side_effects() {
    let cfg = test_config();
    let (app, state) = test_app(&cfg);
    let body = event("evt-forged", "enrollment.created");

    let forged = Request::builder()
        .method(Method::POST)
        .uri(PATH)
        .header(SIGNATURE_HEADER, sign(body.as_bytes(), "wrong-secret"))
        .body(Body::from(body.clone()))
        .unwrap();
    let (status, response) = send(&app, forged).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error"], "Unauthorized");
    assert_eq!(response["message"], "Invalid webhook signature");

    let unsigned = Request::builder()
        .method(Method::POST)
        .uri(PATH)
        .body(Body::from(body))
        .unwrap();
    let (status, _) = send(&app, unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert!(state.queues.enrollment.get_job("evt-forged").await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_secret_rejects_everything() {
    let mut cfg = test_config();
    cfg.webhook.secret = None;
    let (app, _) = test_app(&cfg);

    let (status, _) = send(&app, signed_post(&event("evt-1", "enrollment.created"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_signature_header_is_case_insensitive() {
    let cfg = test_config();
    let (app, _) = test_app(&cfg);
    let body = event("evt-case", "enrollment.progress");

    let req = Request::builder()
        .method(Method::POST)
        .uri(PATH)
        .header("X-THINKIFIC-HMAC-SHA256", sign(body.as_bytes(), SECRET))
        .body(Body::from(body))
        .unwrap();
    let (status, response) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["jobId"], "evt-case");
}

#[tokio::test]
async fn test_malformed_event_is_bad_request() {
    let cfg = test_config();
    let (app, _) = test_app(&cfg);

    for body in [
        json!({"type": "enrollment.created", "data": {}}).to_string(),
        json!({"id": "evt", "data": {}}).to_string(),
        json!({"id": "evt", "type": "enrollment.created"}).to_string(),
        "not json".to_string(),
    ] {
        let (status, response) = send(&app, signed_post(&body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        assert_eq!(response["message"], "Invalid webhook event structure");
    }
}

#[tokio::test]
async fn test_unsupported_event_type_is_acknowledged() {
    let cfg = test_config();
    let (app, state) = test_app(&cfg);

    let (status, body) = send(&app, signed_post(&event("evt-order", "order.created"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["message"],
        "Event type not supported, but webhook received successfully"
    );
    assert!(state.queues.enrollment.get_job("evt-order").await.unwrap().is_none());
}

#[tokio::test]
async fn test_non_post_is_method_not_allowed() {
    let cfg = test_config();
    let (app, _) = test_app(&cfg);

    let req = Request::builder()
        .method(Method::GET)
        .uri(PATH)
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;

    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body["error"], "Method not allowed");
    assert_eq!(body["message"], "Only POST requests are accepted");
}

#[tokio::test]
async fn test_accepted_event_invalidates_enrollment_cache() {
    let cfg = test_config();
    let (app, state) = test_app(&cfg);
    let cache: &Cache = &state.cache;
    let key = CacheKeys::enrollments(&json!({"page": 1})).unwrap();
    cache.set(&key, &json!(["cached"]), Duration::from_secs(60)).await;

    let (status, _) = send(&app, signed_post(&event("evt-inv", "enrollment.created"))).await;
    assert_eq!(status, StatusCode::OK);

    let mut gone = false;
    for _ in 0..50 {
        if cache.get::<Value>(&key).await.is_none() {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(gone, "enrollment cache entry should be invalidated");
}

#[tokio::test]
async fn test_job_status_and_export_routes() {
    let cfg = test_config();
    let (app, _) = test_app(&cfg);

    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/exports")
        .header("content-type", "application/json")
        .body(Body::from(json!({"mobilizerId": "mob-1"}).to_string()))
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["success"], true);
    let job_id = body["jobId"].as_str().unwrap().to_string();
    assert!(job_id.starts_with("export-"));
    assert!(body.get("warning").is_none());
    let status_url = body["statusUrl"].as_str().unwrap().to_string();
    assert_eq!(status_url, format!("/api/jobs/applicant-exports/{job_id}"));

    let req = Request::builder().uri(&status_url).body(Body::empty()).unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobId"], job_id.as_str());
    assert_eq!(body["status"], "waiting");
    assert_eq!(body["stage"], "queued");

    let req = Request::builder()
        .uri("/api/jobs/applicant-exports/missing")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "not_found");
}

#[tokio::test]
async fn test_export_without_worker_is_flagged() {
    let cfg = test_config();
    let state = AppState::from_parts(
        &cfg,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryJobStore::new()),
    )
    .with_unprocessed_queues(vec![EXPORT_QUEUE.to_string()]);
    let app = build_app(state.clone(), &cfg);

    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/exports")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["success"], true);
    assert!(body["warning"].as_str().unwrap().contains("No export worker"));
    let job_id = body["jobId"].as_str().unwrap();
    let job = state.queues.export.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Waiting);
}

#[tokio::test]
async fn test_api_rate_limit() {
    let mut cfg = test_config();
    cfg.rate_limit.limit = 2;
    let (app, _) = test_app(&cfg);

    let request = || {
        Request::builder()
            .uri("/api/cache/stats")
            .header("x-forwarded-for", "198.51.100.4")
            .body(Body::empty())
            .unwrap()
    };

    assert_eq!(send(&app, request()).await.0, StatusCode::OK);
    assert_eq!(send(&app, request()).await.0, StatusCode::OK);
    let (status, body) = send(&app, request()).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "Rate limit exceeded");

    // Health checks are not limited
    let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    assert_eq!(send(&app, req).await.0, StatusCode::OK);
}
