//! HTTP surface and process wiring for the admissions background core.
//!
//! - `POST <webhook.path>`: signed enrollment webhooks, enqueued idempotently
//! - `/api/jobs/{queue}/{id}`, `/api/exports`, `/api/queues/stats`,
//!   `/api/cache/stats`: job polling and operational views, rate limited
//! - `/healthz`, `/readyz`, `/metrics`
//!
//! Queue workers run in the same process (`serve --with-workers`) or on
//! their own (`worker`).

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod server;
pub mod state;
pub mod webhook;
pub mod workers;

pub use config::AppConfig;
pub use observability::init_tracing;
pub use server::{AdmissionsServer, ServerBuilder, build_app, run_workers};
pub use state::{AppState, Queues};
pub use workers::Backends;
