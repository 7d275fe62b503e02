use std::net::SocketAddr;

use axum::{
    Router, middleware,
    routing::{any, get, post},
};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::{
    config::AppConfig,
    handlers, middleware as app_middleware,
    state::AppState,
    webhook,
    workers::{self, Backends},
};

pub fn build_app(state: AppState, cfg: &AppConfig) -> Router {
    let body_limit = cfg.server.body_limit_bytes;

    // Rate limited; the webhook route is authenticated by signature instead
    let api = Router::new()
        .route("/api/jobs/{queue}/{id}", get(handlers::job_status))
        .route("/api/exports", post(handlers::create_export))
        .route("/api/queues/stats", get(handlers::queue_stats))
        .route("/api/cache/stats", get(handlers::cache_stats))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::rate_limit,
        ));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics_handler))
        .route(&cfg.webhook.path, any(webhook::receive_webhook))
        .merge(api)
        .with_state(state)
        // Later layers wrap earlier ones; request_id must sit outside the
        // trace layer for the span to see the id.
        .layer(middleware::from_fn(app_middleware::http_metrics))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(middleware::from_fn(app_middleware::request_id))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

pub struct AdmissionsServer {
    addr: SocketAddr,
    app: Router,
    state: AppState,
    config: AppConfig,
    backends: Backends,
    run_workers: bool,
}

pub struct ServerBuilder {
    config: AppConfig,
    backends: Backends,
    run_workers: bool,
}

impl ServerBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            backends: Backends::default(),
            run_workers: false,
        }
    }

    /// Job handler backends available to the deployment's workers. Queues
    /// without one are reported as unprocessed.
    pub fn with_backends(mut self, backends: Backends) -> Self {
        self.backends = backends;
        self
    }

    /// Also run the queue workers in this process.
    pub fn with_workers(mut self) -> Self {
        self.run_workers = true;
        self
    }

    pub async fn build(self) -> anyhow::Result<AdmissionsServer> {
        let state = AppState::connect(&self.config).await?;
        let unprocessed = workers::unprocessed_queues(&state, &self.backends);
        if !self.run_workers {
            for queue in &unprocessed {
                tracing::warn!(queue = %queue, "No worker consumes this queue, its jobs will stay waiting");
            }
        }
        let state = state.with_unprocessed_queues(unprocessed);
        let app = build_app(state.clone(), &self.config);
        Ok(AdmissionsServer {
            addr: self.config.addr(),
            app,
            state,
            config: self.config,
            backends: self.backends,
            run_workers: self.run_workers,
        })
    }
}

impl AdmissionsServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = self.run_workers.then(|| {
            let registry = workers::build_registry(&self.config, &self.state, &self.backends);
            workers::spawn_workers(&self.state, &registry, shutdown_rx.clone())
        });

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        let mut server_shutdown = shutdown_rx.clone();
        let server = axum::serve(listener, self.app).with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        });
        let server = tokio::spawn(async move { server.await });

        shutdown_signal().await;
        let _ = shutdown_tx.send(true);

        match server.await {
            Ok(result) => result?,
            Err(e) => tracing::error!(error = %e, "HTTP server task failed"),
        }
        if let Some(workers) = workers {
            workers.join().await;
        }
        self.state.cache.close().await;
        tracing::info!("server stopped");
        Ok(())
    }
}

/// Run only the queue workers until a shutdown signal, then drain.
pub async fn run_workers(config: AppConfig, backends: Backends) -> anyhow::Result<()> {
    let state = AppState::connect(&config).await?;
    let registry = workers::build_registry(&config, &state, &backends);
    if registry.queues().next().is_none() {
        anyhow::bail!("no queue has a handler; configure SMTP or run with application backends");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = workers::spawn_workers(&state, &registry, shutdown_rx);

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    workers.join().await;
    state.cache.close().await;
    tracing::info!("workers stopped");
    Ok(())
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
