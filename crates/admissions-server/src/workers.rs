//! Queue worker wiring.
//!
//! Handlers reach the database and mail relay through traits; [`Backends`]
//! carries whichever implementations the host process has. A queue whose
//! handler cannot be built is left unconsumed (jobs stay waiting) and a
//! warning is logged at startup.

use std::sync::Arc;

use admissions_jobs::handlers::{
    ApplicantSource, EmailTransport, EnrollmentEventHandler, EnrollmentSink, ExportHandler,
    NotificationEmailHandler, SmtpTransport,
};
use admissions_jobs::{HandlerRegistry, JobError, Worker};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::AppConfig;
use crate::state::AppState;

/// External systems the job handlers depend on.
#[derive(Clone, Default)]
pub struct Backends {
    pub applicants: Option<Arc<dyn ApplicantSource>>,
    pub enrollments: Option<Arc<dyn EnrollmentSink>>,
    pub email: Option<Arc<dyn EmailTransport>>,
}

impl Backends {
    /// Backends available from configuration alone: the SMTP relay when
    /// `email.smtp_host` is set.
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        let email = match cfg.email.smtp_host.as_deref().filter(|h| !h.is_empty()) {
            Some(host) => {
                let transport = SmtpTransport::new(
                    host,
                    cfg.email.smtp_port,
                    cfg.email.smtp_username.clone(),
                    cfg.email.smtp_password.clone(),
                    cfg.email.from.clone(),
                )?;
                Some(Arc::new(transport) as Arc<dyn EmailTransport>)
            }
            None => None,
        };
        Ok(Self {
            email,
            ..Default::default()
        })
    }

    pub fn with_applicant_source(mut self, source: Arc<dyn ApplicantSource>) -> Self {
        self.applicants = Some(source);
        self
    }

    pub fn with_enrollment_sink(mut self, sink: Arc<dyn EnrollmentSink>) -> Self {
        self.enrollments = Some(sink);
        self
    }

    pub fn with_email_transport(mut self, transport: Arc<dyn EmailTransport>) -> Self {
        self.email = Some(transport);
        self
    }
}

/// Queues that no handler can be built for with `backends`. Jobs enqueued
/// on them stay waiting.
pub fn unprocessed_queues(state: &AppState, backends: &Backends) -> Vec<String> {
    let queues = &state.queues;
    let mut missing = Vec::new();
    if backends.applicants.is_none() {
        missing.push(queues.export.name().to_string());
    }
    if backends.email.is_none() {
        missing.push(queues.notification_email.name().to_string());
    }
    if backends.enrollments.is_none() {
        missing.push(queues.enrollment.name().to_string());
    }
    missing
}

/// Register a handler for every queue whose backend is present.
pub fn build_registry(cfg: &AppConfig, state: &AppState, backends: &Backends) -> HandlerRegistry {
    let queues = &state.queues;
    let mut registry = HandlerRegistry::new();

    match &backends.applicants {
        Some(source) => {
            let handler = ExportHandler::new(source.clone(), &cfg.export.output_dir)
                .with_download_base(&cfg.export.download_base);
            registry = registry.register(queues.export.name(), Arc::new(handler));
        }
        None => tracing::warn!(queue = %queues.export.name(), "No applicant source configured, export jobs will not be processed"),
    }

    match &backends.email {
        Some(transport) => {
            let handler = NotificationEmailHandler::new(transport.clone())
                .with_company_name(&cfg.email.company_name);
            registry = registry.register(queues.notification_email.name(), Arc::new(handler));
        }
        None => tracing::warn!(queue = %queues.notification_email.name(), "SMTP not configured, notification emails will not be sent"),
    }

    match &backends.enrollments {
        Some(sink) => {
            let handler = EnrollmentEventHandler::new(sink.clone())
                .with_invalidator(state.invalidator.clone());
            registry = registry.register(queues.enrollment.name(), Arc::new(handler));
        }
        None => tracing::warn!(queue = %queues.enrollment.name(), "No enrollment sink configured, enrollment events will not be processed"),
    }

    registry
}

/// Running workers, one per registered queue.
pub struct WorkerSet {
    tasks: JoinSet<(String, Result<(), JobError>)>,
}

impl WorkerSet {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every worker to drain and stop.
    pub async fn join(mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((queue, Ok(()))) => tracing::debug!(queue = %queue, "Worker exited"),
                Ok((queue, Err(e))) => tracing::error!(queue = %queue, error = %e, "Worker failed"),
                Err(e) => tracing::error!(error = %e, "Worker task panicked"),
            }
        }
    }
}

/// Spawn a worker for each queue in `registry`. Workers stop claiming when
/// `shutdown` flips to `true` and finish their in-flight jobs.
pub fn spawn_workers(
    state: &AppState,
    registry: &HandlerRegistry,
    shutdown: watch::Receiver<bool>,
) -> WorkerSet {
    let mut tasks = JoinSet::new();
    for queue in state.queues.all() {
        let Ok(handler) = registry.get(queue.name()) else {
            continue;
        };
        let name = queue.name().to_string();
        let worker = Worker::new(queue.clone(), handler).with_throttle(state.rate_limiter.clone());
        let shutdown = shutdown.clone();
        tasks.spawn(async move { (name, worker.run(shutdown).await) });
    }
    tracing::info!(workers = tasks.len(), "Queue workers started");
    WorkerSet { tasks }
}
