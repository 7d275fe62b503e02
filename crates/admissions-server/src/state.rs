use std::sync::Arc;

use admissions_cache::store::create_pool;
use admissions_cache::{Cache, CacheStore, Invalidator, Memoizer, RateLimiter, connect_store};
use admissions_jobs::{
    ENROLLMENT_QUEUE, EXPORT_QUEUE, JobStore, MemoryJobStore, NOTIFICATION_EMAIL_QUEUE, Queue,
    RedisJobStore,
};

use crate::config::{AppConfig, QueuesConfig, RateLimitConfig, WebhookConfig};

/// Producer handles for the three portal queues.
pub struct Queues {
    pub export: Queue,
    pub notification_email: Queue,
    pub enrollment: Queue,
}

impl Queues {
    pub fn new(config: &QueuesConfig, store: Arc<dyn JobStore>) -> Self {
        Self {
            export: Queue::new(config.export(), store.clone()),
            notification_email: Queue::new(config.notification_email(), store.clone()),
            enrollment: Queue::new(config.enrollment(), store),
        }
    }

    /// Look a queue up by its configured name.
    pub fn get(&self, name: &str) -> Option<&Queue> {
        self.all().into_iter().find(|q| q.name() == name)
    }

    pub fn all(&self) -> [&Queue; 3] {
        [&self.export, &self.notification_email, &self.enrollment]
    }
}

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub cache: Cache,
    pub memoizer: Memoizer,
    pub invalidator: Invalidator,
    pub rate_limiter: RateLimiter,
    pub queues: Arc<Queues>,
    pub job_store: Arc<dyn JobStore>,
    pub webhook: Arc<WebhookConfig>,
    pub rate_limit: RateLimitConfig,
    /// Queues no worker in this deployment consumes
    pub unprocessed_queues: Arc<Vec<String>>,
}

impl AppState {
    /// Wire the state from already constructed stores.
    pub fn from_parts(
        cfg: &AppConfig,
        cache_store: Arc<dyn CacheStore>,
        job_store: Arc<dyn JobStore>,
    ) -> Self {
        let cache = Cache::new(cache_store);
        Self {
            memoizer: Memoizer::new(cache.clone(), cfg.cache.clone()),
            invalidator: Invalidator::new(cache.clone()),
            rate_limiter: RateLimiter::new(cache.clone()),
            queues: Arc::new(Queues::new(&cfg.queues, job_store.clone())),
            job_store,
            webhook: Arc::new(cfg.webhook.clone()),
            rate_limit: cfg.rate_limit.clone(),
            unprocessed_queues: Arc::new(Vec::new()),
            cache,
        }
    }

    /// Mark queues whose jobs nothing will pick up, so responses can say so.
    pub fn with_unprocessed_queues(mut self, queues: Vec<String>) -> Self {
        self.unprocessed_queues = Arc::new(queues);
        self
    }

    pub fn is_processed(&self, queue: &str) -> bool {
        !self.unprocessed_queues.iter().any(|q| q == queue)
    }

    /// Connect the cache and job stores described by `cfg`.
    ///
    /// The cache falls back to process memory when Redis is unreachable. The
    /// job store does not: with Redis enabled, jobs always go to Redis and
    /// enqueue fails until it is reachable again.
    pub async fn connect(cfg: &AppConfig) -> anyhow::Result<Self> {
        let cache_store = connect_store(&cfg.redis).await;
        let job_store: Arc<dyn JobStore> = if cfg.redis.enabled {
            let pool = create_pool(&cfg.redis)?;
            Arc::new(RedisJobStore::new(pool, cfg.redis.command_timeout()))
        } else {
            tracing::warn!("Redis disabled, jobs are kept in process memory and lost on restart");
            Arc::new(MemoryJobStore::new())
        };

        tracing::info!(
            cache = cache_store.mode(),
            queues = ?[EXPORT_QUEUE, NOTIFICATION_EMAIL_QUEUE, ENROLLMENT_QUEUE],
            "Application state initialized"
        );
        Ok(Self::from_parts(cfg, cache_store, job_store))
    }
}
