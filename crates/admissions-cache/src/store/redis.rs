//! Redis store over a deadpool connection pool.

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool, Runtime};
use redis::{AsyncCommands, RedisResult, Script};

use super::{CacheStore, ttl_millis};
use crate::config::RedisConfig;
use crate::error::CacheError;

/// Keys fetched per `SCAN` round trip.
const SCAN_COUNT: usize = 500;

/// Keys removed per `DEL` command.
const DELETE_BATCH: usize = 500;

static RELEASE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        ",
    )
});

static INCR_EXPIRE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local count = redis.call('INCR', KEYS[1])
        if count == 1 then
            redis.call('PEXPIRE', KEYS[1], ARGV[1])
        end
        return count
        ",
    )
});

/// Create a Redis pool from configuration.
///
/// Creating the pool does not open a connection; call [`RedisStore::connect`]
/// (or check out a connection) to verify the server is reachable.
pub fn create_pool(config: &RedisConfig) -> Result<Pool, CacheError> {
    let mut redis_config = deadpool_redis::Config::from_url(config.connection_url());
    let timeout = config.connect_timeout();
    let pool_config = redis_config.pool.get_or_insert_with(Default::default);
    pool_config.max_size = config.pool_size;
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);

    redis_config
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| CacheError::Pool(e.to_string()))
}

/// Multi-instance store shared by every web and worker process.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    command_timeout: Duration,
}

impl RedisStore {
    /// Build a store on an existing pool (the job store shares the same pool).
    pub fn new(pool: Pool, command_timeout: Duration) -> Self {
        Self {
            pool,
            command_timeout,
        }
    }

    /// Create the pool and verify the server answers `PING`.
    pub async fn connect(config: &RedisConfig) -> Result<Self, CacheError> {
        let store = Self::new(create_pool(config)?, config.command_timeout());
        store.ping().await?;
        tracing::info!(url = %config.redacted_url(), "Connected to Redis");
        Ok(store)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> Result<Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Pool(e.to_string()))
    }

    /// Bound a single command by the configured command timeout.
    async fn bounded<T>(
        &self,
        command: impl Future<Output = RedisResult<T>>,
    ) -> Result<T, CacheError> {
        match tokio::time::timeout(self.command_timeout, command).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::Timeout(self.command_timeout)),
        }
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    fn mode(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn().await?;
        self.bounded(conn.get::<_, Option<String>>(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        self.bounded(conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl)))
            .await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let mut command = redis::cmd("SET");
        command
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl));
        let reply: Option<String> = self.bounded(command.query_async(&mut conn)).await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let mut invocation = RELEASE_SCRIPT.key(key);
        invocation.arg(expected);
        let removed: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(removed > 0)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let mut removed = 0;
        for batch in keys.chunks(DELETE_BATCH) {
            removed += self
                .bounded(conn.del::<_, u64>(batch.to_vec()))
                .await?;
        }
        Ok(removed)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn().await?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let mut command = redis::cmd("SCAN");
            command
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT);
            let (next, batch): (u64, Vec<String>) =
                self.bounded(command.query_async(&mut conn)).await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once while the keyspace is rehashing.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn incr_and_expire(&self, key: &str, ttl: Duration) -> Result<i64, CacheError> {
        let mut conn = self.conn().await?;
        let mut invocation = INCR_EXPIRE_SCRIPT.key(key);
        invocation.arg(ttl_millis(ttl));
        let count: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(count)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let _pong: String = self
            .bounded(redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
        tracing::info!("Redis pool closed");
    }
}
