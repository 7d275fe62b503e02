//! Redis job store.
//!
//! Layout per queue (`jobs:<queue>:` prefix):
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `job:<id>` | hash | job fields |
//! | `waiting` | zset | id by priority rank |
//! | `delayed` | zset | id by run-at ms |
//! | `active` | zset | id by lease deadline ms |
//! | `completed` / `failed` | zset | id by finish ms |
//!
//! The job hash holds `lock_token` while the job is active; finishing
//! transitions compare it before moving the job.
//!
//! Multi-key transitions run as Lua scripts. The scripts derive job hash keys
//! from a prefix argument, which assumes a single (non-cluster) Redis.

use std::collections::HashMap;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use redis::{RedisResult, Script};
use serde_json::Value;

use super::{JobStore, STALLED_REASON, waiting_rank};
use crate::config::Retention;
use crate::error::JobError;
use crate::types::{Job, JobCounts, JobState, StalledJobs};

static ADD_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('EXISTS', KEYS[1]) == 1 then
            return 0
        end
        redis.call('HSET', KEYS[1], unpack(ARGV, 4))
        if ARGV[2] == 'delayed' then
            redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
        else
            redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
        end
        return 1
        ",
    )
});

// KEYS: waiting, delayed, active. ARGV: now, lease deadline, job key prefix, lock token.
static CLAIM_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'WITHSCORES', 'LIMIT', 0, 100)
        for i = 1, #due, 2 do
            local id = due[i]
            local key = ARGV[3] .. id
            redis.call('ZREM', KEYS[2], id)
            if redis.call('EXISTS', key) == 1 then
                local priority = math.min(tonumber(redis.call('HGET', key, 'priority') or '0'), 900)
                local rank = priority * 10000000000000 + tonumber(due[i + 1])
                redis.call('ZADD', KEYS[1], string.format('%.0f', rank), id)
                redis.call('HSET', key, 'state', 'waiting')
            end
        end

        while true do
            local popped = redis.call('ZPOPMIN', KEYS[1])
            if #popped == 0 then
                return false
            end
            local id = popped[1]
            local key = ARGV[3] .. id
            if redis.call('EXISTS', key) == 1 then
                redis.call('HSET', key, 'state', 'active', 'processed_at', ARGV[1], 'lock_token', ARGV[4])
                redis.call('ZADD', KEYS[3], ARGV[2], id)
                return redis.call('HGETALL', key)
            end
        end
        ",
    )
});

// KEYS: job, active, target set. ARGV: id, lock token, target score, field/value pairs.
// Returns 0 for a missing job and -1 when the token no longer holds the claim.
static MOVE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('EXISTS', KEYS[1]) == 0 then
            return 0
        end
        if not redis.call('ZSCORE', KEYS[2], ARGV[1]) then
            return -1
        end
        if redis.call('HGET', KEYS[1], 'lock_token') ~= ARGV[2] then
            return -1
        end
        redis.call('ZREM', KEYS[2], ARGV[1])
        redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
        redis.call('HDEL', KEYS[1], 'lock_token')
        redis.call('HSET', KEYS[1], unpack(ARGV, 4))
        return 1
        ",
    )
});

static PROGRESS_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('EXISTS', KEYS[1]) == 0 then
            return 0
        end
        redis.call('HSET', KEYS[1], 'progress', ARGV[1])
        return 1
        ",
    )
});

// KEYS: finished set. ARGV: cutoff (-1 = none), max count (-1 = none), prefix.
static PRUNE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local removed = {}
        local cutoff = tonumber(ARGV[1])
        if cutoff >= 0 then
            local old = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
            for _, id in ipairs(old) do
                table.insert(removed, id)
            end
            redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
        end
        local keep = tonumber(ARGV[2])
        if keep >= 0 then
            local excess = redis.call('ZCARD', KEYS[1]) - keep
            if excess > 0 then
                local oldest = redis.call('ZRANGE', KEYS[1], 0, excess - 1)
                for _, id in ipairs(oldest) do
                    table.insert(removed, id)
                end
                redis.call('ZREMRANGEBYRANK', KEYS[1], 0, excess - 1)
            end
        end
        for _, id in ipairs(removed) do
            redis.call('DEL', ARGV[3] .. id)
        end
        return #removed
        ",
    )
});

// KEYS: active, waiting, failed. ARGV: now, prefix, max stalled count, failed reason.
// Returns {requeued, failed}.
static REQUEUE_STALLED_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local stalled = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
        local requeued = 0
        local failed = 0
        for _, id in ipairs(stalled) do
            redis.call('ZREM', KEYS[1], id)
            local key = ARGV[2] .. id
            if redis.call('EXISTS', key) == 1 then
                redis.call('HDEL', key, 'lock_token')
                local count = redis.call('HINCRBY', key, 'stalled_count', 1)
                if count > tonumber(ARGV[3]) then
                    redis.call('ZADD', KEYS[3], ARGV[1], id)
                    redis.call('HSET', key, 'state', 'failed', 'failed_reason', ARGV[4], 'finished_at', ARGV[1])
                    failed = failed + 1
                else
                    local priority = math.min(tonumber(redis.call('HGET', key, 'priority') or '0'), 900)
                    local rank = priority * 10000000000000 + tonumber(ARGV[1])
                    redis.call('ZADD', KEYS[2], string.format('%.0f', rank), id)
                    redis.call('HSET', key, 'state', 'waiting')
                    requeued = requeued + 1
                end
            end
        end
        return {requeued, failed}
        ",
    )
});

struct QueueKeys {
    job_prefix: String,
    waiting: String,
    delayed: String,
    active: String,
    completed: String,
    failed: String,
}

impl QueueKeys {
    fn new(queue: &str) -> Self {
        let base = format!("jobs:{queue}");
        Self {
            job_prefix: format!("{base}:job:"),
            waiting: format!("{base}:waiting"),
            delayed: format!("{base}:delayed"),
            active: format!("{base}:active"),
            completed: format!("{base}:completed"),
            failed: format!("{base}:failed"),
        }
    }

    fn job(&self, id: &str) -> String {
        format!("{}{id}", self.job_prefix)
    }
}

/// Hash fields written when a job is created.
fn job_fields(job: &Job) -> Result<Vec<(&'static str, String)>, JobError> {
    let mut fields = vec![
        ("id", job.id.clone()),
        ("name", job.name.clone()),
        ("data", serde_json::to_string(&job.payload)?),
        ("state", job.state.as_str().to_string()),
        ("priority", job.priority.to_string()),
        ("attempts_made", job.attempts_made.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        ("stalled_count", job.stalled_count.to_string()),
        ("created_at", job.created_at.to_string()),
    ];
    if let Some(run_at) = job.run_at {
        fields.push(("run_at", run_at.to_string()));
    }
    Ok(fields)
}

fn job_from_hash(queue: &str, mut hash: HashMap<String, String>) -> Result<Job, JobError> {
    let id = hash.remove("id").unwrap_or_default();
    let corrupt = |what: &str| JobError::Corrupt(format!("{queue}/{id}"), what.to_string());

    let number = |hash: &HashMap<String, String>, field: &str| -> Option<i64> {
        hash.get(field).and_then(|v| v.parse().ok())
    };
    let json = |hash: &mut HashMap<String, String>, field: &str| -> Result<Option<Value>, JobError> {
        hash.remove(field)
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(JobError::from)
    };

    let state = hash
        .get("state")
        .and_then(|s| JobState::parse(s))
        .ok_or_else(|| corrupt("state"))?;
    let payload = json(&mut hash, "data")?.ok_or_else(|| corrupt("data"))?;
    let created_at = number(&hash, "created_at").ok_or_else(|| corrupt("created_at"))?;

    Ok(Job {
        queue: queue.to_string(),
        name: hash.remove("name").unwrap_or_default(),
        payload,
        state,
        priority: number(&hash, "priority").unwrap_or(0) as u32,
        attempts_made: number(&hash, "attempts_made").unwrap_or(0) as u32,
        max_attempts: number(&hash, "max_attempts").unwrap_or(1) as u32,
        stalled_count: number(&hash, "stalled_count").unwrap_or(0) as u32,
        lock_token: hash.remove("lock_token"),
        progress: json(&mut hash, "progress")?,
        result: json(&mut hash, "result")?,
        failed_reason: hash.remove("failed_reason"),
        created_at,
        run_at: number(&hash, "run_at"),
        processed_at: number(&hash, "processed_at"),
        finished_at: number(&hash, "finished_at"),
        id,
    })
}

#[derive(Clone)]
pub struct RedisJobStore {
    pool: Pool,
    command_timeout: Duration,
}

impl RedisJobStore {
    /// Share the cache's pool; queues and cache live in the same Redis.
    pub fn new(pool: Pool, command_timeout: Duration) -> Self {
        Self {
            pool,
            command_timeout,
        }
    }

    async fn conn(&self) -> Result<Connection, JobError> {
        self.pool
            .get()
            .await
            .map_err(|e| JobError::Pool(e.to_string()))
    }

    async fn bounded<T>(&self, command: impl Future<Output = RedisResult<T>>) -> Result<T, JobError> {
        match tokio::time::timeout(self.command_timeout, command).await {
            Ok(result) => result.map_err(JobError::from),
            Err(_) => Err(JobError::Pool(format!(
                "command timed out after {:?}",
                self.command_timeout
            ))),
        }
    }

    /// Move a job out of `active` into `target` and set fields, provided
    /// `token` still holds its claim.
    async fn transition(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        target: &str,
        score: i64,
        fields: &[(&str, String)],
    ) -> Result<(), JobError> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn().await?;
        let mut invocation = MOVE_SCRIPT.key(keys.job(id));
        invocation
            .key(&keys.active)
            .key(target)
            .arg(id)
            .arg(token)
            .arg(score);
        for (field, value) in fields {
            invocation.arg(*field).arg(value);
        }
        let moved: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        match moved {
            1 => Ok(()),
            0 => Err(JobError::NotFound {
                queue: queue.to_string(),
                id: id.to_string(),
            }),
            _ => Err(JobError::LeaseLost {
                queue: queue.to_string(),
                id: id.to_string(),
            }),
        }
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn add(&self, job: &Job) -> Result<bool, JobError> {
        let keys = QueueKeys::new(&job.queue);
        let score = match (job.state, job.run_at) {
            (JobState::Delayed, Some(run_at)) => run_at.max(0) as u64,
            _ => waiting_rank(job.priority, job.created_at),
        };
        let state = if job.state == JobState::Delayed && job.run_at.is_some() {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        let mut conn = self.conn().await?;
        let mut invocation = ADD_SCRIPT.key(keys.job(&job.id));
        invocation
            .key(&keys.waiting)
            .key(&keys.delayed)
            .arg(&job.id)
            .arg(state.as_str())
            .arg(score);
        for (field, value) in job_fields(job)? {
            let value = if field == "state" {
                state.as_str().to_string()
            } else {
                value
            };
            invocation.arg(field).arg(value);
        }
        let created: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(created == 1)
    }

    async fn get(&self, queue: &str, id: &str) -> Result<Option<Job>, JobError> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn().await?;
        let mut command = redis::cmd("HGETALL");
        command.arg(keys.job(id));
        let hash: HashMap<String, String> = self.bounded(command.query_async(&mut conn)).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        job_from_hash(queue, hash).map(Some)
    }

    async fn claim(&self, queue: &str, now: i64, lease: Duration) -> Result<Option<Job>, JobError> {
        let keys = QueueKeys::new(queue);
        let lease_until = now + lease.as_millis() as i64;
        let mut conn = self.conn().await?;
        let mut invocation = CLAIM_SCRIPT.key(&keys.waiting);
        invocation
            .key(&keys.delayed)
            .key(&keys.active)
            .arg(now)
            .arg(lease_until)
            .arg(&keys.job_prefix)
            .arg(uuid::Uuid::new_v4().to_string());
        let claimed: Option<HashMap<String, String>> =
            self.bounded(invocation.invoke_async(&mut conn)).await?;
        claimed
            .filter(|hash| !hash.is_empty())
            .map(|hash| job_from_hash(queue, hash))
            .transpose()
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &str,
        progress: &Value,
    ) -> Result<(), JobError> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn().await?;
        let mut invocation = PROGRESS_SCRIPT.key(keys.job(id));
        invocation.arg(serde_json::to_string(progress)?);
        let updated: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        if updated == 0 {
            return Err(JobError::NotFound {
                queue: queue.to_string(),
                id: id.to_string(),
            });
        }
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
        let keys = QueueKeys::new(queue);
        self.transition(
            queue,
            id,
            token,
            &keys.completed,
            now,
            &[
                ("state", JobState::Completed.as_str().to_string()),
                ("result", serde_json::to_string(result)?),
                ("finished_at", now.to_string()),
            ],
        )
        .await
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
        let keys = QueueKeys::new(queue);
        self.transition(
            queue,
            id,
            token,
            &keys.delayed,
            run_at,
            &[
                ("state", JobState::Delayed.as_str().to_string()),
                ("attempts_made", attempts_made.to_string()),
                ("failed_reason", reason.to_string()),
                ("run_at", run_at.to_string()),
            ],
        )
        .await
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
        let keys = QueueKeys::new(queue);
        self.transition(
            queue,
            id,
            token,
            &keys.failed,
            now,
            &[
                ("state", JobState::Failed.as_str().to_string()),
                ("attempts_made", attempts_made.to_string()),
                ("failed_reason", reason.to_string()),
                ("finished_at", now.to_string()),
            ],
        )
        .await
    }

    async fn prune(
        &self,
        queue: &str,
        state: JobState,
        retention: &Retention,
        now: i64,
    ) -> Result<u64, JobError> {
        let keys = QueueKeys::new(queue);
        let set = match state {
            JobState::Completed => &keys.completed,
            JobState::Failed => &keys.failed,
            _ => return Ok(0),
        };
        let cutoff = retention.cutoff(now).unwrap_or(-1);
        let max_count = retention.max_count.map(|c| c as i64).unwrap_or(-1);

        let mut conn = self.conn().await?;
        let mut invocation = PRUNE_SCRIPT.key(set);
        invocation.arg(cutoff).arg(max_count).arg(&keys.job_prefix);
        let removed: u64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(removed)
    }

    async fn requeue_stalled(
        &self,
        queue: &str,
        now: i64,
        max_stalled: u32,
    ) -> Result<StalledJobs, JobError> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn().await?;
        let mut invocation = REQUEUE_STALLED_SCRIPT.key(&keys.active);
        invocation
            .key(&keys.waiting)
            .key(&keys.failed)
            .arg(now)
            .arg(&keys.job_prefix)
            .arg(max_stalled)
            .arg(STALLED_REASON);
        let (requeued, failed): (u64, u64) =
            self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(StalledJobs { requeued, failed })
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, JobError> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.zcard(&keys.waiting)
            .zcard(&keys.delayed)
            .zcard(&keys.active)
            .zcard(&keys.completed)
            .zcard(&keys.failed);
        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) =
            self.bounded(pipe.query_async(&mut conn)).await?;
        Ok(JobCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_roundtrip() {
        let job = Job {
            id: "evt-42".into(),
            queue: "enrollment-processing".into(),
            name: "enrollment.completed".into(),
            payload: json!({"eventId": "evt-42", "n": 12345678901234567u64}),
            state: JobState::Waiting,
            priority: 1,
            attempts_made: 0,
            max_attempts: 3,
            stalled_count: 0,
            lock_token: None,
            progress: None,
            result: None,
            failed_reason: None,
            created_at: 1_767_084_657_058,
            run_at: None,
            processed_at: None,
            finished_at: None,
        };
        let hash: HashMap<String, String> = job_fields(&job)
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(job_from_hash("enrollment-processing", hash).unwrap(), job);
    }

    #[test]
    fn test_corrupt_hash_is_reported() {
        let hash = HashMap::from([("id".to_string(), "x".to_string())]);
        let err = job_from_hash("q", hash).unwrap_err();
        assert!(matches!(err, JobError::Corrupt(..)));
    }
}
