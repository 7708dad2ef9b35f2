//! Redis-backed job broker.
//!
//! Per queue, under the hash tag `{prefix:queue}` so a queue never spans slots:
//!
//! - `…:id`         job id counter
//! - `…:job:<id>`   job hash (`data`, `priority`, `attempts_made`, …)
//! - `…:wait`       ready jobs, scored by priority weight then id
//! - `…:delayed`    parked jobs, scored by ready time (ms)
//! - `…:active`     leased jobs, scored by lease deadline (ms); a job whose
//!   lease expires more than `max_stalled` times is moved to `failed`
//! - `…:completed`  / `…:failed` finished jobs, scored by finish time (ms)
//! - `…:paused`     present while the queue is paused
//!
//! Every state transition is a single Lua script, so a job is never in two
//! sets at once and two consumers never lease the same job.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use beacon_common::error::AppError;

use crate::broker::{FinishedState, JobBroker, QueueCounts, QueueName, RawClaim, RawJob};

const ENQUEUE_SCRIPT: &str = r#"
local id = redis.call('INCR', KEYS[1])
local jobkey = ARGV[1] .. id
redis.call('HSET', jobkey, 'data', ARGV[2], 'priority', ARGV[3], 'attempts_made', 0, 'created_at', ARGV[5])
local delay = tonumber(ARGV[4])
if delay > 0 then
  redis.call('ZADD', KEYS[3], tonumber(ARGV[5]) + delay, id)
else
  redis.call('ZADD', KEYS[2], (100 - tonumber(ARGV[3])) * 1e10 + id, id)
end
return id
"#;

const CLAIM_SCRIPT: &str = r#"
local now = tonumber(ARGV[2])
local function wait_score(id)
  local priority = tonumber(redis.call('HGET', ARGV[1] .. id, 'priority') or '0')
  return (100 - priority) * 1e10 + tonumber(id)
end
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('ZADD', KEYS[1], wait_score(id), id)
end
local stalled = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)
local requeued = 0
local dead = 0
for _, id in ipairs(stalled) do
  redis.call('ZREM', KEYS[3], id)
  local count = redis.call('HINCRBY', ARGV[1] .. id, 'stalled_count', 1)
  if count > tonumber(ARGV[4]) then
    redis.call('ZADD', KEYS[5], now, id)
    redis.call('HSET', ARGV[1] .. id, 'failed_reason', 'job stalled more than the allowed limit', 'finished_at', now)
    dead = dead + 1
  else
    redis.call('ZADD', KEYS[1], wait_score(id), id)
    requeued = requeued + 1
  end
end
if redis.call('EXISTS', KEYS[4]) == 1 then
  return {tostring(requeued), '', '', '0', tostring(dead)}
end
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return {tostring(requeued), '', '', '0', tostring(dead)}
end
local id = popped[1]
redis.call('ZADD', KEYS[3], now + tonumber(ARGV[3]), id)
local job = redis.call('HMGET', ARGV[1] .. id, 'data', 'attempts_made')
return {tostring(requeued), id, job[1] or '', job[2] or '0', tostring(dead)}
"#;

const COMPLETE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[2]) == 0 then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
redis.call('HSET', ARGV[1], 'finished_at', ARGV[3])
return 1
"#;

const FAIL_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[2]) == 0 then
  return -1
end
local attempts = redis.call('HINCRBY', ARGV[1], 'attempts_made', 1)
redis.call('HSET', ARGV[1], 'failed_reason', ARGV[4])
local retry = tonumber(ARGV[5])
if retry >= 0 then
  redis.call('ZADD', KEYS[2], tonumber(ARGV[3]) + retry, ARGV[2])
else
  redis.call('ZADD', KEYS[3], ARGV[3], ARGV[2])
  redis.call('HSET', ARGV[1], 'finished_at', ARGV[3])
end
return attempts
"#;

const CLEAN_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
for _, id in ipairs(ids) do
  redis.call('DEL', ARGV[1] .. id)
end
if #ids > 0 then
  redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
end
return #ids
"#;

const RELEASE_LEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Lease expiries a job survives before it is moved to `failed`.
pub const DEFAULT_MAX_STALLED: u32 = 3;

/// Redis job broker.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    prefix: String,
    max_stalled: u32,
    enqueue: Script,
    claim: Script,
    complete: Script,
    fail: Script,
    clean: Script,
    release_lease: Script,
}

impl RedisBroker {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            max_stalled: DEFAULT_MAX_STALLED,
            enqueue: Script::new(ENQUEUE_SCRIPT),
            claim: Script::new(CLAIM_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
            fail: Script::new(FAIL_SCRIPT),
            clean: Script::new(CLEAN_SCRIPT),
            release_lease: Script::new(RELEASE_LEASE_SCRIPT),
        }
    }

    pub fn with_max_stalled(mut self, max_stalled: u32) -> Self {
        self.max_stalled = max_stalled;
        self
    }

    fn key(&self, queue: QueueName, suffix: &str) -> String {
        queue_key(&self.prefix, queue, suffix)
    }

    fn job_prefix(&self, queue: QueueName) -> String {
        self.key(queue, "job:")
    }

    fn job_key(&self, queue: QueueName, job_id: u64) -> String {
        format!("{}{}", self.job_prefix(queue), job_id)
    }

    fn lease_key(&self, key: &str) -> String {
        format!("{}:lease:{}", self.prefix, key)
    }
}

/// `{prefix:queue}:suffix`; the braces form the cluster hash tag.
fn queue_key(prefix: &str, queue: QueueName, suffix: &str) -> String {
    format!("{{{}:{}}}:{}", prefix, queue, suffix)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl JobBroker for RedisBroker {
    async fn enqueue(
        &self,
        queue: QueueName,
        data: &str,
        priority: u32,
        delay: Duration,
    ) -> Result<u64, AppError> {
        let mut conn = self.conn.clone();
        let id: u64 = self
            .enqueue
            .key(self.key(queue, "id"))
            .key(self.key(queue, "wait"))
            .key(self.key(queue, "delayed"))
            .arg(self.job_prefix(queue))
            .arg(data)
            .arg(priority.min(99))
            .arg(delay.as_millis() as u64)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(id)
    }

    async fn claim(&self, queue: QueueName, lease: Duration) -> Result<RawClaim, AppError> {
        let mut conn = self.conn.clone();
        let reply: Vec<String> = self
            .claim
            .key(self.key(queue, "wait"))
            .key(self.key(queue, "delayed"))
            .key(self.key(queue, "active"))
            .key(self.key(queue, "paused"))
            .key(self.key(queue, "failed"))
            .arg(self.job_prefix(queue))
            .arg(now_ms())
            .arg(lease.as_millis() as u64)
            .arg(self.max_stalled)
            .invoke_async(&mut conn)
            .await?;

        let [stalled, id, data, attempts, dead] = reply.as_slice() else {
            return Err(AppError::Internal(format!(
                "unexpected claim reply from queue {}: {:?}",
                queue, reply
            )));
        };

        let requeued_stalled = stalled.parse().unwrap_or(0);
        let dead: u64 = dead.parse().unwrap_or(0);
        if dead > 0 {
            tracing::error!(
                queue = %queue,
                count = dead,
                max_stalled = self.max_stalled,
                "Jobs exceeded the stalled limit and were moved to failed"
            );
        }
        if id.is_empty() {
            return Ok(RawClaim {
                job: None,
                requeued_stalled,
            });
        }

        let id = id
            .parse()
            .map_err(|_| AppError::Internal(format!("invalid job id '{}' in queue {}", id, queue)))?;

        Ok(RawClaim {
            job: Some(RawJob {
                id,
                data: data.clone(),
                attempts_made: attempts.parse().unwrap_or(0),
            }),
            requeued_stalled,
        })
    }

    async fn complete(&self, queue: QueueName, job_id: u64) -> Result<bool, AppError> {
        let mut conn = self.conn.clone();
        let acked: i64 = self
            .complete
            .key(self.key(queue, "active"))
            .key(self.key(queue, "completed"))
            .arg(self.job_key(queue, job_id))
            .arg(job_id)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(acked == 1)
    }

    async fn fail(
        &self,
        queue: QueueName,
        job_id: u64,
        reason: &str,
        retry_after: Option<Duration>,
    ) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let retry_ms = retry_after.map(|d| d.as_millis() as i64).unwrap_or(-1);
        let attempts: i64 = self
            .fail
            .key(self.key(queue, "active"))
            .key(self.key(queue, "delayed"))
            .key(self.key(queue, "failed"))
            .arg(self.job_key(queue, job_id))
            .arg(job_id)
            .arg(now_ms())
            .arg(reason)
            .arg(retry_ms)
            .invoke_async(&mut conn)
            .await?;

        if attempts < 0 {
            tracing::warn!(queue = %queue, job_id, "Failed job was no longer leased");
        }
        Ok(())
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, AppError> {
        let mut conn = self.conn.clone();
        let (waiting, active, completed, failed, delayed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .zcard(self.key(queue, "wait"))
                .zcard(self.key(queue, "active"))
                .zcard(self.key(queue, "completed"))
                .zcard(self.key(queue, "failed"))
                .zcard(self.key(queue, "delayed"))
                .query_async(&mut conn)
                .await?;

        Ok(QueueCounts {
            waiting,
            active,
            completed,
            failed,
            delayed,
        })
    }

    async fn pause(&self, queue: QueueName) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.key(queue, "paused"), 1).await?;
        Ok(())
    }

    async fn resume(&self, queue: QueueName) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.key(queue, "paused")).await?;
        Ok(())
    }

    async fn clean(
        &self,
        queue: QueueName,
        state: FinishedState,
        older_than: Duration,
    ) -> Result<u64, AppError> {
        let set = match state {
            FinishedState::Completed => "completed",
            FinishedState::Failed => "failed",
        };
        let cutoff = now_ms() - older_than.as_millis() as i64;

        let mut conn = self.conn.clone();
        let removed: u64 = self
            .clean
            .key(self.key(queue, set))
            .arg(self.job_prefix(queue))
            .arg(cutoff)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn try_lease(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, AppError> {
        let mut conn = self.conn.clone();

        // SET key owner NX PX ttl: Some("OK") if acquired, None if already held
        let result: Option<String> = redis::cmd("SET")
            .arg(self.lease_key(key))
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;

        Ok(result.is_some())
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool, AppError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .release_lease
            .key(self.lease_key(key))
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }
}
