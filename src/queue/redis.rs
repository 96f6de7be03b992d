//! Redis-based job queue with atomic unique-enqueue and claim.
//!
//! # Key layout
//!
//! Every queue lives under `{prefix}:{queue}`:
//!
//! - `:jobs`: HASH id → job JSON
//! - `:state`: HASH id → `waiting` | `delayed` | `active` | `completed` | `failed`
//! - `:score`: HASH id → waiting score, `priority * 1e13 + run_at_ms`
//! - `:waiting`: ZSET scored by the waiting score
//! - `:delayed`: ZSET scored by `run_at_ms`
//! - `:active`: ZSET scored by lock expiry in ms
//! - `:finished`: ZSET of completed and failed ids scored by finish time in ms
//! - `:dead_letter`: LIST of dead-letter entries, newest at the head
//!
//! Scores are computed client-side and stored as strings; scripts copy them
//! without doing arithmetic on Lua numbers.
//!
//! # Reliability
//!
//! The identity check and the insert happen inside one Lua script, so two
//! trigger paths enqueueing the same job at the same moment cannot both
//! create it. Claims move a job to `:active` with a lock expiry; if the worker
//! dies, the stalled sweep returns the job to `:waiting`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::debug;
use uuid::Uuid;

use super::backend::{EnqueueOutcome, JobQueue, QueueCounts, QueueError, StalledRecovery};
use super::dead_letter::{DeadLetterEntry, RetentionPolicy};
use super::job::{Job, JobId, JobRecord, JobState};
use crate::model::QueueKind;
use crate::scheduler::timing::to_chrono;

/// Weight separating priority bands in the waiting set. Larger than any
/// millisecond timestamp this code will see.
const PRIORITY_WEIGHT: f64 = 1e13;

const ENQUEUE_UNIQUE_LUA: &str = r#"
local current = redis.call('HGET', KEYS[2], ARGV[1])
if current == 'waiting' or current == 'delayed' or current == 'active' then
  return 'skipped:' .. current
end
redis.call('ZREM', KEYS[4], ARGV[1])
redis.call('ZREM', KEYS[5], ARGV[1])
redis.call('ZREM', KEYS[6], ARGV[1])
redis.call('ZREM', KEYS[7], ARGV[1])
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[4])
if ARGV[3] == 'delayed' then
  redis.call('ZADD', KEYS[5], ARGV[5], ARGV[1])
else
  redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
end
if current then
  return 'replaced'
end
return 'created'
"#;

const CLAIM_LUA: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[5], '-inf', ARGV[1])
for _, id in ipairs(due) do
  local score = redis.call('HGET', KEYS[3], id) or redis.call('ZSCORE', KEYS[5], id)
  redis.call('ZREM', KEYS[5], id)
  redis.call('ZADD', KEYS[4], score, id)
  redis.call('HSET', KEYS[2], id, 'waiting')
end
local next = redis.call('ZRANGE', KEYS[4], 0, 0)
if #next == 0 then
  return false
end
local id = next[1]
redis.call('ZREM', KEYS[4], id)
redis.call('ZADD', KEYS[6], ARGV[2], id)
redis.call('HSET', KEYS[2], id, 'active')
return redis.call('HGET', KEYS[1], id)
"#;

const RECLAIM_STALLED_LUA: &str = r#"
local lock = redis.call('ZSCORE', KEYS[6], ARGV[1])
if not lock or tonumber(lock) > tonumber(ARGV[2]) then
  return 0
end
if redis.call('HGET', KEYS[2], ARGV[1]) ~= 'active' then
  return 0
end
redis.call('ZREM', KEYS[6], ARGV[1])
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[4])
if ARGV[4] == 'waiting' then
  redis.call('HSET', KEYS[3], ARGV[1], ARGV[5])
  redis.call('ZADD', KEYS[4], ARGV[5], ARGV[1])
else
  redis.call('ZADD', KEYS[7], ARGV[2], ARGV[1])
end
return 1
"#;

// ARGV[1] is the age cutoff in ms, ARGV[2] the count to keep
const PRUNE_FINISHED_LUA: &str = r#"
local function drop(id)
  local state = redis.call('HGET', KEYS[2], id)
  if state == 'completed' or state == 'failed' then
    redis.call('HDEL', KEYS[1], id)
    redis.call('HDEL', KEYS[2], id)
    redis.call('HDEL', KEYS[3], id)
  end
  redis.call('ZREM', KEYS[7], id)
end
local removed = 0
for _, id in ipairs(redis.call('ZRANGEBYSCORE', KEYS[7], '-inf', '(' .. ARGV[1])) do
  drop(id)
  removed = removed + 1
end
local excess = redis.call('ZCARD', KEYS[7]) - tonumber(ARGV[2])
if excess > 0 then
  for _, id in ipairs(redis.call('ZRANGE', KEYS[7], 0, excess - 1)) do
    drop(id)
    removed = removed + 1
  end
end
return removed
"#;

/// Redis key names of one queue.
#[derive(Debug, Clone)]
struct Keys {
    jobs: String,
    state: String,
    score: String,
    waiting: String,
    delayed: String,
    active: String,
    finished: String,
    dead_letter: String,
}

impl Keys {
    fn new(prefix: &str, kind: QueueKind) -> Self {
        let ns = format!("{}:{}", prefix, kind.as_str());
        Self {
            jobs: format!("{}:jobs", ns),
            state: format!("{}:state", ns),
            score: format!("{}:score", ns),
            waiting: format!("{}:waiting", ns),
            delayed: format!("{}:delayed", ns),
            active: format!("{}:active", ns),
            finished: format!("{}:finished", ns),
            dead_letter: format!("{}:dead_letter", ns),
        }
    }

    /// Key order expected by every script.
    fn script_keys(&self) -> [&str; 7] {
        [
            &self.jobs,
            &self.state,
            &self.score,
            &self.waiting,
            &self.delayed,
            &self.active,
            &self.finished,
        ]
    }
}

fn waiting_score(priority: i32, at: DateTime<Utc>) -> f64 {
    priority as f64 * PRIORITY_WEIGHT + at.timestamp_millis() as f64
}

/// Queue stored in Redis.
///
/// The connection manager reconnects on its own; cloning it is cheap.
pub struct RedisQueue {
    redis: ConnectionManager,
    kind: QueueKind,
    keys: Keys,
    enqueue_script: Script,
    claim_script: Script,
    reclaim_script: Script,
    prune_script: Script,
    finished_retention: RetentionPolicy,
}

impl RedisQueue {
    /// Connects to Redis and opens one queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, prefix: &str, kind: QueueKind) -> Result<Self, QueueError> {
        let redis = connect_manager(redis_url).await?;
        Ok(Self::from_connection(redis, prefix, kind))
    }

    /// Opens a queue on an existing connection manager.
    ///
    /// Useful when all six queues share one connection.
    pub fn from_connection(redis: ConnectionManager, prefix: &str, kind: QueueKind) -> Self {
        Self {
            redis,
            kind,
            keys: Keys::new(prefix, kind),
            enqueue_script: Script::new(ENQUEUE_UNIQUE_LUA),
            claim_script: Script::new(CLAIM_LUA),
            reclaim_script: Script::new(RECLAIM_STALLED_LUA),
            prune_script: Script::new(PRUNE_FINISHED_LUA),
            finished_retention: RetentionPolicy::finished_jobs(),
        }
    }

    /// Sets how many completed and failed records are kept.
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.finished_retention = retention;
        self
    }

    fn invocation<'a>(&'a self, script: &'a Script) -> redis::ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        for key in self.keys.script_keys() {
            invocation.key(key);
        }
        invocation
    }

    async fn update_finished(
        &self,
        job: &Job,
        state: JobState,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let serialized = serde_json::to_string(job)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&self.keys.jobs, job.id.as_str(), serialized)
            .ignore()
            .hset(&self.keys.state, job.id.as_str(), state.as_str())
            .ignore()
            .zrem(&self.keys.active, job.id.as_str())
            .ignore()
            .zadd(&self.keys.finished, job.id.as_str(), now.timestamp_millis())
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        self.prune_finished(now).await
    }

    /// Drops completed and failed records outside the retention bounds.
    async fn prune_finished(&self, now: DateTime<Utc>) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let cutoff = now - to_chrono(self.finished_retention.max_age);

        let removed: usize = self
            .invocation(&self.prune_script)
            .arg(cutoff.timestamp_millis())
            .arg(self.finished_retention.max_count)
            .invoke_async(&mut conn)
            .await?;
        if removed > 0 {
            debug!(queue = %self.kind, removed, "Pruned finished job records");
        }
        Ok(())
    }

    /// Drops dead-letter entries older than the retention age from the tail.
    async fn prune_expired_dead_letters(
        &self,
        retention: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        loop {
            let oldest: Option<String> = conn.lindex(&self.keys.dead_letter, -1).await?;
            let Some(raw) = oldest else {
                return Ok(());
            };
            let expired = match serde_json::from_str::<DeadLetterEntry>(&raw) {
                Ok(entry) => retention.is_expired(entry.failed_at, now),
                // Unreadable entries cannot be replayed anyway.
                Err(_) => true,
            };
            if !expired {
                return Ok(());
            }
            conn.lrem::<_, _, ()>(&self.keys.dead_letter, -1, &raw).await?;
        }
    }
}

/// Opens a connection manager for `redis_url`.
pub async fn connect_manager(redis_url: &str) -> Result<ConnectionManager, QueueError> {
    let client =
        redis::Client::open(redis_url).map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

    ConnectionManager::new(client)
        .await
        .map_err(|e| QueueError::ConnectionFailed(e.to_string()))
}

#[async_trait]
impl JobQueue for RedisQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    async fn enqueue_unique(&self, job: Job, now: DateTime<Utc>) -> Result<EnqueueOutcome, QueueError> {
        let mut conn = self.redis.clone();
        let serialized = serde_json::to_string(&job)?;
        let state = if job.run_at > now {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        let reply: String = self
            .invocation(&self.enqueue_script)
            .arg(job.id.as_str())
            .arg(serialized)
            .arg(state.as_str())
            .arg(waiting_score(job.priority, job.run_at))
            .arg(job.run_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        match reply.as_str() {
            "created" => Ok(EnqueueOutcome::Created),
            "replaced" => Ok(EnqueueOutcome::Replaced),
            other => other
                .strip_prefix("skipped:")
                .and_then(JobState::parse)
                .map(EnqueueOutcome::Skipped)
                .ok_or_else(|| QueueError::UnexpectedReply(other.to_string())),
        }
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, QueueError> {
        let mut conn = self.redis.clone();
        let (raw, state, lock): (Option<String>, Option<String>, Option<f64>) = redis::pipe()
            .hget(&self.keys.jobs, id.as_str())
            .hget(&self.keys.state, id.as_str())
            .zscore(&self.keys.active, id.as_str())
            .query_async(&mut conn)
            .await?;

        let (Some(raw), Some(state)) = (raw, state) else {
            return Ok(None);
        };
        let state = JobState::parse(&state).ok_or(QueueError::UnexpectedReply(state))?;
        let locked_until = lock
            .filter(|_| state == JobState::Active)
            .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms as i64));

        Ok(Some(JobRecord {
            job: serde_json::from_str(&raw)?,
            state,
            locked_until,
        }))
    }

    async fn remove(&self, id: &JobId) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let (removed,): (usize,) = redis::pipe()
            .atomic()
            .hdel(&self.keys.jobs, id.as_str())
            .hdel(&self.keys.state, id.as_str())
            .ignore()
            .hdel(&self.keys.score, id.as_str())
            .ignore()
            .zrem(&self.keys.waiting, id.as_str())
            .ignore()
            .zrem(&self.keys.delayed, id.as_str())
            .ignore()
            .zrem(&self.keys.active, id.as_str())
            .ignore()
            .zrem(&self.keys.finished, id.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn claim(&self, now: DateTime<Utc>, lock_for: Duration) -> Result<Option<Job>, QueueError> {
        let mut conn = self.redis.clone();
        let lock_until = now + to_chrono(lock_for);

        let raw: Option<String> = self
            .invocation(&self.claim_script)
            .arg(now.timestamp_millis())
            .arg(lock_until.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        match raw {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn complete(&self, job: &Job, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.update_finished(job, JobState::Completed, now).await
    }

    async fn retry_later(&self, job: &Job, now: DateTime<Utc>) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let serialized = serde_json::to_string(job)?;
        let id = job.id.as_str();
        let score = waiting_score(job.priority, job.run_at);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&self.keys.jobs, id, serialized)
            .ignore()
            .hset(&self.keys.score, id, score)
            .ignore()
            .zrem(&self.keys.active, id)
            .ignore();
        if job.run_at > now {
            pipe.hset(&self.keys.state, id, JobState::Delayed.as_str())
                .ignore()
                .zadd(&self.keys.delayed, id, job.run_at.timestamp_millis())
                .ignore();
        } else {
            pipe.hset(&self.keys.state, id, JobState::Waiting.as_str())
                .ignore()
                .zadd(&self.keys.waiting, id, score)
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn fail(&self, job: &Job, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.update_finished(job, JobState::Failed, now).await
    }

    async fn recover_stalled(
        &self,
        now: DateTime<Utc>,
        max_stalled: u32,
    ) -> Result<StalledRecovery, QueueError> {
        let mut conn = self.redis.clone();
        let now_ms = now.timestamp_millis();
        let expired: Vec<String> = conn
            .zrangebyscore(&self.keys.active, "-inf", now_ms)
            .await?;

        let mut recovery = StalledRecovery::default();
        for id in expired {
            let raw: Option<String> = conn.hget(&self.keys.jobs, &id).await?;
            let Some(raw) = raw else {
                continue;
            };
            let mut job: Job = serde_json::from_str(&raw)?;
            job.stalled_count += 1;

            let exhausted = job.stalled_count > max_stalled;
            let next_state = if exhausted {
                job.last_error = Some(format!(
                    "job stalled {} times (limit {})",
                    job.stalled_count, max_stalled
                ));
                JobState::Failed
            } else {
                JobState::Waiting
            };

            let reclaimed: i32 = self
                .invocation(&self.reclaim_script)
                .arg(&id)
                .arg(now_ms)
                .arg(serde_json::to_string(&job)?)
                .arg(next_state.as_str())
                .arg(waiting_score(job.priority, now))
                .invoke_async(&mut conn)
                .await?;

            // Zero means another worker finished or reclaimed the job first.
            if reclaimed == 0 {
                continue;
            }
            if exhausted {
                recovery.exhausted.push(job);
            } else {
                recovery.requeued += 1;
            }
        }

        Ok(recovery)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut conn = self.redis.clone();
        let states: Vec<String> = conn.hvals(&self.keys.state).await?;
        let dead_letter: usize = conn.llen(&self.keys.dead_letter).await?;

        let mut counts = QueueCounts {
            dead_letter,
            ..QueueCounts::default()
        };
        for state in states.iter().filter_map(|s| JobState::parse(s)) {
            counts.add(state);
        }
        Ok(counts)
    }

    async fn push_dead_letter(
        &self,
        entry: DeadLetterEntry,
        retention: &RetentionPolicy,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let now = entry.failed_at.max(Utc::now());
        let serialized = serde_json::to_string(&entry)?;
        let keep = retention.max_count.max(1) as isize;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(&self.keys.dead_letter, serialized)
            .ignore()
            .ltrim(&self.keys.dead_letter, 0, keep - 1)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        self.prune_expired_dead_letters(retention, now).await
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(&self.keys.dead_letter, 0, limit as isize - 1)
            .await?;

        let entries: Result<Vec<DeadLetterEntry>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();
        Ok(entries?)
    }

    async fn dead_letter(&self, entry_id: Uuid) -> Result<Option<DeadLetterEntry>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn.lrange(&self.keys.dead_letter, 0, -1).await?;

        Ok(data
            .iter()
            .filter_map(|raw| serde_json::from_str::<DeadLetterEntry>(raw).ok())
            .find(|entry| entry.entry_id == entry_id))
    }

    async fn take_dead_letter(&self, entry_id: Uuid) -> Result<Option<DeadLetterEntry>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn.lrange(&self.keys.dead_letter, 0, -1).await?;

        for raw in data {
            if let Ok(entry) = serde_json::from_str::<DeadLetterEntry>(&raw) {
                if entry.entry_id == entry_id {
                    let removed: usize = conn.lrem(&self.keys.dead_letter, 1, &raw).await?;
                    // Lost a race with another operator.
                    if removed == 0 {
                        return Ok(None);
                    }
                    return Ok(Some(entry));
                }
            }
        }

        Ok(None)
    }

    async fn purge_dead_letters(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let (len,): (usize,) = redis::pipe()
            .atomic()
            .llen(&self.keys.dead_letter)
            .del(&self.keys.dead_letter)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }
}
