//! Redis-backed queue engine.
//!
//! ## Key layout
//!
//! Every key is prefixed with `{prefix}:{queue}`:
//!
//! - `:id` counter (INCR/INCRBY) used for job ids
//! - `:job:{id}` JSON record holding the job snapshot
//! - `:state` hash of job id to state; a job exists iff it has a field here
//! - `:wait` list of waiting ids (RPUSH side is the tail)
//! - `:active` list of claimed ids
//! - `:delayed` sorted set scored by visibility time (ms)
//! - `:completed` / `:failed` sorted sets scored by finish time (ms)
//! - `:repeat` hash of repeat rules, `:repeat:pending` hash of the rule's
//!   currently scheduled job id
//!
//! ## Atomicity
//!
//! Every transition that reads a state and then writes depending on it runs
//! as a Lua script, so it is atomic on the server: promotion plus claim,
//! removal, settling, and record updates. Submissions reserve their ids up
//! front and write every job of a batch in a single MULTI/EXEC.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::Script;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use jobkeeper_core::{Job, JobId, JobState, KeepJobs, NewJob};
use jobkeeper_engine::{EngineError, EngineResult, QueueEngine};

use super::retention::jobs_to_prune;
use super::schedule::{next_occurrence, repeat_key};

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "jobkeeper";

/// Promote due delayed jobs, then move the oldest waiting job to `active`.
///
/// KEYS: delayed, wait, active, state. ARGV: now (ms), job key prefix.
/// Returns `{id, record}` or nil.
static CLAIM_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[1], id)
  if redis.call('HGET', KEYS[4], id) == 'delayed' then
    redis.call('HSET', KEYS[4], id, 'waiting')
    redis.call('RPUSH', KEYS[2], id)
  end
end
while true do
  local id = redis.call('LMOVE', KEYS[2], KEYS[3], 'LEFT', 'RIGHT')
  if not id then
    return false
  end
  if redis.call('HGET', KEYS[4], id) == 'waiting' then
    local raw = redis.call('GET', ARGV[2] .. id)
    if raw then
      redis.call('HSET', KEYS[4], id, 'active')
      return {id, raw}
    end
    redis.call('HDEL', KEYS[4], id)
  end
  redis.call('LREM', KEYS[3], 0, id)
end
",
    )
});

/// Delete a job unless a worker holds it.
///
/// KEYS: state, job, wait, delayed, completed, failed. ARGV: id.
/// Returns 1 when removed, 0 when missing, -1 when active.
static REMOVE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local state = redis.call('HGET', KEYS[1], ARGV[1])
if not state then
  return 0
end
if state == 'active' then
  return -1
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('DEL', KEYS[2])
redis.call('LREM', KEYS[3], 0, ARGV[1])
redis.call('ZREM', KEYS[4], ARGV[1])
redis.call('ZREM', KEYS[5], ARGV[1])
redis.call('ZREM', KEYS[6], ARGV[1])
return 1
",
    )
});

/// Move an active job out of `active`: back to `wait`, into a finished set,
/// or out of the queue entirely.
///
/// KEYS: state, active, job, target. ARGV: id, mode, next state, record, score.
/// Returns 0 when the job is no longer active.
static SETTLE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('HGET', KEYS[1], ARGV[1]) ~= 'active' then
  return 0
end
redis.call('LREM', KEYS[2], 0, ARGV[1])
if ARGV[2] == 'drop' then
  redis.call('HDEL', KEYS[1], ARGV[1])
  redis.call('DEL', KEYS[3])
  return 1
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
redis.call('SET', KEYS[3], ARGV[4])
if ARGV[2] == 'retry' then
  redis.call('RPUSH', KEYS[4], ARGV[1])
else
  redis.call('ZADD', KEYS[4], ARGV[5], ARGV[1])
end
return 1
",
    )
});

/// Overwrite a job record only if the job still exists, optionally only in
/// a given state.
///
/// KEYS: state, job. ARGV: id, expected state (empty for any), record.
static SAVE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local state = redis.call('HGET', KEYS[1], ARGV[1])
if not state then
  return 0
end
if ARGV[2] ~= '' and state ~= ARGV[2] then
  return 0
end
redis.call('SET', KEYS[2], ARGV[3])
return 1
",
    )
});

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobRecord {
    #[serde(default)]
    repeat_key: Option<String>,
    job: Job,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RepeatRule {
    pattern: String,
    request: NewJob,
}

/// How an active job leaves the `active` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    Retry,
    Finish,
    Drop,
}

impl Settle {
    fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Finish => "finish",
            Self::Drop => "drop",
        }
    }
}

/// One submission after repeat dedupe.
enum Planned {
    Insert {
        request: NewJob,
        repeat: Option<(String, RepeatRule)>,
    },
    Existing(Job),
    /// Same repeat rule as an earlier item of the batch.
    SameAs(usize),
}

fn is_transport_error(e: &redis::RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

fn redis_err(op: &str) -> impl Fn(redis::RedisError) -> EngineError + '_ {
    move |e| {
        if is_transport_error(&e) {
            EngineError::Connection(format!("{op} failed: {e}"))
        } else {
            EngineError::Command(format!("{op} failed: {e}"))
        }
    }
}

fn encode<T: Serialize>(value: &T) -> EngineResult<String> {
    serde_json::to_string(value).map_err(|e| EngineError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(raw: &str) -> EngineResult<T> {
    serde_json::from_str(raw).map_err(|e| EngineError::Deserialization(e.to_string()))
}

fn parse_state(raw: Option<String>) -> JobState {
    raw.map_or(JobState::Unknown, |s| s.parse().unwrap_or(JobState::Unknown))
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: f64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms as i64).single().unwrap_or_else(Utc::now)
}

/// Numeric ordering of counter ids; newest first.
fn sort_newest_first(records: &mut [JobRecord]) {
    records.sort_by_key(|r| std::cmp::Reverse(r.job.id.as_str().parse::<u64>().unwrap_or(0)));
}

#[derive(Debug, Clone)]
struct Keys {
    base: String,
}

impl Keys {
    fn new(prefix: &str, queue: &str) -> Self {
        Self {
            base: format!("{prefix}:{queue}"),
        }
    }

    fn id(&self) -> String {
        format!("{}:id", self.base)
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.base)
    }

    fn job(&self, id: &JobId) -> String {
        format!("{}{}", self.job_prefix(), id)
    }

    fn state(&self) -> String {
        format!("{}:state", self.base)
    }

    fn wait(&self) -> String {
        format!("{}:wait", self.base)
    }

    fn active(&self) -> String {
        format!("{}:active", self.base)
    }

    fn delayed(&self) -> String {
        format!("{}:delayed", self.base)
    }

    fn completed(&self) -> String {
        format!("{}:completed", self.base)
    }

    fn failed(&self) -> String {
        format!("{}:failed", self.base)
    }

    fn repeat(&self) -> String {
        format!("{}:repeat", self.base)
    }

    fn repeat_pending(&self) -> String {
        format!("{}:repeat:pending", self.base)
    }

    fn finished(&self, state: JobState) -> String {
        match state {
            JobState::Failed => self.failed(),
            _ => self.completed(),
        }
    }
}

/// Queue a fresh job record on `pipe`.
fn stage_insert(pipe: &mut redis::Pipeline, keys: &Keys, record: &JobRecord) -> EngineResult<()> {
    let job = &record.job;
    let state = if job.delay.is_zero() {
        JobState::Waiting
    } else {
        JobState::Delayed
    };

    pipe.cmd("SET").arg(keys.job(&job.id)).arg(encode(record)?).ignore();
    pipe.cmd("HSET")
        .arg(keys.state())
        .arg(job.id.as_str())
        .arg(state.as_str())
        .ignore();
    match state {
        JobState::Waiting => {
            pipe.cmd("RPUSH").arg(keys.wait()).arg(job.id.as_str()).ignore();
        }
        _ => {
            pipe.cmd("ZADD")
                .arg(keys.delayed())
                .arg(millis(job.visible_at()))
                .arg(job.id.as_str())
                .ignore();
        }
    }
    Ok(())
}

/// Queue engine persisting jobs in Redis.
#[derive(Clone)]
pub struct RedisEngine {
    client: Arc<redis::Client>,
    prefix: String,
    connection: Arc<Mutex<Option<MultiplexedConnection>>>,
}

impl std::fmt::Debug for RedisEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisEngine")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisEngine {
    /// Create an engine for `redis_url`. The connection is opened lazily on
    /// first use.
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> EngineResult<Self> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| EngineError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            connection: Arc::new(Mutex::new(None)),
        })
    }

    fn keys(&self, queue: &str) -> Keys {
        Keys::new(&self.prefix, queue)
    }

    async fn conn(&self) -> EngineResult<MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the cached connection so the next call reconnects.
    async fn reset_on_connection_error<T>(&self, result: EngineResult<T>) -> EngineResult<T> {
        if let Err(e) = &result {
            if e.is_connection() {
                warn!(error = %e, "redis connection lost; reconnecting on next call");
                *self.connection.lock().await = None;
            }
        }
        result
    }

    /// Run one engine operation, resetting the connection if it failed in transport.
    async fn guarded<T>(&self, op: impl Future<Output = EngineResult<T>>) -> EngineResult<T> {
        let result = op.await;
        self.reset_on_connection_error(result).await
    }

    async fn load(&self, conn: &mut MultiplexedConnection, keys: &Keys, id: &JobId) -> EngineResult<Option<JobRecord>> {
        let raw: Option<String> = redis::cmd("GET")
            .arg(keys.job(id))
            .query_async(conn)
            .await
            .map_err(redis_err("GET"))?;
        raw.map(|r| decode(&r)).transpose()
    }

    /// Load a job that must currently be active.
    async fn load_active(&self, conn: &mut MultiplexedConnection, keys: &Keys, id: &JobId) -> EngineResult<JobRecord> {
        let (raw, state): (Option<String>, Option<String>) = redis::pipe()
            .cmd("GET")
            .arg(keys.job(id))
            .cmd("HGET")
            .arg(keys.state())
            .arg(id.as_str())
            .query_async(conn)
            .await
            .map_err(redis_err("load pipeline"))?;

        let raw = raw.ok_or_else(|| EngineError::NotFound(id.clone()))?;
        let state = parse_state(state);
        if state != JobState::Active {
            return Err(EngineError::Command(format!("job {id} is {state} and cannot be settled")));
        }
        decode(&raw)
    }

    async fn save(
        &self,
        conn: &mut MultiplexedConnection,
        keys: &Keys,
        record: &JobRecord,
        expected: Option<JobState>,
    ) -> EngineResult<bool> {
        let id = &record.job.id;
        let saved: i64 = SAVE_SCRIPT
            .key(keys.state())
            .key(keys.job(id))
            .arg(id.as_str())
            .arg(expected.map_or("", JobState::as_str))
            .arg(encode(record)?)
            .invoke_async(conn)
            .await
            .map_err(redis_err("save script"))?;
        Ok(saved == 1)
    }

    /// The pending job currently scheduled for a repeat rule, if any.
    async fn pending_occurrence(
        &self,
        conn: &mut MultiplexedConnection,
        keys: &Keys,
        key: &str,
    ) -> EngineResult<Option<Job>> {
        let pending: Option<String> = redis::cmd("HGET")
            .arg(keys.repeat_pending())
            .arg(key)
            .query_async(conn)
            .await
            .map_err(redis_err("HGET"))?;
        let Some(pending) = pending else {
            return Ok(None);
        };

        let id = JobId::new(pending);
        let state: Option<String> = redis::cmd("HGET")
            .arg(keys.state())
            .arg(id.as_str())
            .query_async(conn)
            .await
            .map_err(redis_err("HGET"))?;
        if !parse_state(state).is_pending() {
            return Ok(None);
        }
        Ok(self.load(conn, keys, &id).await?.map(|r| r.job))
    }

    /// Reserve `n` consecutive ids and return the first.
    async fn reserve_ids(&self, conn: &mut MultiplexedConnection, keys: &Keys, n: u64) -> EngineResult<u64> {
        let last: u64 = redis::cmd("INCRBY")
            .arg(keys.id())
            .arg(n)
            .query_async(conn)
            .await
            .map_err(redis_err("INCRBY"))?;
        Ok(last + 1 - n)
    }

    /// Submit a batch: repeat dedupe first, then one MULTI/EXEC for every write.
    async fn add_jobs(&self, queue: &str, requests: Vec<NewJob>) -> EngineResult<Vec<Job>> {
        let now = Utc::now();
        for request in &requests {
            if let Some(repeat) = &request.opts.repeat {
                next_occurrence(&repeat.pattern, now)?;
            }
        }

        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let mut plan = Vec::with_capacity(requests.len());
        let mut batch_rules: HashMap<String, usize> = HashMap::new();
        for request in requests {
            let Some(repeat) = request.opts.repeat.clone() else {
                plan.push(Planned::Insert { request, repeat: None });
                continue;
            };

            let key = repeat_key(&request.name, &repeat.pattern);
            if let Some(&idx) = batch_rules.get(&key) {
                plan.push(Planned::SameAs(idx));
                continue;
            }
            if let Some(existing) = self.pending_occurrence(&mut conn, &keys, &key).await? {
                plan.push(Planned::Existing(existing));
                continue;
            }

            let rule = RepeatRule {
                pattern: repeat.pattern.clone(),
                request: request.clone(),
            };
            let next = next_occurrence(&repeat.pattern, now)?;
            let mut request = request;
            request.opts.delay = Some((next - now).to_std().unwrap_or_default());

            batch_rules.insert(key.clone(), plan.len());
            plan.push(Planned::Insert {
                request,
                repeat: Some((key, rule)),
            });
        }

        let inserts = plan.iter().filter(|p| matches!(p, Planned::Insert { .. })).count() as u64;
        let mut next_id = if inserts > 0 {
            self.reserve_ids(&mut conn, &keys, inserts).await?
        } else {
            0
        };

        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut added: Vec<Job> = Vec::with_capacity(plan.len());
        for planned in plan {
            match planned {
                Planned::Insert { request, repeat } => {
                    let job = Job::new(JobId::from(next_id), queue, request);
                    next_id += 1;

                    let record = JobRecord {
                        repeat_key: repeat.as_ref().map(|(key, _)| key.clone()),
                        job: job.clone(),
                    };
                    stage_insert(&mut pipe, &keys, &record)?;
                    if let Some((key, rule)) = repeat {
                        pipe.cmd("HSET").arg(keys.repeat()).arg(&key).arg(encode(&rule)?).ignore();
                        pipe.cmd("HSET")
                            .arg(keys.repeat_pending())
                            .arg(&key)
                            .arg(job.id.as_str())
                            .ignore();
                    }
                    added.push(job);
                }
                Planned::Existing(job) => added.push(job),
                Planned::SameAs(idx) => {
                    let job = added[idx].clone();
                    added.push(job);
                }
            }
        }

        if inserts > 0 {
            let _: () = pipe
                .query_async(&mut conn)
                .await
                .map_err(redis_err("add pipeline"))?;
        }
        Ok(added)
    }

    /// Schedule the next occurrence of a repeat rule as a delayed job.
    async fn schedule_repeat(
        &self,
        conn: &mut MultiplexedConnection,
        keys: &Keys,
        queue: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<Job>> {
        let raw: Option<String> = redis::cmd("HGET")
            .arg(keys.repeat())
            .arg(key)
            .query_async(conn)
            .await
            .map_err(redis_err("HGET"))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let rule: RepeatRule = decode(&raw)?;

        let next = next_occurrence(&rule.pattern, now)?;
        let mut request = rule.request;
        request.opts.delay = Some((next - now).to_std().unwrap_or_default());

        let id = self.reserve_ids(conn, keys, 1).await?;
        let record = JobRecord {
            repeat_key: Some(key.to_string()),
            job: Job::new(JobId::from(id), queue, request),
        };

        let mut pipe = redis::pipe();
        pipe.atomic();
        stage_insert(&mut pipe, keys, &record)?;
        pipe.cmd("HSET")
            .arg(keys.repeat_pending())
            .arg(key)
            .arg(record.job.id.as_str())
            .ignore();
        let _: () = pipe.query_async(conn).await.map_err(redis_err("repeat pipeline"))?;

        debug!(queue, key, next = %next, "scheduled repeat occurrence");
        Ok(Some(record.job))
    }

    #[allow(clippy::too_many_arguments)]
    async fn settle(
        &self,
        conn: &mut MultiplexedConnection,
        keys: &Keys,
        record: &JobRecord,
        mode: Settle,
        next_state: JobState,
        target: String,
        score: i64,
    ) -> EngineResult<()> {
        let id = &record.job.id;
        let settled: i64 = SETTLE_SCRIPT
            .key(keys.state())
            .key(keys.active())
            .key(keys.job(id))
            .key(target)
            .arg(id.as_str())
            .arg(mode.as_str())
            .arg(next_state.as_str())
            .arg(encode(record)?)
            .arg(score)
            .invoke_async(conn)
            .await
            .map_err(redis_err("settle script"))?;
        if settled == 0 {
            return Err(EngineError::Command(format!("job {id} is no longer active")));
        }
        Ok(())
    }

    /// Move a settled job into its terminal state and apply its retention policy.
    async fn finish(
        &self,
        conn: &mut MultiplexedConnection,
        keys: &Keys,
        record: &JobRecord,
        state: JobState,
        policy: &KeepJobs,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let set = keys.finished(state);
        let mode = match policy {
            KeepJobs::Remove => Settle::Drop,
            _ => Settle::Finish,
        };
        self.settle(conn, keys, record, mode, state, set.clone(), millis(now))
            .await?;

        if !matches!(policy, KeepJobs::Retain { .. }) {
            return Ok(());
        }

        let scored: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(&set)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(conn)
            .await
            .map_err(redis_err("ZRANGE"))?;
        let finished = scored
            .into_iter()
            .map(|(id, score)| (JobId::new(id), from_millis(score)))
            .collect();

        let prune = jobs_to_prune(policy, &record.job.id, finished, now);
        if prune.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &prune {
            pipe.cmd("ZREM").arg(&set).arg(id.as_str()).ignore();
            pipe.cmd("DEL").arg(keys.job(id)).ignore();
            pipe.cmd("HDEL").arg(keys.state()).arg(id.as_str()).ignore();
        }
        let _: () = pipe.query_async(conn).await.map_err(redis_err("retention pipeline"))?;
        Ok(())
    }

    async fn ids_in(&self, conn: &mut MultiplexedConnection, keys: &Keys, state: JobState) -> EngineResult<Vec<String>> {
        let (cmd, key) = match state {
            JobState::Waiting => ("LRANGE", keys.wait()),
            JobState::Active => ("LRANGE", keys.active()),
            JobState::Delayed => ("ZRANGE", keys.delayed()),
            JobState::Completed => ("ZRANGE", keys.completed()),
            JobState::Failed => ("ZRANGE", keys.failed()),
            JobState::Unknown => return Ok(Vec::new()),
        };
        redis::cmd(cmd)
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(conn)
            .await
            .map_err(redis_err(cmd))
    }

    async fn jobs_in(&self, queue: &str, states: &[JobState]) -> EngineResult<Vec<Job>> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let mut jobs = Vec::new();
        for state in states {
            let ids = self.ids_in(&mut conn, &keys, *state).await?;
            if ids.is_empty() {
                continue;
            }
            let job_keys: Vec<String> = ids.iter().map(|id| keys.job(&JobId::new(id.as_str()))).collect();
            let (raws, states_now): (Vec<Option<String>>, Vec<Option<String>>) = redis::pipe()
                .cmd("MGET")
                .arg(&job_keys)
                .cmd("HMGET")
                .arg(keys.state())
                .arg(&ids)
                .query_async(&mut conn)
                .await
                .map_err(redis_err("get_jobs pipeline"))?;

            let mut records = Vec::with_capacity(raws.len());
            for (raw, current) in raws.into_iter().zip(states_now) {
                if let Some(raw) = raw {
                    if parse_state(current) == *state {
                        records.push(decode::<JobRecord>(&raw)?);
                    }
                }
            }
            sort_newest_first(&mut records);
            jobs.extend(records.into_iter().map(|r| r.job));
        }
        Ok(jobs)
    }

    async fn state_of(&self, queue: &str, id: &JobId) -> EngineResult<JobState> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("HGET")
            .arg(keys.state())
            .arg(id.as_str())
            .query_async(&mut conn)
            .await
            .map_err(redis_err("HGET"))?;
        Ok(parse_state(raw))
    }

    async fn depth(&self, queue: &str) -> EngineResult<usize> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;
        let (waiting, delayed): (usize, usize) = redis::pipe()
            .cmd("LLEN")
            .arg(keys.wait())
            .cmd("ZCARD")
            .arg(keys.delayed())
            .query_async(&mut conn)
            .await
            .map_err(redis_err("count pipeline"))?;
        Ok(waiting + delayed)
    }

    async fn remove_job(&self, queue: &str, id: &JobId) -> EngineResult<()> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;
        let outcome: i64 = REMOVE_SCRIPT
            .key(keys.state())
            .key(keys.job(id))
            .key(keys.wait())
            .key(keys.delayed())
            .key(keys.completed())
            .key(keys.failed())
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err("remove script"))?;
        if outcome < 0 {
            return Err(EngineError::JobLocked(id.clone()));
        }
        Ok(())
    }

    async fn claim(&self, queue: &str) -> EngineResult<Option<Job>> {
        let now = Utc::now();
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let claimed: Option<(String, String)> = CLAIM_SCRIPT
            .key(keys.delayed())
            .key(keys.wait())
            .key(keys.active())
            .key(keys.state())
            .arg(millis(now))
            .arg(keys.job_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err("claim script"))?;
        let Some((_, raw)) = claimed else {
            return Ok(None);
        };

        let mut record: JobRecord = decode(&raw)?;
        record.job.processed_on = Some(now);
        self.save(&mut conn, &keys, &record, Some(JobState::Active)).await?;

        if let Some(key) = &record.repeat_key {
            self.schedule_repeat(&mut conn, &keys, queue, key, now).await?;
        }
        Ok(Some(record.job))
    }

    async fn complete_job(&self, queue: &str, id: &JobId, return_value: JsonValue) -> EngineResult<Job> {
        let now = Utc::now();
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let mut record = self.load_active(&mut conn, &keys, id).await?;
        record.job.return_value = Some(return_value);
        record.job.finished_on = Some(now);

        let policy = record.job.opts.remove_on_complete.clone().unwrap_or(KeepJobs::Keep);
        self.finish(&mut conn, &keys, &record, JobState::Completed, &policy, now)
            .await?;
        Ok(record.job)
    }

    async fn fail_job(&self, queue: &str, id: &JobId, reason: &str) -> EngineResult<Job> {
        let now = Utc::now();
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let mut record = self.load_active(&mut conn, &keys, id).await?;
        record.job.attempts_made += 1;
        record.job.failed_reason = Some(reason.to_string());

        if record.job.has_attempts_left() {
            self.settle(&mut conn, &keys, &record, Settle::Retry, JobState::Waiting, keys.wait(), 0)
                .await?;
            return Ok(record.job);
        }

        record.job.finished_on = Some(now);
        let policy = record.job.opts.remove_on_fail.clone().unwrap_or(KeepJobs::Keep);
        self.finish(&mut conn, &keys, &record, JobState::Failed, &policy, now)
            .await?;
        Ok(record.job)
    }

    async fn record_progress(&self, queue: &str, id: &JobId, progress: JsonValue) -> EngineResult<()> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;
        let mut record = self
            .load(&mut conn, &keys, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        record.job.progress = Some(progress);
        if !self.save(&mut conn, &keys, &record, None).await? {
            return Err(EngineError::NotFound(id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueEngine for RedisEngine {
    #[instrument(skip(self, job), fields(name = %job.name), err)]
    async fn add(&self, queue: &str, job: NewJob) -> EngineResult<Job> {
        let mut added = self.guarded(self.add_jobs(queue, vec![job])).await?;
        added
            .pop()
            .ok_or_else(|| EngineError::Command("add returned no job".to_string()))
    }

    async fn add_bulk(&self, queue: &str, jobs: Vec<NewJob>) -> EngineResult<Vec<Job>> {
        self.guarded(self.add_jobs(queue, jobs)).await
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> EngineResult<Option<Job>> {
        self.guarded(async {
            let keys = self.keys(queue);
            let mut conn = self.conn().await?;
            Ok(self.load(&mut conn, &keys, id).await?.map(|r| r.job))
        })
        .await
    }

    async fn get_jobs(&self, queue: &str, states: &[JobState]) -> EngineResult<Vec<Job>> {
        self.guarded(self.jobs_in(queue, states)).await
    }

    async fn get_state(&self, queue: &str, id: &JobId) -> EngineResult<JobState> {
        self.guarded(self.state_of(queue, id)).await
    }

    async fn count(&self, queue: &str) -> EngineResult<usize> {
        self.guarded(self.depth(queue)).await
    }

    async fn remove(&self, queue: &str, id: &JobId) -> EngineResult<()> {
        self.guarded(self.remove_job(queue, id)).await
    }

    async fn claim_next(&self, queue: &str) -> EngineResult<Option<Job>> {
        self.guarded(self.claim(queue)).await
    }

    async fn complete(&self, queue: &str, id: &JobId, return_value: JsonValue) -> EngineResult<Job> {
        self.guarded(self.complete_job(queue, id, return_value)).await
    }

    async fn fail(&self, queue: &str, id: &JobId, reason: &str) -> EngineResult<Job> {
        self.guarded(self.fail_job(queue, id, reason)).await
    }

    async fn update_progress(&self, queue: &str, id: &JobId, progress: JsonValue) -> EngineResult<()> {
        self.guarded(self.record_progress(queue, id, progress)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_per_queue() {
        let keys = Keys::new("jk", "mail");
        assert_eq!(keys.id(), "jk:mail:id");
        assert_eq!(keys.job(&JobId::from(7u64)), "jk:mail:job:7");
        assert_eq!(keys.job_prefix(), "jk:mail:job:");
        assert_eq!(keys.state(), "jk:mail:state");
        assert_eq!(keys.finished(JobState::Failed), "jk:mail:failed");
        assert_eq!(keys.finished(JobState::Completed), "jk:mail:completed");
        assert_eq!(keys.repeat_pending(), "jk:mail:repeat:pending");
    }

    #[test]
    fn invalid_url_is_a_connection_error() {
        let err = RedisEngine::new("not a url", None).unwrap_err();
        assert!(err.is_connection());
    }

    #[test]
    fn transport_failures_map_to_connection_errors() {
        let io = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ));
        assert!(redis_err("GET")(io).is_connection());

        let refused = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(redis_err("GET")(refused).is_connection());
    }

    #[test]
    fn reply_errors_stay_command_errors() {
        let err = redis_err("HGET")(redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "WRONGTYPE",
        )));
        assert!(matches!(err, EngineError::Command(msg) if msg.starts_with("HGET failed")));
    }

    #[test]
    fn stored_states_parse_back() {
        assert_eq!(parse_state(Some("active".to_string())), JobState::Active);
        assert_eq!(parse_state(Some("delayed".to_string())), JobState::Delayed);
        assert_eq!(parse_state(None), JobState::Unknown);
    }

    #[test]
    fn settle_modes_match_script_branches() {
        assert_eq!(Settle::Retry.as_str(), "retry");
        assert_eq!(Settle::Finish.as_str(), "finish");
        assert_eq!(Settle::Drop.as_str(), "drop");
    }

    #[test]
    fn counter_ids_sort_numerically() {
        let record = |id: u64| JobRecord {
            repeat_key: None,
            job: Job::new(JobId::from(id), "q", NewJob::new("n", Default::default())),
        };
        let mut records = vec![record(2), record(10), record(9)];
        sort_newest_first(&mut records);
        let ids: Vec<_> = records.iter().map(|r| r.job.id.to_string()).collect();
        assert_eq!(ids, vec!["10", "9", "2"]);
    }

    #[tokio::test]
    async fn unreachable_server_surfaces_connection_error_and_stays_uncached() {
        let engine = RedisEngine::new("redis://127.0.0.1:1/", None).unwrap();

        let err = engine.count("mail").await.unwrap_err();
        assert!(err.is_connection());
        assert!(engine.connection.lock().await.is_none());

        let err = engine.claim_next("mail").await.unwrap_err();
        assert!(err.is_connection());
    }
}
