//! In-memory queue engine for tests and single-process deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use tracing::debug;

use jobkeeper_core::{Job, JobId, JobOptions, JobState, KeepJobs, NewJob};
use jobkeeper_engine::{EngineError, EngineResult, QueueEngine};

use super::retention::jobs_to_prune;
use super::schedule::{next_occurrence, repeat_key};

#[derive(Debug, Clone)]
struct StoredJob {
    seq: u64,
    state: JobState,
    /// Repeat rule this job instance was scheduled from.
    repeat_key: Option<String>,
    job: Job,
}

#[derive(Debug, Clone)]
struct RepeatRule {
    name: String,
    pattern: String,
    request: NewJob,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    jobs: HashMap<JobId, StoredJob>,
    /// Waiting job ids, front runs next.
    wait: VecDeque<JobId>,
    repeat: HashMap<String, RepeatRule>,
}

impl QueueState {
    fn insert(&mut self, queue: &str, request: NewJob, repeat_key: Option<String>) -> Job {
        self.next_id += 1;
        let id = JobId::from(self.next_id);
        let job = Job::new(id.clone(), queue, request);

        let state = if job.delay.is_zero() {
            self.wait.push_back(id.clone());
            JobState::Waiting
        } else {
            JobState::Delayed
        };

        self.jobs.insert(
            id,
            StoredJob {
                seq: self.next_id,
                state,
                repeat_key,
                job: job.clone(),
            },
        );
        job
    }

    /// Schedule the next occurrence of a repeat rule as a delayed job.
    fn schedule_repeat(&mut self, queue: &str, key: &str, now: DateTime<Utc>) -> EngineResult<Job> {
        let rule = self
            .repeat
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::Command(format!("unknown repeat rule: {key}")))?;

        let next = next_occurrence(&rule.pattern, now)?;
        let delay = (next - now).to_std().unwrap_or_default();
        let mut request = rule.request;
        request.opts.delay = Some(delay);

        debug!(queue, name = %rule.name, next = %next, "scheduled repeat occurrence");
        Ok(self.insert(queue, request, Some(key.to_string())))
    }

    fn add_repeatable(&mut self, queue: &str, request: NewJob, pattern: &str, now: DateTime<Utc>) -> EngineResult<Job> {
        next_occurrence(pattern, now)?;
        let key = repeat_key(&request.name, pattern);

        if self.repeat.contains_key(&key) {
            let pending = self
                .jobs
                .values()
                .find(|s| s.repeat_key.as_deref() == Some(key.as_str()) && s.state.is_pending());
            if let Some(existing) = pending {
                return Ok(existing.job.clone());
            }
        }

        self.repeat.insert(
            key.clone(),
            RepeatRule {
                name: request.name.clone(),
                pattern: pattern.to_string(),
                request,
            },
        );
        self.schedule_repeat(queue, &key, now)
    }

    fn promote_delayed(&mut self, now: DateTime<Utc>) {
        let mut due: Vec<(DateTime<Utc>, u64, JobId)> = self
            .jobs
            .values()
            .filter(|s| s.state == JobState::Delayed && s.job.visible_at() <= now)
            .map(|s| (s.job.visible_at(), s.seq, s.job.id.clone()))
            .collect();
        due.sort();

        for (_, _, id) in due {
            if let Some(stored) = self.jobs.get_mut(&id) {
                stored.state = JobState::Waiting;
                self.wait.push_back(id);
            }
        }
    }

    fn settle(&mut self, id: &JobId) -> EngineResult<&mut StoredJob> {
        let stored = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        if stored.state != JobState::Active {
            return Err(EngineError::Command(format!(
                "job {id} is {} and cannot be settled",
                stored.state
            )));
        }
        Ok(stored)
    }

    /// Apply `settled`'s retention policy after it entered `state`.
    fn apply_retention(&mut self, state: JobState, settled: &JobId, policy: &KeepJobs, now: DateTime<Utc>) {
        let finished: Vec<(JobId, DateTime<Utc>)> = self
            .jobs
            .values()
            .filter(|s| s.state == state)
            .map(|s| (s.job.id.clone(), s.job.finished_on.unwrap_or(now)))
            .collect();

        for id in jobs_to_prune(policy, settled, finished, now) {
            self.jobs.remove(&id);
        }
    }

    fn jobs_in(&self, state: JobState) -> Vec<Job> {
        let mut stored: Vec<&StoredJob> = self.jobs.values().filter(|s| s.state == state).collect();
        stored.sort_by(|a, b| b.seq.cmp(&a.seq));
        stored.into_iter().map(|s| s.job.clone()).collect()
    }
}

/// Engine keeping every queue in process memory.
///
/// Semantics follow the `QueueEngine` contract closely enough to exercise the
/// orchestration layer end to end; nothing survives a restart.
#[derive(Debug, Default)]
pub struct InMemoryEngine {
    queues: RwLock<HashMap<String, QueueState>>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Names of queues that have seen at least one job.
    pub async fn queue_names(&self) -> Vec<String> {
        let queues = self.queues.read().await;
        let mut names: Vec<String> = queues.keys().cloned().collect();
        names.sort();
        names
    }
}

fn validate_repeat(opts: &JobOptions, now: DateTime<Utc>) -> EngineResult<()> {
    if let Some(repeat) = &opts.repeat {
        next_occurrence(&repeat.pattern, now)?;
    }
    Ok(())
}

#[async_trait]
impl QueueEngine for InMemoryEngine {
    async fn add(&self, queue: &str, job: NewJob) -> EngineResult<Job> {
        let now = Utc::now();
        let mut queues = self.queues.write().await;
        let state = queues.entry(queue.to_string()).or_default();

        match job.opts.repeat.clone() {
            Some(repeat) => state.add_repeatable(queue, job, &repeat.pattern, now),
            None => Ok(state.insert(queue, job, None)),
        }
    }

    async fn add_bulk(&self, queue: &str, jobs: Vec<NewJob>) -> EngineResult<Vec<Job>> {
        let now = Utc::now();
        for job in &jobs {
            validate_repeat(&job.opts, now)?;
        }

        let mut queues = self.queues.write().await;
        let state = queues.entry(queue.to_string()).or_default();

        let mut added = Vec::with_capacity(jobs.len());
        for job in jobs {
            let job = match job.opts.repeat.clone() {
                Some(repeat) => state.add_repeatable(queue, job, &repeat.pattern, now)?,
                None => state.insert(queue, job, None),
            };
            added.push(job);
        }
        Ok(added)
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> EngineResult<Option<Job>> {
        let queues = self.queues.read().await;
        Ok(queues
            .get(queue)
            .and_then(|q| q.jobs.get(id))
            .map(|s| s.job.clone()))
    }

    async fn get_jobs(&self, queue: &str, states: &[JobState]) -> EngineResult<Vec<Job>> {
        let queues = self.queues.read().await;
        let Some(q) = queues.get(queue) else {
            return Ok(Vec::new());
        };
        Ok(states.iter().flat_map(|state| q.jobs_in(*state)).collect())
    }

    async fn get_state(&self, queue: &str, id: &JobId) -> EngineResult<JobState> {
        let queues = self.queues.read().await;
        Ok(queues
            .get(queue)
            .and_then(|q| q.jobs.get(id))
            .map_or(JobState::Unknown, |s| s.state))
    }

    async fn count(&self, queue: &str) -> EngineResult<usize> {
        let queues = self.queues.read().await;
        Ok(queues.get(queue).map_or(0, |q| {
            q.jobs
                .values()
                .filter(|s| matches!(s.state, JobState::Waiting | JobState::Delayed))
                .count()
        }))
    }

    async fn remove(&self, queue: &str, id: &JobId) -> EngineResult<()> {
        let mut queues = self.queues.write().await;
        let Some(q) = queues.get_mut(queue) else {
            return Ok(());
        };

        match q.jobs.get(id) {
            None => Ok(()),
            Some(stored) if stored.state == JobState::Active => Err(EngineError::JobLocked(id.clone())),
            Some(_) => {
                q.jobs.remove(id);
                q.wait.retain(|w| w != id);
                Ok(())
            }
        }
    }

    async fn claim_next(&self, queue: &str) -> EngineResult<Option<Job>> {
        let now = Utc::now();
        let mut queues = self.queues.write().await;
        let Some(q) = queues.get_mut(queue) else {
            return Ok(None);
        };

        q.promote_delayed(now);

        while let Some(id) = q.wait.pop_front() {
            let Some(stored) = q.jobs.get_mut(&id) else {
                continue;
            };
            if stored.state != JobState::Waiting {
                continue;
            }
            stored.state = JobState::Active;
            stored.job.processed_on = Some(now);
            let job = stored.job.clone();

            if let Some(key) = stored.repeat_key.clone() {
                if q.repeat.contains_key(&key) {
                    q.schedule_repeat(queue, &key, now)?;
                }
            }
            return Ok(Some(job));
        }
        Ok(None)
    }

    async fn complete(&self, queue: &str, id: &JobId, return_value: JsonValue) -> EngineResult<Job> {
        let now = Utc::now();
        let mut queues = self.queues.write().await;
        let q = queues
            .get_mut(queue)
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;

        let stored = q.settle(id)?;
        stored.job.return_value = Some(return_value);
        stored.job.finished_on = Some(now);
        stored.state = JobState::Completed;
        let job = stored.job.clone();

        let policy = job.opts.remove_on_complete.clone().unwrap_or(KeepJobs::Keep);
        q.apply_retention(JobState::Completed, id, &policy, now);
        Ok(job)
    }

    async fn fail(&self, queue: &str, id: &JobId, reason: &str) -> EngineResult<Job> {
        let now = Utc::now();
        let mut queues = self.queues.write().await;
        let q = queues
            .get_mut(queue)
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;

        let stored = q.settle(id)?;
        stored.job.attempts_made += 1;
        stored.job.failed_reason = Some(reason.to_string());

        if stored.job.has_attempts_left() {
            stored.state = JobState::Waiting;
            let job = stored.job.clone();
            q.wait.push_back(id.clone());
            return Ok(job);
        }

        stored.job.finished_on = Some(now);
        stored.state = JobState::Failed;
        let job = stored.job.clone();

        let policy = job.opts.remove_on_fail.clone().unwrap_or(KeepJobs::Keep);
        q.apply_retention(JobState::Failed, id, &policy, now);
        Ok(job)
    }

    async fn update_progress(&self, queue: &str, id: &JobId, progress: JsonValue) -> EngineResult<()> {
        let mut queues = self.queues.write().await;
        let stored = queues
            .get_mut(queue)
            .and_then(|q| q.jobs.get_mut(id))
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        stored.job.progress = Some(progress);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use jobkeeper_core::{JobData, RepeatOptions};
    use serde_json::json;

    const Q: &str = "test-queue";

    fn job(name: &str) -> NewJob {
        NewJob::new(name, JobData::new())
    }

    #[tokio::test]
    async fn add_and_claim_in_fifo_order() {
        let engine = InMemoryEngine::new();
        let first = engine.add(Q, job("a")).await.unwrap();
        let second = engine.add(Q, job("b")).await.unwrap();

        assert_eq!(engine.get_state(Q, &first.id).await.unwrap(), JobState::Waiting);
        assert_eq!(engine.count(Q).await.unwrap(), 2);

        let claimed = engine.claim_next(Q).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert!(claimed.processed_on.is_some());
        assert_eq!(engine.get_state(Q, &first.id).await.unwrap(), JobState::Active);

        let claimed = engine.claim_next(Q).await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);

        assert!(engine.claim_next(Q).await.unwrap().is_none());
        assert_eq!(engine.count(Q).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delayed_job_becomes_visible_after_delay() {
        let engine = InMemoryEngine::new();
        let delayed = engine
            .add(Q, job("later").with_delay(Duration::from_millis(40)))
            .await
            .unwrap();

        assert_eq!(engine.get_state(Q, &delayed.id).await.unwrap(), JobState::Delayed);
        assert!(engine.claim_next(Q).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let claimed = engine.claim_next(Q).await.unwrap().unwrap();
        assert_eq!(claimed.id, delayed.id);
    }

    #[tokio::test]
    async fn remove_is_idempotent_but_refuses_active_jobs() {
        let engine = InMemoryEngine::new();
        let waiting = engine.add(Q, job("w")).await.unwrap();
        engine.remove(Q, &waiting.id).await.unwrap();
        engine.remove(Q, &waiting.id).await.unwrap();
        assert!(engine.get_job(Q, &waiting.id).await.unwrap().is_none());
        assert_eq!(engine.get_state(Q, &waiting.id).await.unwrap(), JobState::Unknown);

        let active = engine.add(Q, job("a")).await.unwrap();
        engine.claim_next(Q).await.unwrap();
        let err = engine.remove(Q, &active.id).await.unwrap_err();
        assert!(matches!(err, EngineError::JobLocked(id) if id == active.id));
    }

    #[tokio::test]
    async fn complete_applies_remove_on_complete() {
        let engine = InMemoryEngine::new();
        let opts = JobOptions::default().with_remove_on_complete(KeepJobs::Remove);
        let added = engine.add(Q, job("gone").with_options(opts)).await.unwrap();
        engine.claim_next(Q).await.unwrap();

        let done = engine.complete(Q, &added.id, json!({"ok": true})).await.unwrap();
        assert_eq!(done.return_value, Some(json!({"ok": true})));
        assert!(done.finished_on.is_some());
        assert!(engine.get_job(Q, &added.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn removing_one_completed_job_spares_kept_neighbours() {
        let engine = InMemoryEngine::new();
        let keep = JobOptions::default().with_remove_on_complete(KeepJobs::Keep);
        let remove = JobOptions::default().with_remove_on_complete(KeepJobs::Remove);
        let kept = engine.add(Q, job("kept").with_options(keep)).await.unwrap();
        let dropped = engine.add(Q, job("dropped").with_options(remove)).await.unwrap();

        engine.claim_next(Q).await.unwrap();
        engine.complete(Q, &kept.id, json!("a")).await.unwrap();
        engine.claim_next(Q).await.unwrap();
        engine.complete(Q, &dropped.id, json!("b")).await.unwrap();

        assert_eq!(engine.get_state(Q, &kept.id).await.unwrap(), JobState::Completed);
        assert_eq!(engine.get_state(Q, &dropped.id).await.unwrap(), JobState::Unknown);
    }

    #[tokio::test]
    async fn failed_job_with_remove_policy_spares_other_failures() {
        let engine = InMemoryEngine::new();
        let first = engine.add(Q, job("first")).await.unwrap();
        let second = engine
            .add(Q, job("second").with_options(JobOptions::default().with_remove_on_fail(KeepJobs::Remove)))
            .await
            .unwrap();

        engine.claim_next(Q).await.unwrap();
        engine.fail(Q, &first.id, "boom").await.unwrap();
        engine.claim_next(Q).await.unwrap();
        engine.fail(Q, &second.id, "boom").await.unwrap();

        assert_eq!(engine.get_state(Q, &first.id).await.unwrap(), JobState::Failed);
        assert!(engine.get_job(Q, &second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completed_jobs_are_kept_by_default() {
        let engine = InMemoryEngine::new();
        let added = engine.add(Q, job("kept")).await.unwrap();
        engine.claim_next(Q).await.unwrap();
        engine.complete(Q, &added.id, json!(1)).await.unwrap();

        assert_eq!(engine.get_state(Q, &added.id).await.unwrap(), JobState::Completed);
        let stored = engine.get_job(Q, &added.id).await.unwrap().unwrap();
        assert_eq!(stored.return_value, Some(json!(1)));
    }

    #[tokio::test]
    async fn count_retention_keeps_newest_completed() {
        let engine = InMemoryEngine::new();
        let opts = JobOptions::default().with_remove_on_complete(KeepJobs::retain_last(1));
        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            ids.push(engine.add(Q, job(name).with_options(opts.clone())).await.unwrap().id);
        }
        for id in &ids {
            engine.claim_next(Q).await.unwrap();
            engine.complete(Q, id, JsonValue::Null).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let completed = engine.get_jobs(Q, &[JobState::Completed]).await.unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, ids[2]);
    }

    #[tokio::test]
    async fn failed_job_retries_until_attempts_exhausted() {
        let engine = InMemoryEngine::new();
        let opts = JobOptions::default().with_attempts(2);
        let added = engine.add(Q, job("flaky").with_options(opts)).await.unwrap();

        engine.claim_next(Q).await.unwrap();
        let first = engine.fail(Q, &added.id, "boom").await.unwrap();
        assert_eq!(first.attempts_made, 1);
        assert!(first.finished_on.is_none());
        assert_eq!(engine.get_state(Q, &added.id).await.unwrap(), JobState::Waiting);

        engine.claim_next(Q).await.unwrap();
        let second = engine.fail(Q, &added.id, "boom again").await.unwrap();
        assert_eq!(second.attempts_made, 2);
        assert_eq!(second.failed_reason.as_deref(), Some("boom again"));
        assert!(second.finished_on.is_some());
        assert_eq!(engine.get_state(Q, &added.id).await.unwrap(), JobState::Failed);
    }

    #[tokio::test]
    async fn settling_a_waiting_job_is_rejected() {
        let engine = InMemoryEngine::new();
        let added = engine.add(Q, job("idle")).await.unwrap();
        let err = engine.complete(Q, &added.id, JsonValue::Null).await.unwrap_err();
        assert!(matches!(err, EngineError::Command(_)));
    }

    #[tokio::test]
    async fn get_jobs_groups_by_requested_state_order() {
        let engine = InMemoryEngine::new();
        let waiting_old = engine.add(Q, job("w1")).await.unwrap();
        let waiting_new = engine.add(Q, job("w2")).await.unwrap();
        let delayed = engine
            .add(Q, job("d").with_delay(Duration::from_secs(60)))
            .await
            .unwrap();

        let jobs = engine
            .get_jobs(Q, &[JobState::Delayed, JobState::Waiting])
            .await
            .unwrap();
        let ids: Vec<_> = jobs.into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![delayed.id, waiting_new.id, waiting_old.id]);
    }

    #[tokio::test]
    async fn repeatable_job_is_scheduled_once_per_rule() {
        let engine = InMemoryEngine::new();
        let opts = JobOptions::default().with_repeat(RepeatOptions::cron("0 0 * * * *"));

        let first = engine.add(Q, job("hourly").with_options(opts.clone())).await.unwrap();
        let again = engine.add(Q, job("hourly").with_options(opts)).await.unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(engine.get_state(Q, &first.id).await.unwrap(), JobState::Delayed);
        assert_eq!(engine.get_jobs(Q, &JobState::PENDING).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_repeat_pattern_fails_the_whole_bulk() {
        let engine = InMemoryEngine::new();
        let bad = job("bad").with_options(JobOptions::default().with_repeat(RepeatOptions::cron("nope")));

        let err = engine.add_bulk(Q, vec![job("ok"), bad]).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidRepeatPattern { .. }));
        assert_eq!(engine.count(Q).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalid_repeat_pattern_leaves_no_rule_behind() {
        let engine = InMemoryEngine::new();
        let bad = job("nightly").with_options(JobOptions::default().with_repeat(RepeatOptions::cron("nope")));

        let err = engine.add(Q, bad).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidRepeatPattern { .. }));

        let queues = engine.queues.read().await;
        let state = queues.get(Q).unwrap();
        assert!(state.repeat.is_empty());
        assert!(state.jobs.is_empty());
    }

    #[tokio::test]
    async fn progress_is_recorded_on_the_job() {
        let engine = InMemoryEngine::new();
        let added = engine.add(Q, job("p")).await.unwrap();
        engine.update_progress(Q, &added.id, json!(50)).await.unwrap();
        let stored = engine.get_job(Q, &added.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, Some(json!(50)));

        let missing = engine.update_progress(Q, &JobId::from(999u64), json!(1)).await;
        assert!(matches!(missing, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let engine = InMemoryEngine::new();
        let a = engine.add("a", job("x")).await.unwrap();
        engine.add("b", job("y")).await.unwrap();

        let same_id_other_queue = engine.get_job("b", &a.id).await.unwrap().map(|j| j.name);
        assert_eq!(same_id_other_queue, Some("y".to_string()));
        assert_eq!(engine.queue_names().await, vec!["a".to_string(), "b".to_string()]);
        assert!(engine.claim_next("missing").await.unwrap().is_none());
    }
}
