//! Durable queue engine collaborator (mechanics only).
//!
//! The engine owns every job: storage, visibility, delivery, retries and
//! retention. The orchestration layer talks to it exclusively through
//! [`QueueEngine`] and never keeps job state of its own.
//!
//! ## Producer side
//!
//! `add`/`add_bulk` submit jobs with fully merged options, `get_job`,
//! `get_jobs`, `get_state` and `count` observe them, `remove` deletes them.
//! Submitting with `opts.repeat` set registers a repeat rule and schedules the
//! first occurrence as a delayed job.
//!
//! ## Consumer side
//!
//! `claim_next` moves the oldest visible job to `active` (promoting due delayed
//! jobs first), `complete`/`fail` settle it and apply the job's retention
//! policy, `update_progress` records progress.
//!
//! ## Delivery guarantees
//!
//! At-least-once. A job may be handed out again if a worker dies between claim
//! and settle; tasks must tolerate re-execution.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use jobkeeper_core::{Job, JobId, JobState, NewJob};

use crate::error::EngineResult;

#[async_trait]
pub trait QueueEngine: Send + Sync {
    /// Submit a single job. The request's options are used as-is.
    async fn add(&self, queue: &str, job: NewJob) -> EngineResult<Job>;

    /// Submit several jobs in one round-trip. All or nothing; output order
    /// matches input order.
    async fn add_bulk(&self, queue: &str, jobs: Vec<NewJob>) -> EngineResult<Vec<Job>>;

    async fn get_job(&self, queue: &str, id: &JobId) -> EngineResult<Option<Job>>;

    /// Jobs in any of `states`, grouped in the order the states are given;
    /// newest first within a state.
    async fn get_jobs(&self, queue: &str, states: &[JobState]) -> EngineResult<Vec<Job>>;

    /// Current state; `Unknown` when the job does not exist.
    async fn get_state(&self, queue: &str, id: &JobId) -> EngineResult<JobState>;

    /// Jobs still waiting to run (waiting + delayed).
    async fn count(&self, queue: &str) -> EngineResult<usize>;

    /// Remove a job. Removing a missing job is a no-op; removing an active job
    /// fails with `EngineError::JobLocked`.
    async fn remove(&self, queue: &str, id: &JobId) -> EngineResult<()>;

    /// Claim the next visible job for processing, if any.
    async fn claim_next(&self, queue: &str) -> EngineResult<Option<Job>>;

    /// Settle an active job as completed.
    async fn complete(&self, queue: &str, id: &JobId, return_value: JsonValue) -> EngineResult<Job>;

    /// Settle an active job as failed. The engine re-queues it while attempts
    /// remain, otherwise moves it to `failed`.
    async fn fail(&self, queue: &str, id: &JobId, reason: &str) -> EngineResult<Job>;

    async fn update_progress(&self, queue: &str, id: &JobId, progress: JsonValue) -> EngineResult<()>;
}

#[async_trait]
impl<E> QueueEngine for Arc<E>
where
    E: QueueEngine + ?Sized,
{
    async fn add(&self, queue: &str, job: NewJob) -> EngineResult<Job> {
        (**self).add(queue, job).await
    }

    async fn add_bulk(&self, queue: &str, jobs: Vec<NewJob>) -> EngineResult<Vec<Job>> {
        (**self).add_bulk(queue, jobs).await
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> EngineResult<Option<Job>> {
        (**self).get_job(queue, id).await
    }

    async fn get_jobs(&self, queue: &str, states: &[JobState]) -> EngineResult<Vec<Job>> {
        (**self).get_jobs(queue, states).await
    }

    async fn get_state(&self, queue: &str, id: &JobId) -> EngineResult<JobState> {
        (**self).get_state(queue, id).await
    }

    async fn count(&self, queue: &str) -> EngineResult<usize> {
        (**self).count(queue).await
    }

    async fn remove(&self, queue: &str, id: &JobId) -> EngineResult<()> {
        (**self).remove(queue, id).await
    }

    async fn claim_next(&self, queue: &str) -> EngineResult<Option<Job>> {
        (**self).claim_next(queue).await
    }

    async fn complete(&self, queue: &str, id: &JobId, return_value: JsonValue) -> EngineResult<Job> {
        (**self).complete(queue, id, return_value).await
    }

    async fn fail(&self, queue: &str, id: &JobId, reason: &str) -> EngineResult<Job> {
        (**self).fail(queue, id, reason).await
    }

    async fn update_progress(&self, queue: &str, id: &JobId, progress: JsonValue) -> EngineResult<()> {
        (**self).update_progress(queue, id, progress).await
    }
}

/// Shared handle to an engine.
pub type SharedEngine = Arc<dyn QueueEngine>;
