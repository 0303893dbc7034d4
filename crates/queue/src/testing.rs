//! Test doubles.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use jobkeeper_core::{Job, JobId, JobState, NewJob};
use jobkeeper_engine::{EngineError, EngineResult, QueueEngine, SharedEngine};

/// Engine whose every call fails with a connection error.
#[derive(Debug, Default)]
pub(crate) struct FailingEngine;

impl FailingEngine {
    pub(crate) fn shared() -> SharedEngine {
        Arc::new(Self)
    }
}

fn down<T>() -> EngineResult<T> {
    Err(EngineError::Connection("connection refused".to_string()))
}

#[async_trait]
impl QueueEngine for FailingEngine {
    async fn add(&self, _queue: &str, _job: NewJob) -> EngineResult<Job> {
        down()
    }

    async fn add_bulk(&self, _queue: &str, _jobs: Vec<NewJob>) -> EngineResult<Vec<Job>> {
        down()
    }

    async fn get_job(&self, _queue: &str, _id: &JobId) -> EngineResult<Option<Job>> {
        down()
    }

    async fn get_jobs(&self, _queue: &str, _states: &[JobState]) -> EngineResult<Vec<Job>> {
        down()
    }

    async fn get_state(&self, _queue: &str, _id: &JobId) -> EngineResult<JobState> {
        down()
    }

    async fn count(&self, _queue: &str) -> EngineResult<usize> {
        down()
    }

    async fn remove(&self, _queue: &str, _id: &JobId) -> EngineResult<()> {
        down()
    }

    async fn claim_next(&self, _queue: &str) -> EngineResult<Option<Job>> {
        down()
    }

    async fn complete(&self, _queue: &str, _id: &JobId, _value: JsonValue) -> EngineResult<Job> {
        down()
    }

    async fn fail(&self, _queue: &str, _id: &JobId, _reason: &str) -> EngineResult<Job> {
        down()
    }

    async fn update_progress(&self, _queue: &str, _id: &JobId, _progress: JsonValue) -> EngineResult<()> {
        down()
    }
}
