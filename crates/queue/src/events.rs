//! Worker lifecycle callbacks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use jobkeeper_core::{Job, LogRecord, SharedLogger, TracingJobLogger};

use crate::manager::QueueManager;

/// Result TTL used by [`RemoveJobTtlHandlers`] unless told otherwise.
pub const DEFAULT_REMOVE_JOB_TTL: Duration = Duration::from_secs(30 * 60);

/// Callbacks fired by a running worker.
///
/// `on_progress` and `on_drained` are optional and do nothing by default.
#[async_trait]
pub trait WorkerEventHandlers: Send + Sync {
    async fn on_complete(&self, job: &Job);

    /// `job` is `None` when the failure is not tied to a job, e.g. a claim error.
    async fn on_fail(&self, job: Option<&Job>, error: &str);

    async fn on_active(&self, job: &Job);

    async fn on_progress(&self, _job: &Job, _progress: &JsonValue) {}

    /// Fired when the queue goes from having work to empty.
    async fn on_drained(&self) {}
}

pub type SharedHandlers = Arc<dyn WorkerEventHandlers>;

/// Logging-only handlers.
#[derive(Clone)]
pub struct DefaultHandlers {
    logger: SharedLogger,
}

impl DefaultHandlers {
    pub fn new(logger: SharedLogger) -> Self {
        Self { logger }
    }

    /// Handlers writing through `tracing`.
    pub fn tracing() -> Self {
        Self::new(TracingJobLogger::shared())
    }

    pub fn shared(logger: SharedLogger) -> SharedHandlers {
        Arc::new(Self::new(logger))
    }
}

#[async_trait]
impl WorkerEventHandlers for DefaultHandlers {
    async fn on_complete(&self, job: &Job) {
        self.logger.info(
            LogRecord::new("Job completed")
                .with("jobName", &job.name)
                .with("jobId", &job.id),
        );
    }

    async fn on_fail(&self, job: Option<&Job>, error: &str) {
        self.logger.error(
            LogRecord::new("Job failed")
                .with("jobId", job.map(|j| &j.id))
                .with("name", job.map(|j| &j.name))
                .with("details", error),
        );
    }

    async fn on_active(&self, job: &Job) {
        self.logger.info(
            LogRecord::new("Job active")
                .with("jobId", &job.id)
                .with("name", &job.name),
        );
    }

    async fn on_progress(&self, job: &Job, progress: &JsonValue) {
        self.logger.info(
            LogRecord::new("Job in progress")
                .with("jobId", &job.id)
                .with("name", &job.name)
                .with("progress", progress),
        );
    }

    async fn on_drained(&self) {
        self.logger
            .info(LogRecord::new("Worker has completed all jobs, no jobs left."));
    }
}

/// Default handlers plus a companion job on completion, so the result expires
/// after `ttl` unless it is read first.
#[derive(Clone)]
pub struct RemoveJobTtlHandlers {
    inner: DefaultHandlers,
    background: QueueManager,
    ttl: Duration,
}

impl RemoveJobTtlHandlers {
    pub fn new(logger: SharedLogger, background: QueueManager) -> Self {
        Self {
            inner: DefaultHandlers::new(logger),
            background,
            ttl: DEFAULT_REMOVE_JOB_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[async_trait]
impl WorkerEventHandlers for RemoveJobTtlHandlers {
    async fn on_complete(&self, job: &Job) {
        self.inner.on_complete(job).await;
        if let Err(e) = QueueManager::remove_expired_job(job, &self.background, self.ttl).await {
            self.inner.logger.error(
                LogRecord::new("Error in onCompleteRemoveJobTTL")
                    .with("jobId", &job.id)
                    .with("details", e.to_string()),
            );
        }
    }

    async fn on_fail(&self, job: Option<&Job>, error: &str) {
        self.inner.on_fail(job, error).await;
    }

    async fn on_active(&self, job: &Job) {
        self.inner.on_active(job).await;
    }

    async fn on_progress(&self, job: &Job, progress: &JsonValue) {
        self.inner.on_progress(job, progress).await;
    }

    async fn on_drained(&self) {
        self.inner.on_drained().await;
    }
}
