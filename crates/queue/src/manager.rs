//! Producer-side orchestration over a single named queue.

use std::fmt::Display;
use std::time::Duration;

use futures::future::try_join_all;
use tracing::debug;

use jobkeeper_core::{
    BackgroundJobNames, Job, JobData, JobId, JobOptions, JobReceipt, JobResult, JobState, KeepJobs,
    LogRecord, NewJob, QueueError, QueueResult, RepeatOptions, SharedLogger, DEFAULT_REPEAT_PATTERN,
    strip_identity,
};
use jobkeeper_engine::{EngineError, EngineResult, SharedEngine};

/// Age after which failed jobs are pruned by default.
pub const DEFAULT_FAILED_RETENTION: Duration = Duration::from_secs(3600);

/// Producer handle bound to one named queue.
///
/// Holds no job state of its own; every call goes to the engine. Cloning is
/// cheap and clones share the same engine and logger.
#[derive(Clone)]
pub struct QueueManager {
    queue_name: String,
    engine: SharedEngine,
    job_options: JobOptions,
    logger: SharedLogger,
    background_names: BackgroundJobNames,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("queue_name", &self.queue_name)
            .field("job_options", &self.job_options)
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    /// Options applied to every submission unless the caller overrides them:
    /// one attempt, completed jobs removed at once, failed jobs kept an hour.
    pub fn default_job_options() -> JobOptions {
        JobOptions {
            attempts: Some(1),
            remove_on_complete: Some(KeepJobs::Remove),
            remove_on_fail: Some(KeepJobs::retain_for(DEFAULT_FAILED_RETENTION)),
            ..JobOptions::default()
        }
    }

    pub fn new(
        service_name: impl Into<String>,
        engine: SharedEngine,
        logger: SharedLogger,
        job_options: Option<JobOptions>,
    ) -> Self {
        let defaults = Self::default_job_options();
        let job_options = match job_options {
            Some(overrides) => defaults.merge(&overrides),
            None => defaults,
        };

        Self {
            queue_name: service_name.into(),
            engine,
            job_options,
            logger,
            background_names: BackgroundJobNames::default(),
        }
    }

    /// Replace the background job name table used for companion jobs.
    pub fn with_background_names(mut self, names: BackgroundJobNames) -> Self {
        self.background_names = names;
        self
    }

    pub fn name(&self) -> &str {
        &self.queue_name
    }

    pub fn job_options(&self) -> &JobOptions {
        &self.job_options
    }

    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    pub fn logger(&self) -> &SharedLogger {
        &self.logger
    }

    pub fn background_names(&self) -> &BackgroundJobNames {
        &self.background_names
    }

    /// Log an engine or connection error against this queue.
    pub fn on_queue_error(&self, error: &dyn Display) {
        self.logger.error(
            LogRecord::new("Queue error")
                .with("queue", &self.queue_name)
                .with("details", error.to_string()),
        );
    }

    fn engine_error(&self, error: EngineError) -> QueueError {
        self.on_queue_error(&error);
        QueueError::Engine
    }

    fn with_defaults(&self, job: NewJob) -> NewJob {
        let opts = self.job_options.merge(&job.opts);
        job.with_options(opts)
    }

    async fn receipt_for(&self, job: &Job) -> EngineResult<JobReceipt> {
        let (status, depth) = futures::try_join!(
            self.engine.get_state(&self.queue_name, &job.id),
            self.engine.count(&self.queue_name),
        )?;
        Ok(JobReceipt::from_job(job, status, depth))
    }

    async fn receipts_for(&self, jobs: &[Job]) -> EngineResult<Vec<JobReceipt>> {
        try_join_all(jobs.iter().map(|job| self.receipt_for(job))).await
    }

    /// Build a receipt for a job handle from its current state and the queue depth.
    pub async fn get_job_receipt(&self, job: &Job) -> QueueResult<JobReceipt> {
        self.receipt_for(job).await.map_err(|e| self.engine_error(e))
    }

    /// Receipts for several jobs, read concurrently, in input order.
    pub async fn get_job_receipts(&self, jobs: &[Job]) -> QueueResult<Vec<JobReceipt>> {
        self.receipts_for(jobs).await.map_err(|e| self.engine_error(e))
    }

    fn not_added(&self, error: EngineError) -> QueueError {
        self.logger.error(
            LogRecord::new(QueueError::JobNotAdded.to_string())
                .with("queue", &self.queue_name)
                .with("details", error.to_string()),
        );
        QueueError::JobNotAdded
    }

    /// Submit one job with the queue's default options merged under the
    /// caller's.
    pub async fn add_to_queue(&self, new_job: NewJob) -> QueueResult<JobReceipt> {
        new_job.validate()?;
        let request = self.with_defaults(new_job);

        let submitted = async {
            let job = self.engine.add(&self.queue_name, request).await?;
            self.receipt_for(&job).await
        };
        submitted.await.map_err(|e| self.not_added(e))
    }

    /// Submit several jobs in one bulk call. Any failure fails the whole batch.
    pub async fn add_batch_to_queue(&self, new_jobs: Vec<NewJob>) -> QueueResult<Vec<JobReceipt>> {
        for job in &new_jobs {
            job.validate()?;
        }
        let requests: Vec<NewJob> = new_jobs.into_iter().map(|job| self.with_defaults(job)).collect();

        let submitted = async {
            let jobs = self.engine.add_bulk(&self.queue_name, requests).await?;
            self.receipts_for(&jobs).await
        };
        submitted.await.map_err(|e| self.not_added(e))
    }

    /// Queue depth (waiting + delayed).
    pub async fn count(&self) -> QueueResult<usize> {
        self.engine
            .count(&self.queue_name)
            .await
            .map_err(|e| self.engine_error(e))
    }

    pub async fn get_job(&self, job_id: &JobId) -> QueueResult<Option<Job>> {
        self.engine
            .get_job(&self.queue_name, job_id)
            .await
            .map_err(|e| self.engine_error(e))
    }

    /// Remove a job only if it has finished. Returns whether anything was removed.
    pub async fn remove_completed_job(&self, job_id: &JobId) -> QueueResult<bool> {
        let Some(job) = self.get_job(job_id).await? else {
            return Ok(false);
        };
        if !job.is_finished() {
            return Ok(false);
        }
        self.engine
            .remove(&self.queue_name, job_id)
            .await
            .map_err(|e| self.engine_error(e))?;
        Ok(true)
    }

    /// Fetch a job's status and identity-stripped return value.
    ///
    /// A completed job is removed as part of the read, together with its
    /// pending companion on `background_queue` when one is given.
    pub async fn get_results(
        &self,
        job_id: &JobId,
        background_queue: Option<&QueueManager>,
    ) -> QueueResult<JobResult> {
        if job_id.is_empty() {
            return Err(QueueError::InvalidJobId);
        }

        let job = self.get_job(job_id).await?.ok_or(QueueError::JobNotFound)?;
        let status = self
            .engine
            .get_state(&self.queue_name, job_id)
            .await
            .map_err(|e| self.engine_error(e))?;

        if status == JobState::Completed {
            self.remove_completed_job(job_id).await?;
            if let Some(background) = background_queue {
                QueueManager::cancel_pending_background_job(&job, background).await?;
            }
        }

        Ok(JobResult {
            status,
            data: job.return_value.map(strip_identity),
        })
    }

    /// Register a recurring job unless a job with this name already exists.
    ///
    /// The existence check and the submission are separate engine calls, so
    /// two concurrent registrations can both pass the check.
    pub async fn add_recurring_job(
        &self,
        name: &str,
        data: JobData,
        pattern: Option<&str>,
    ) -> QueueResult<()> {
        let request = NewJob::new(name, data);
        request.validate()?;

        if self.find_job_by_name(name).await?.is_some() {
            self.logger
                .info(LogRecord::new("Recurring job already exists.").with("name", name));
            return Ok(());
        }

        let pattern = pattern.unwrap_or(DEFAULT_REPEAT_PATTERN);
        let request =
            request.with_options(JobOptions::default().with_repeat(RepeatOptions::cron(pattern)));
        self.engine
            .add(&self.queue_name, request)
            .await
            .map_err(|e| self.not_added(e))?;

        self.logger.info(
            LogRecord::new("Added recurring job")
                .with("name", name)
                .with("pattern", pattern),
        );
        Ok(())
    }

    /// First job named `name`, preferring pending jobs over finished ones.
    pub async fn find_job_by_name(&self, name: &str) -> QueueResult<Option<Job>> {
        for states in [&JobState::PENDING[..], &JobState::FINISHED[..]] {
            let jobs = self
                .engine
                .get_jobs(&self.queue_name, states)
                .await
                .map_err(|e| self.engine_error(e))?;
            if let Some(job) = jobs.into_iter().find(|job| job.name == name) {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn try_cancel(&self, job: Option<Job>) -> Result<Job, String> {
        let job = job.ok_or_else(|| QueueError::JobNotFound.to_string())?;
        self.engine
            .remove(&self.queue_name, &job.id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(job)
    }

    /// Best-effort removal by id. Failures are logged, never returned.
    pub async fn cancel_job(&self, job_id: &JobId) {
        let lookup = self.get_job(job_id).await.map_err(|e| e.to_string());
        let outcome = match lookup {
            Ok(job) => self.try_cancel(job).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(job) => self.logger.info(
                LogRecord::new("Cancelled job")
                    .with("jobId", job_id)
                    .with("jobName", &job.name),
            ),
            Err(details) => self.logger.error(
                LogRecord::new("Error cancelling job")
                    .with("jobId", job_id)
                    .with("details", details),
            ),
        }
    }

    /// Best-effort removal of the first job found by name.
    pub async fn cancel_job_by_name(&self, name: &str) {
        let lookup = self.find_job_by_name(name).await.map_err(|e| e.to_string());
        let outcome = match lookup {
            Ok(job) => self.try_cancel(job).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(job) => {
                debug!(queue = %self.queue_name, job_id = %job.id, "cancelled job by name");
                self.logger
                    .info(LogRecord::new("Cancelled job").with("jobName", name));
            }
            Err(details) => self.logger.error(
                LogRecord::new("Error cancelling job")
                    .with("jobName", name)
                    .with("details", details),
            ),
        }
    }

    /// Time from enqueue to finish; `None` if the job is missing or unfinished.
    pub async fn get_job_completion_time(&self, job_id: &JobId) -> QueueResult<Option<Duration>> {
        Ok(self
            .get_job(job_id)
            .await?
            .and_then(|job| job.completion_time()))
    }
}
