//! Consumer side: binds one task to a queue and runs it on claimed jobs.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use jobkeeper_core::{Job, JobData, WorkerId};
use jobkeeper_engine::SharedEngine;

use crate::events::SharedHandlers;

/// Per-minute data points kept for two weeks.
pub const TWO_WEEKS_OF_MINUTES: usize = 2 * 7 * 24 * 60;

/// Shortest rate-limit window; a zero window would never make the loop wait.
const MIN_LIMIT_WINDOW: Duration = Duration::from_millis(1);

/// Task run for every job on a queue.
#[async_trait]
pub trait ServiceJob: Send + Sync + 'static {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<JsonValue>;
}

#[async_trait]
impl<F, Fut> ServiceJob for F
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<JsonValue>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> anyhow::Result<JsonValue> {
        (self)(ctx).await
    }
}

/// What a task sees of the job it is running.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    engine: SharedEngine,
    handlers: Option<SharedHandlers>,
}

impl JobContext {
    fn new(job: Job, engine: SharedEngine, handlers: SharedHandlers) -> Self {
        Self {
            job,
            engine,
            handlers: Some(handlers),
        }
    }

    /// Context outside a running worker; progress updates reach the engine
    /// but fire no callbacks.
    pub fn detached(job: Job, engine: SharedEngine) -> Self {
        Self {
            job,
            engine,
            handlers: None,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn data(&self) -> &JobData {
        &self.job.data
    }

    /// Record progress on the job and fire the progress callback.
    pub async fn update_progress(&self, progress: JsonValue) -> anyhow::Result<()> {
        self.engine
            .update_progress(&self.job.queue_name, &self.job.id, progress.clone())
            .await?;
        if let Some(handlers) = &self.handlers {
            handlers.on_progress(&self.job, &progress).await;
        }
        Ok(())
    }
}

/// At most `max` jobs started per `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimit {
    pub max: u32,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsOptions {
    pub max_data_points: usize,
}

/// Worker tuning. Unset fields fall back to [`WorkerManager::default_worker_options`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOptions {
    pub concurrency: Option<usize>,
    pub limiter: Option<RateLimit>,
    pub metrics: Option<MetricsOptions>,
    /// Sleep between claims when the queue is empty.
    pub poll_interval: Option<Duration>,
}

impl WorkerOptions {
    /// Field-wise merge; set fields in `overrides` win.
    pub fn merge(&self, overrides: &WorkerOptions) -> WorkerOptions {
        WorkerOptions {
            concurrency: overrides.concurrency.or(self.concurrency),
            limiter: overrides.limiter.or(self.limiter),
            metrics: overrides.metrics.or(self.metrics),
            poll_interval: overrides.poll_interval.or(self.poll_interval),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_limiter(mut self, max: u32, duration: Duration) -> Self {
        self.limiter = Some(RateLimit { max, duration });
        self
    }

    pub fn with_max_data_points(mut self, max_data_points: usize) -> Self {
        self.metrics = Some(MetricsOptions { max_data_points });
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }
}

/// Resolved options the loop runs with.
#[derive(Debug, Clone, Copy)]
struct WorkerSettings {
    concurrency: usize,
    limiter: RateLimit,
    max_data_points: usize,
    poll_interval: Duration,
}

impl From<&WorkerOptions> for WorkerSettings {
    fn from(opts: &WorkerOptions) -> Self {
        let defaults = WorkerManager::default_worker_options();
        let opts = defaults.merge(opts);
        let limiter = opts.limiter.unwrap_or(RateLimit {
            max: 10,
            duration: Duration::from_secs(1),
        });
        Self {
            concurrency: opts.concurrency.unwrap_or(1).max(1),
            limiter: RateLimit {
                max: limiter.max.max(1),
                duration: limiter.duration.max(MIN_LIMIT_WINDOW),
            },
            max_data_points: opts.metrics.map_or(TWO_WEEKS_OF_MINUTES, |m| m.max_data_points),
            poll_interval: opts.poll_interval.unwrap_or(Duration::from_millis(100)),
        }
    }
}

/// Fixed-window limiter.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    limit: RateLimit,
    window_start: Instant,
    used: u32,
}

impl RateLimiter {
    pub(crate) fn new(limit: RateLimit, now: Instant) -> Self {
        Self {
            limit,
            window_start: now,
            used: 0,
        }
    }

    /// Take a slot, or return how long until the window resets.
    pub(crate) fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= self.limit.duration {
            self.window_start = now;
            self.used = 0;
        }
        if self.used < self.limit.max {
            self.used += 1;
            return Ok(());
        }
        Err(self.limit.duration.saturating_sub(elapsed))
    }

    /// Give back a slot that was not used.
    pub(crate) fn release(&mut self) {
        self.used = self.used.saturating_sub(1);
    }
}

/// Completed or failed count for one minute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricPoint {
    pub minute: DateTime<Utc>,
    pub count: u64,
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub current_running: usize,
    pub completed: VecDeque<MetricPoint>,
    pub failed: VecDeque<MetricPoint>,
}

fn record_point(points: &mut VecDeque<MetricPoint>, at: DateTime<Utc>, cap: usize) {
    let minute = at.duration_trunc(chrono::Duration::minutes(1)).unwrap_or(at);
    match points.back_mut() {
        Some(last) if last.minute == minute => last.count += 1,
        _ => points.push_back(MetricPoint { minute, count: 1 }),
    }
    while points.len() > cap {
        points.pop_front();
    }
}

impl WorkerStats {
    fn record_success(&mut self, at: DateTime<Utc>, cap: usize) {
        self.jobs_processed += 1;
        self.jobs_succeeded += 1;
        record_point(&mut self.completed, at, cap);
    }

    fn record_failure(&mut self, at: DateTime<Utc>, cap: usize) {
        self.jobs_processed += 1;
        self.jobs_failed += 1;
        record_point(&mut self.failed, at, cap);
    }
}

type SharedStats = Arc<Mutex<WorkerStats>>;

fn update_stats(stats: &SharedStats, f: impl FnOnce(&mut WorkerStats)) {
    let mut guard = stats.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard);
}

struct RunningWorker {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Everything a job execution needs, cloned into each spawned task.
#[derive(Clone)]
struct Runner {
    queue: String,
    worker_id: WorkerId,
    engine: SharedEngine,
    task: Arc<dyn ServiceJob>,
    handlers: SharedHandlers,
    stats: SharedStats,
    max_data_points: usize,
}

/// Sole consumer logic for one named queue.
pub struct WorkerManager {
    queue_name: String,
    worker_id: WorkerId,
    engine: SharedEngine,
    task: Arc<dyn ServiceJob>,
    options: WorkerOptions,
    stats: SharedStats,
    running: Option<RunningWorker>,
}

impl std::fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerManager")
            .field("queue_name", &self.queue_name)
            .field("worker_id", &self.worker_id)
            .field("options", &self.options)
            .field("running", &self.running.is_some())
            .finish_non_exhaustive()
    }
}

impl WorkerManager {
    /// Concurrency 1, 10 jobs per second, two weeks of per-minute metrics.
    pub fn default_worker_options() -> WorkerOptions {
        WorkerOptions {
            concurrency: Some(1),
            limiter: Some(RateLimit {
                max: 10,
                duration: Duration::from_millis(1000),
            }),
            metrics: Some(MetricsOptions {
                max_data_points: TWO_WEEKS_OF_MINUTES,
            }),
            poll_interval: Some(Duration::from_millis(100)),
        }
    }

    pub fn new(
        service_name: impl Into<String>,
        task: impl ServiceJob,
        engine: SharedEngine,
        worker_options: Option<WorkerOptions>,
    ) -> Self {
        let defaults = Self::default_worker_options();
        let options = match worker_options {
            Some(overrides) => defaults.merge(&overrides),
            None => defaults,
        };

        Self {
            queue_name: service_name.into(),
            worker_id: WorkerId::new(),
            engine,
            task: Arc::new(task),
            options,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
            running: None,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start consuming the queue, reporting lifecycle events to `handlers`.
    ///
    /// Must be called from within a tokio runtime. Calling it on a running
    /// worker does nothing.
    pub fn start_worker(&mut self, handlers: SharedHandlers) {
        if self.running.is_some() {
            warn!(queue = %self.queue_name, worker_id = %self.worker_id, "worker already started");
            return;
        }

        let settings = WorkerSettings::from(&self.options);
        let runner = Runner {
            queue: self.queue_name.clone(),
            worker_id: self.worker_id,
            engine: self.engine.clone(),
            task: self.task.clone(),
            handlers,
            stats: self.stats.clone(),
            max_data_points: settings.max_data_points,
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(worker_loop(runner, settings, shutdown_rx));
        self.running = Some(RunningWorker { shutdown, join });
    }

    /// Stop claiming new jobs and wait for in-flight ones to finish.
    ///
    /// There is no forced kill: a task that never returns blocks this forever.
    pub async fn stop_worker(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        if let Err(e) = running.join.await {
            error!(queue = %self.queue_name, error = %e, "worker loop panicked");
        }
    }
}

async fn worker_loop(runner: Runner, settings: WorkerSettings, mut shutdown: watch::Receiver<bool>) {
    info!(
        queue = %runner.queue,
        worker_id = %runner.worker_id,
        concurrency = settings.concurrency,
        "worker started"
    );

    let mut in_flight: JoinSet<()> = JoinSet::new();
    let mut limiter = RateLimiter::new(settings.limiter, Instant::now());
    let mut had_work = false;

    loop {
        if *shutdown.borrow() || shutdown.has_changed().is_err() {
            break;
        }

        while let Some(joined) = in_flight.try_join_next() {
            log_join_error(&runner, joined);
        }

        if in_flight.len() >= settings.concurrency {
            tokio::select! {
                joined = in_flight.join_next() => {
                    if let Some(joined) = joined {
                        log_join_error(&runner, joined);
                    }
                }
                _ = shutdown.changed() => {}
            }
            continue;
        }

        if let Err(wait) = limiter.try_acquire(Instant::now()) {
            debug!(queue = %runner.queue, wait_ms = wait.as_millis() as u64, "rate limited");
            idle(&mut shutdown, wait).await;
            continue;
        }

        match runner.engine.claim_next(&runner.queue).await {
            Ok(Some(job)) => {
                had_work = true;
                debug!(queue = %runner.queue, job_id = %job.id, "claimed job");
                in_flight.spawn(runner.clone().process(job));
            }
            Ok(None) => {
                limiter.release();
                if had_work && in_flight.is_empty() {
                    had_work = false;
                    runner.handlers.on_drained().await;
                }
                idle(&mut shutdown, settings.poll_interval).await;
            }
            Err(e) => {
                limiter.release();
                error!(queue = %runner.queue, error = %e, "failed to claim job");
                runner.handlers.on_fail(None, &e.to_string()).await;
                idle(&mut shutdown, settings.poll_interval).await;
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        log_join_error(&runner, joined);
    }
    info!(queue = %runner.queue, worker_id = %runner.worker_id, "worker stopped");
}

async fn idle(shutdown: &mut watch::Receiver<bool>, wait: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(wait) => {}
        _ = shutdown.changed() => {}
    }
}

fn log_join_error(runner: &Runner, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(queue = %runner.queue, error = %e, "job task panicked");
    }
}

impl Runner {
    async fn process(self, job: Job) {
        update_stats(&self.stats, |s| s.current_running += 1);
        self.handlers.on_active(&job).await;

        let ctx = JobContext::new(job.clone(), self.engine.clone(), self.handlers.clone());
        let outcome = self.task.run(ctx).await;

        match outcome {
            Ok(value) => self.settle_success(&job, value).await,
            Err(err) => self.settle_failure(&job, format!("{err:#}")).await,
        }
        update_stats(&self.stats, |s| s.current_running = s.current_running.saturating_sub(1));
    }

    async fn settle_success(&self, job: &Job, value: JsonValue) {
        match self.engine.complete(&self.queue, &job.id, value).await {
            Ok(done) => {
                update_stats(&self.stats, |s| s.record_success(Utc::now(), self.max_data_points));
                self.handlers.on_complete(&done).await;
            }
            Err(e) => {
                error!(queue = %self.queue, job_id = %job.id, error = %e, "failed to complete job");
                update_stats(&self.stats, |s| s.record_failure(Utc::now(), self.max_data_points));
                self.handlers.on_fail(Some(job), &e.to_string()).await;
            }
        }
    }

    async fn settle_failure(&self, job: &Job, reason: String) {
        debug!(queue = %self.queue, job_id = %job.id, error = %reason, "job execution failed");
        update_stats(&self.stats, |s| s.record_failure(Utc::now(), self.max_data_points));

        match self.engine.fail(&self.queue, &job.id, &reason).await {
            Ok(failed) => self.handlers.on_fail(Some(&failed), &reason).await,
            Err(e) => {
                error!(queue = %self.queue, job_id = %job.id, error = %e, "failed to record job failure");
                self.handlers.on_fail(Some(job), &reason).await;
            }
        }
    }
}
