//! Worker process: consumes one service queue plus its background queue.
//!
//! Completed results expire after `JOBKEEPER_RESULT_TTL_SECS` unless read
//! first. Runs until ctrl-c, then drains both workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;

use jobkeeper_core::{JobData, JobOptions, KeepJobs, SharedLogger, TracingJobLogger};
use jobkeeper_engine::SharedEngine;
use jobkeeper_infra::EngineConfig;
use jobkeeper_queue::{
    DefaultHandlers, ExpiredJobReaper, JobContext, QueueManager, RemoveJobTtlHandlers, ServiceJob,
    WorkerManager, WorkerOptions,
};

const QUEUE_VAR: &str = "JOBKEEPER_QUEUE";
const DEFAULT_QUEUE: &str = "jobs";

/// Background queue name for a service queue.
fn background_queue_name(service: &str) -> String {
    format!("{service}-background")
}

/// Primary queue options: completed results stay until read or until their
/// companion expires them.
fn primary_job_options() -> JobOptions {
    JobOptions::default().with_remove_on_complete(KeepJobs::Keep)
}

/// A service queue, its background queue, and the workers consuming both.
struct Service {
    primary: QueueManager,
    background: QueueManager,
    service_worker: WorkerManager,
    background_worker: WorkerManager,
}

impl Service {
    /// Build both queues, register log maintenance, and start both workers.
    async fn start(
        name: &str,
        engine: SharedEngine,
        logger: SharedLogger,
        result_ttl: Duration,
        worker_options: Option<WorkerOptions>,
    ) -> anyhow::Result<Self> {
        let primary = QueueManager::new(
            name,
            engine.clone(),
            logger.clone(),
            Some(primary_job_options()),
        );
        let background = QueueManager::new(
            background_queue_name(name),
            engine.clone(),
            logger.clone(),
            None,
        );

        let manage_logs = background.background_names().manage_logs.clone();
        background
            .add_recurring_job(&manage_logs, JobData::new(), None)
            .await
            .context("failed to register log maintenance job")?;

        let reaper = ExpiredJobReaper::new(primary.clone());
        let background_task = move |ctx: JobContext| {
            let reaper = reaper.clone();
            let manage_logs = manage_logs.clone();
            async move {
                if ctx.job().name == manage_logs {
                    tracing::info!(job_id = %ctx.job().id, "log maintenance tick");
                    return anyhow::Ok(json!({ "ok": true }));
                }
                reaper.run(ctx).await
            }
        };

        let echo = |ctx: JobContext| async move { anyhow::Ok(ctx.data().clone().into_value()) };

        let mut service_worker =
            WorkerManager::new(name, echo, engine.clone(), worker_options.clone());
        let mut background_worker = WorkerManager::new(
            background.name().to_string(),
            background_task,
            engine,
            worker_options,
        );

        service_worker.start_worker(Arc::new(
            RemoveJobTtlHandlers::new(logger.clone(), background.clone()).with_ttl(result_ttl),
        ));
        background_worker.start_worker(DefaultHandlers::shared(logger));

        Ok(Self {
            primary,
            background,
            service_worker,
            background_worker,
        })
    }

    async fn stop(&mut self) {
        self.service_worker.stop_worker().await;
        self.background_worker.stop_worker().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobkeeper_observability::init();

    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    let engine = config.build_engine().context("failed to build queue engine")?;
    let logger = TracingJobLogger::shared();

    let name = std::env::var(QUEUE_VAR).unwrap_or_else(|_| DEFAULT_QUEUE.to_string());
    let mut service = Service::start(&name, engine, logger, config.result_ttl, None).await?;

    tracing::info!(
        queue = %service.primary.name(),
        background = %service.background.name(),
        "workers running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutting down");
    service.stop().await;

    let stats = service.service_worker.stats();
    tracing::info!(
        processed = stats.jobs_processed,
        failed = stats.jobs_failed,
        "stopped"
    );
    Ok(())
}
