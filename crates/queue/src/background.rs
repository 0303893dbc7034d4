//! Companion jobs that expire a primary job's result.
//!
//! When a primary job completes, a companion is queued on a background queue
//! with a delay equal to the result TTL. If the result is read first, the
//! companion is cancelled; otherwise [`ExpiredJobReaper`] removes the primary
//! when the companion comes due. The two are linked only by the companion's
//! name (see [`companion_name`]).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::debug;

use jobkeeper_core::{Job, JobData, JobId, JobReceipt, NewJob, QueueResult, companion_name};

use crate::manager::QueueManager;
use crate::worker::{JobContext, ServiceJob};

/// Payload key carrying the primary job id.
pub const PRIMARY_JOB_ID_KEY: &str = "jobId";

impl QueueManager {
    /// Companion name for `job` under this manager's background name table.
    pub fn get_background_job_name(&self, job: &Job) -> String {
        companion_name(
            &self.background_names().remove_expired_jobs,
            &job.id,
            &job.queue_name,
        )
    }

    /// Queue a companion on `background` that comes due after `ttl`.
    pub async fn remove_expired_job(
        job: &Job,
        background: &QueueManager,
        ttl: Duration,
    ) -> QueueResult<JobReceipt> {
        let companion = NewJob::new(
            background.get_background_job_name(job),
            JobData::new().with(PRIMARY_JOB_ID_KEY, job.id.as_str()),
        )
        .with_delay(ttl);
        background.add_to_queue(companion).await
    }

    /// Cancel `job`'s companion on `background`, if one exists.
    pub async fn cancel_pending_background_job(
        job: &Job,
        background: &QueueManager,
    ) -> QueueResult<()> {
        let name = background.get_background_job_name(job);
        if let Some(companion) = background.find_job_by_name(&name).await? {
            background.cancel_job(&companion.id).await;
        }
        Ok(())
    }
}

/// Task for the background queue: removes the primary job named in a
/// companion's payload. An unfinished primary is left alone.
#[derive(Debug, Clone)]
pub struct ExpiredJobReaper {
    primary: QueueManager,
}

impl ExpiredJobReaper {
    pub fn new(primary: QueueManager) -> Self {
        Self { primary }
    }
}

#[async_trait]
impl ServiceJob for ExpiredJobReaper {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<JsonValue> {
        let primary_id = ctx
            .job()
            .data
            .get_str(PRIMARY_JOB_ID_KEY)
            .map(JobId::new)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Missing jobId"))?;

        let removed = self.primary.remove_completed_job(&primary_id).await?;
        debug!(queue = %self.primary.name(), job_id = %primary_id, removed, "reaped expired job");
        Ok(json!({ "removed": removed }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use jobkeeper_core::{BackgroundJobNames, JobOptions, JobState, KeepJobs, MemoryJobLogger};
    use jobkeeper_engine::{QueueEngine, SharedEngine};
    use jobkeeper_infra::InMemoryEngine;

    struct Pair {
        engine: Arc<InMemoryEngine>,
        primary: QueueManager,
        background: QueueManager,
    }

    fn pair() -> Pair {
        let engine = InMemoryEngine::arc();
        let logger = MemoryJobLogger::arc();
        let keep = JobOptions::default().with_remove_on_complete(KeepJobs::Keep);
        let primary = QueueManager::new("reports", engine.clone(), logger.clone(), Some(keep));
        let background = QueueManager::new("background", engine.clone(), logger, None);
        Pair {
            engine,
            primary,
            background,
        }
    }

    async fn completed_primary(pair: &Pair) -> Job {
        pair.primary
            .add_to_queue(NewJob::new("build-report", JobData::new()))
            .await
            .unwrap();
        let job = pair.engine.claim_next("reports").await.unwrap().unwrap();
        pair.engine
            .complete("reports", &job.id, json!({"url": "s3://r"}))
            .await
            .unwrap()
    }

    #[test]
    fn background_name_uses_primary_queue() {
        let p = pair();
        let job = Job::new(JobId::from(5u64), "reports", NewJob::new("x", JobData::new()));
        assert_eq!(
            p.background.get_background_job_name(&job),
            "remove-expired-jobs-5-reports"
        );
    }

    #[tokio::test]
    async fn companion_is_delayed_by_ttl() {
        let p = pair();
        let primary = completed_primary(&p).await;

        let ttl = Duration::from_secs(1800);
        let receipt = QueueManager::remove_expired_job(&primary, &p.background, ttl)
            .await
            .unwrap();

        assert_eq!(receipt.status, JobState::Delayed);
        assert_eq!(receipt.delay, ttl);
        assert_eq!(receipt.job_name, p.background.get_background_job_name(&primary));

        let companion = p.background.get_job(&receipt.job_id).await.unwrap().unwrap();
        assert_eq!(companion.data.get_str(PRIMARY_JOB_ID_KEY), Some(primary.id.as_str()));
    }

    #[tokio::test]
    async fn early_retrieval_cancels_companion() {
        let p = pair();
        let primary = completed_primary(&p).await;
        let receipt =
            QueueManager::remove_expired_job(&primary, &p.background, Duration::from_secs(60))
                .await
                .unwrap();

        let result = p.primary.get_results(&primary.id, Some(&p.background)).await.unwrap();
        assert_eq!(result.status, JobState::Completed);

        assert!(p.primary.get_job(&primary.id).await.unwrap().is_none());
        assert!(p.background.get_job(&receipt.job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn custom_name_table_links_companion_and_retrieval() {
        let mut p = pair();
        p.background = p.background.clone().with_background_names(BackgroundJobNames {
            remove_expired_jobs: "expire-result".to_string(),
            ..BackgroundJobNames::default()
        });
        let primary = completed_primary(&p).await;

        let receipt =
            QueueManager::remove_expired_job(&primary, &p.background, Duration::from_secs(60))
                .await
                .unwrap();
        assert_eq!(receipt.job_name, format!("expire-result-{}-reports", primary.id));

        p.primary.get_results(&primary.id, Some(&p.background)).await.unwrap();
        assert!(p.background.get_job(&receipt.job_id).await.unwrap().is_none());
        assert!(p.background.find_job_by_name(&receipt.job_name).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retrieval_without_background_queue_leaves_companion() {
        let p = pair();
        let primary = completed_primary(&p).await;
        let receipt =
            QueueManager::remove_expired_job(&primary, &p.background, Duration::from_secs(60))
                .await
                .unwrap();

        p.primary.get_results(&primary.id, None).await.unwrap();
        assert!(p.background.get_job(&receipt.job_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cancelling_without_companion_is_a_no_op() {
        let p = pair();
        let primary = completed_primary(&p).await;
        QueueManager::cancel_pending_background_job(&primary, &p.background)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reaper_removes_finished_primary_only() {
        let p = pair();
        let shared: SharedEngine = p.engine.clone();
        let reaper = ExpiredJobReaper::new(p.primary.clone());

        let finished = completed_primary(&p).await;
        let companion = Job::new(
            JobId::from(100u64),
            "background",
            NewJob::new("c", JobData::new().with(PRIMARY_JOB_ID_KEY, finished.id.as_str())),
        );
        let out = reaper
            .run(JobContext::detached(companion, shared.clone()))
            .await
            .unwrap();
        assert_eq!(out, json!({"removed": true}));
        assert!(p.primary.get_job(&finished.id).await.unwrap().is_none());

        let pending = p
            .primary
            .add_to_queue(NewJob::new("still-running", JobData::new()))
            .await
            .unwrap();
        let companion = Job::new(
            JobId::from(101u64),
            "background",
            NewJob::new("c", JobData::new().with(PRIMARY_JOB_ID_KEY, pending.job_id.as_str())),
        );
        let out = reaper
            .run(JobContext::detached(companion, shared))
            .await
            .unwrap();
        assert_eq!(out, json!({"removed": false}));
        assert!(p.primary.get_job(&pending.job_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reaper_rejects_payload_without_id() {
        let p = pair();
        let reaper = ExpiredJobReaper::new(p.primary.clone());
        let companion = Job::new(JobId::from(1u64), "background", NewJob::new("c", JobData::new()));

        let err = reaper
            .run(JobContext::detached(companion, p.engine.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Missing jobId");
    }
}
