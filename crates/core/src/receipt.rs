//! Caller-facing snapshots derived from engine jobs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::JobId;
use crate::job::{Job, JobState};

/// Point-in-time view of a job's queue-facing status.
///
/// Recomputed on every query and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReceipt {
    pub job_id: JobId,
    pub job_name: String,
    pub status: JobState,
    /// Queue depth (waiting + delayed) at query time.
    pub queue: usize,
    /// Enqueue timestamp.
    pub when: DateTime<Utc>,
    #[serde(with = "crate::serde_ms")]
    pub delay: Duration,
}

impl JobReceipt {
    pub fn from_job(job: &Job, status: JobState, queue: usize) -> Self {
        Self {
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            status,
            queue,
            when: job.timestamp,
            delay: job.delay,
        }
    }
}

/// Outcome of a result lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobState,
    /// Return value with caller identity stripped; `None` until completion.
    pub data: Option<JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::JobData;
    use crate::job::NewJob;

    #[test]
    fn receipt_copies_job_timing() {
        let job = Job::new(
            JobId::from(9u64),
            "reports",
            NewJob::new("build", JobData::new()).with_delay(Duration::from_millis(500)),
        );
        let receipt = JobReceipt::from_job(&job, JobState::Delayed, 3);

        assert_eq!(receipt.job_id, job.id);
        assert_eq!(receipt.job_name, "build");
        assert_eq!(receipt.when, job.timestamp);
        assert_eq!(receipt.delay, Duration::from_millis(500));
        assert_eq!(receipt.queue, 3);
    }

    #[test]
    fn receipt_wire_shape_is_camel_case() {
        let job = Job::new(JobId::from(1u64), "q", NewJob::new("n", JobData::new()));
        let json = serde_json::to_value(JobReceipt::from_job(&job, JobState::Waiting, 0)).unwrap();
        assert_eq!(json["jobId"], "1");
        assert_eq!(json["jobName"], "n");
        assert_eq!(json["status"], "waiting");
        assert_eq!(json["delay"], 0);
    }
}
