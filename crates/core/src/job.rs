//! Job model as observed by the orchestration layer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::data::JobData;
use crate::error::{QueueError, QueueResult};
use crate::id::JobId;
use crate::options::JobOptions;

/// Engine-reported job state.
///
/// Transitions are driven by the engine. The orchestration layer only observes
/// them, and mutates jobs exclusively through remove/cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    /// The engine could not classify the job.
    Unknown,
}

impl JobState {
    /// States scanned first when looking a job up by name.
    pub const PENDING: [JobState; 3] = [JobState::Delayed, JobState::Waiting, JobState::Active];

    /// States scanned only when no pending job matched.
    pub const FINISHED: [JobState; 2] = [JobState::Completed, JobState::Failed];

    pub fn is_pending(self) -> bool {
        matches!(self, Self::Waiting | Self::Delayed | Self::Active)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "waiting" | "wait" => Self::Waiting,
            "delayed" => Self::Delayed,
            "active" => Self::Active,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Unknown,
        })
    }
}

/// A request to put a job on a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub data: JobData,
    #[serde(default)]
    pub opts: JobOptions,
}

impl NewJob {
    pub fn new(name: impl Into<String>, data: JobData) -> Self {
        Self {
            name: name.into(),
            data,
            opts: JobOptions::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.opts.delay = Some(delay);
        self
    }

    pub fn with_options(mut self, opts: JobOptions) -> Self {
        self.opts = opts;
        self
    }

    /// A job must carry a non-empty name.
    pub fn validate(&self) -> QueueResult<()> {
        if self.name.trim().is_empty() {
            return Err(QueueError::MissingJobName);
        }
        Ok(())
    }
}

/// Snapshot of an engine-owned job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub queue_name: String,
    pub data: JobData,
    /// Effective options the job was submitted with.
    pub opts: JobOptions,
    /// When the job was enqueued.
    pub timestamp: DateTime<Utc>,
    #[serde(with = "crate::serde_ms")]
    pub delay: Duration,
    /// When a worker picked the job up (latest attempt).
    pub processed_on: Option<DateTime<Utc>>,
    /// Set once the job reaches a terminal state.
    pub finished_on: Option<DateTime<Utc>>,
    pub attempts_made: u32,
    pub failed_reason: Option<String>,
    /// Only set when the job completed.
    pub return_value: Option<JsonValue>,
    pub progress: Option<JsonValue>,
}

impl Job {
    /// Build a fresh job snapshot as an engine would on submission.
    pub fn new(id: JobId, queue_name: impl Into<String>, request: NewJob) -> Self {
        let delay = request.opts.delay_or_zero();
        Self {
            id,
            name: request.name,
            queue_name: queue_name.into(),
            data: request.data,
            opts: request.opts,
            timestamp: Utc::now(),
            delay,
            processed_on: None,
            finished_on: None,
            attempts_made: 0,
            failed_reason: None,
            return_value: None,
            progress: None,
        }
    }

    /// Earliest instant a worker may pick the job up.
    pub fn visible_at(&self) -> DateTime<Utc> {
        self.timestamp + chrono::Duration::from_std(self.delay).unwrap_or_default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_on.is_some()
    }

    /// Time from enqueue to finish; `None` until the job finishes.
    ///
    /// Clock skew between the enqueuing and finishing hosts can make the raw
    /// difference negative; that is reported as zero.
    pub fn completion_time(&self) -> Option<Duration> {
        let finished = self.finished_on?;
        Some((finished - self.timestamp).to_std().unwrap_or(Duration::ZERO))
    }

    /// Whether another attempt is allowed after a failure.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.opts.attempts_or_default()
    }
}
