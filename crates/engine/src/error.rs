use thiserror::Error;

use jobkeeper_core::JobId;

/// Result type returned by engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine-level failure. Carries full detail for operators; the orchestration
/// layer logs it and maps it onto a coarse `QueueError`.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("engine connection error: {0}")]
    Connection(String),

    #[error("engine command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Removal refused because a worker currently holds the job.
    #[error("job {0} is locked by an active worker")]
    JobLocked(JobId),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("invalid repeat pattern `{pattern}`: {reason}")]
    InvalidRepeatPattern { pattern: String, reason: String },
}

impl EngineError {
    /// Whether the failure came from the transport rather than the request.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
