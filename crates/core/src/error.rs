//! Caller-facing error kinds.

use thiserror::Error;

/// Result type used by the orchestration layer.
pub type QueueResult<T> = Result<T, QueueError>;

/// Coarse, stable error kinds surfaced to callers.
///
/// Engine detail never travels inside these variants. It is logged at the
/// failure site and the caller gets one of the kinds below.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// A job id was missing or blank.
    #[error("Missing jobId")]
    InvalidJobId,

    /// No job matched the given id or name.
    #[error("Job not found")]
    JobNotFound,

    /// The engine rejected a single or bulk submission.
    #[error("Job not added error")]
    JobNotAdded,

    /// A new job request carried no name.
    #[error("Missing job name")]
    MissingJobName,

    /// The engine failed on a read path (connection loss, bad reply).
    #[error("Queue engine error")]
    Engine,
}

impl QueueError {
    /// Caller input errors are surfaced immediately and never worth retrying.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::InvalidJobId | Self::MissingJobName)
    }
}
