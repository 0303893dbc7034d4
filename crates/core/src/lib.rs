//! `jobkeeper-core`: job model shared by engines and the orchestration layer.
//!
//! This crate is **pure model**: no I/O, no runtime. Engines own jobs; the types
//! here are the snapshots and requests that cross the engine boundary, plus the
//! caller-facing error kinds and the logging collaborator.

pub mod background;
pub mod data;
pub mod error;
pub mod id;
pub mod job;
pub mod log;
pub mod options;
pub mod receipt;
pub mod serde_ms;

pub use background::{companion_name, BackgroundJobNames, MANAGE_LOGS, REMOVE_EXPIRED_JOBS};
pub use data::{strip_identity, JobData, INITIATED_BY_KEY, USER_ID_KEY, WEBHOOK_URL_KEY};
pub use error::{QueueError, QueueResult};
pub use id::{JobId, WorkerId};
pub use job::{Job, JobState, NewJob};
pub use log::{JobLogger, LogLevel, LogRecord, MemoryJobLogger, SharedLogger, TracingJobLogger};
pub use options::{JobOptions, KeepJobs, RepeatOptions, DEFAULT_REPEAT_PATTERN};
pub use receipt::{JobReceipt, JobResult};
