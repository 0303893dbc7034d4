//! Structured log sink used by every job-layer component.
//!
//! Components receive a [`JobLogger`] at construction instead of reaching for a
//! process-wide logger. Records are `{message, ...context}` at info or error
//! severity; there is no schema beyond that.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

/// Severity of a [`LogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

/// A single structured log entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub message: String,
    #[serde(flatten)]
    pub context: Map<String, JsonValue>,
}

impl LogRecord {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: Map::new(),
        }
    }

    /// Attach a context field. Values that fail to serialize become `null`.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(JsonValue::Null);
        self.context.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.context.get(key)
    }
}

/// Log sink collaborator.
pub trait JobLogger: Send + Sync {
    fn info(&self, record: LogRecord);

    fn error(&self, record: LogRecord);
}

/// Shared handle to a log sink.
pub type SharedLogger = Arc<dyn JobLogger>;

impl<L> JobLogger for Arc<L>
where
    L: JobLogger + ?Sized,
{
    fn info(&self, record: LogRecord) {
        (**self).info(record)
    }

    fn error(&self, record: LogRecord) {
        (**self).error(record)
    }
}

/// Forwards records to `tracing` under the `jobkeeper::jobs` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingJobLogger;

impl TracingJobLogger {
    pub fn shared() -> SharedLogger {
        Arc::new(Self)
    }
}

impl JobLogger for TracingJobLogger {
    fn info(&self, record: LogRecord) {
        let context = JsonValue::Object(record.context);
        tracing::info!(target: "jobkeeper::jobs", context = %context, "{}", record.message);
    }

    fn error(&self, record: LogRecord) {
        let context = JsonValue::Object(record.context);
        tracing::error!(target: "jobkeeper::jobs", context = %context, "{}", record.message);
    }
}

/// Keeps records in memory. Used by tests and by callers that ship logs elsewhere.
#[derive(Debug, Default)]
pub struct MemoryJobLogger {
    records: Mutex<Vec<(LogLevel, LogRecord)>>,
}

impl MemoryJobLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn records(&self) -> Vec<(LogLevel, LogRecord)> {
        self.lock().clone()
    }

    /// Records at `level` whose message equals `message`.
    pub fn find(&self, level: LogLevel, message: &str) -> Vec<LogRecord> {
        self.lock()
            .iter()
            .filter(|(l, r)| *l == level && r.message == message)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn contains(&self, level: LogLevel, message: &str) -> bool {
        !self.find(level, message).is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn push(&self, level: LogLevel, record: LogRecord) {
        self.lock().push((level, record));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(LogLevel, LogRecord)>> {
        // A panic while holding the lock only loses the panicking record.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl JobLogger for MemoryJobLogger {
    fn info(&self, record: LogRecord) {
        self.push(LogLevel::Info, record);
    }

    fn error(&self, record: LogRecord) {
        self.push(LogLevel::Error, record);
    }
}
