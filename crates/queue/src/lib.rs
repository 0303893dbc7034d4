//! Job orchestration over a durable queue engine.
//!
//! - [`QueueManager`]: producer side (submit, inspect, cancel, results).
//! - [`WorkerManager`]: consumer side (one task per queue, lifecycle callbacks).
//! - [`background`]: companion jobs that expire results after a TTL.
//! - [`QueueMonitor`]: worker scaling decisions.

pub mod background;
pub mod events;
pub mod manager;
pub mod monitor;
pub mod worker;

#[cfg(test)]
mod testing;

pub use background::{ExpiredJobReaper, PRIMARY_JOB_ID_KEY};
pub use events::{
    DEFAULT_REMOVE_JOB_TTL, DefaultHandlers, RemoveJobTtlHandlers, SharedHandlers, WorkerEventHandlers,
};
pub use manager::{DEFAULT_FAILED_RETENTION, QueueManager};
pub use monitor::{QueueMonitor, ScaleDecision, WorkforceParams};
pub use worker::{
    JobContext, MetricPoint, MetricsOptions, RateLimit, ServiceJob, WorkerManager, WorkerOptions,
    WorkerStats,
};
