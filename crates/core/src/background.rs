//! Background job kinds and the companion-job naming rule.
//!
//! A companion job is linked to its primary job by name only: no mapping is
//! stored anywhere. [`companion_name`] is the single place that link is
//! defined; anything that needs to find a companion goes through it.

use serde::{Deserialize, Serialize};

use crate::id::JobId;

/// Companion job that expires a primary job's result after a TTL.
pub const REMOVE_EXPIRED_JOBS: &str = "remove-expired-jobs";

/// Recurring log maintenance job.
pub const MANAGE_LOGS: &str = "manage-logs";

/// Name table for background job kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundJobNames {
    pub remove_expired_jobs: String,
    pub manage_logs: String,
}

impl Default for BackgroundJobNames {
    fn default() -> Self {
        Self {
            remove_expired_jobs: REMOVE_EXPIRED_JOBS.to_string(),
            manage_logs: MANAGE_LOGS.to_string(),
        }
    }
}

/// `{kind}-{primary_id}-{primary_queue}`.
pub fn companion_name(kind: &str, primary_id: &JobId, primary_queue: &str) -> String {
    format!("{kind}-{primary_id}-{primary_queue}")
}
