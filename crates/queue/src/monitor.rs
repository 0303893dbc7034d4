//! Worker scaling policy.
//!
//! Only the decision is implemented; nothing here starts or stops workers.

use serde::{Deserialize, Serialize};
use tracing::info;

use jobkeeper_core::QueueResult;

use crate::manager::QueueManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkforceParams {
    pub queue_size: usize,
    pub max_queue_size: usize,
    pub max_workers: usize,
    pub current_workers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDecision {
    ScaleUp,
    ScaleDown,
    Hold,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueMonitor;

impl QueueMonitor {
    pub fn new() -> Self {
        Self
    }

    /// Scale up when the backlog exceeds its cap and there is worker headroom;
    /// scale down when the backlog is at most half the cap and more than one
    /// worker runs. Scale-up wins if both hold.
    pub fn manage_scale_workers(&self, workforce: WorkforceParams) -> ScaleDecision {
        let WorkforceParams {
            queue_size,
            max_queue_size,
            max_workers,
            current_workers,
        } = workforce;

        let scale_up = queue_size > max_queue_size && current_workers < max_workers;
        let scale_down = queue_size.saturating_mul(2) <= max_queue_size && current_workers > 1;

        let decision = if scale_up {
            ScaleDecision::ScaleUp
        } else if scale_down {
            ScaleDecision::ScaleDown
        } else {
            ScaleDecision::Hold
        };

        match decision {
            ScaleDecision::ScaleUp => info!(?workforce, "Scaling up"),
            ScaleDecision::ScaleDown => info!(?workforce, "Scaling down"),
            ScaleDecision::Hold => {}
        }
        decision
    }

    /// Evaluate using the queue's current depth as `queue_size`.
    pub async fn evaluate_queue(
        &self,
        queue: &QueueManager,
        max_queue_size: usize,
        max_workers: usize,
        current_workers: usize,
    ) -> QueueResult<ScaleDecision> {
        let queue_size = queue.count().await?;
        Ok(self.manage_scale_workers(WorkforceParams {
            queue_size,
            max_queue_size,
            max_workers,
            current_workers,
        }))
    }
}
