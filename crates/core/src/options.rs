//! Submission options and retention policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default repeat pattern for recurring jobs: top of every hour.
pub const DEFAULT_REPEAT_PATTERN: &str = "0 0 * * * *";

/// Retention policy applied when a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepJobs {
    /// Remove the job as soon as it finishes.
    Remove,
    /// Keep the job indefinitely.
    Keep,
    /// Keep finished jobs up to an age and/or a count, newest first.
    Retain {
        #[serde(default, with = "crate::serde_ms::option")]
        age: Option<Duration>,
        #[serde(default)]
        count: Option<usize>,
    },
}

impl KeepJobs {
    pub fn retain_for(age: Duration) -> Self {
        Self::Retain {
            age: Some(age),
            count: None,
        }
    }

    pub fn retain_last(count: usize) -> Self {
        Self::Retain {
            age: None,
            count: Some(count),
        }
    }

    pub fn removes_immediately(&self) -> bool {
        matches!(self, Self::Remove) || matches!(self, Self::Retain { count: Some(0), .. })
    }
}

/// Repeat rule attached to a recurring job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatOptions {
    /// Cron pattern; six fields (with seconds) or the classic five.
    pub pattern: String,
}

impl RepeatOptions {
    pub fn cron(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }
}

/// Per-job submission options.
///
/// Every field is optional so option sets can be layered: `a.merge(b)` keeps
/// `a`'s values wherever `b` leaves a field unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total delivery attempts (first run included).
    #[serde(default)]
    pub attempts: Option<u32>,
    /// Time before the job becomes visible to workers.
    #[serde(default, with = "crate::serde_ms::option")]
    pub delay: Option<Duration>,
    #[serde(default)]
    pub remove_on_complete: Option<KeepJobs>,
    #[serde(default)]
    pub remove_on_fail: Option<KeepJobs>,
    #[serde(default)]
    pub repeat: Option<RepeatOptions>,
}

impl JobOptions {
    /// Layer `overrides` on top of `self`.
    pub fn merge(&self, overrides: &JobOptions) -> JobOptions {
        JobOptions {
            attempts: overrides.attempts.or(self.attempts),
            delay: overrides.delay.or(self.delay),
            remove_on_complete: overrides
                .remove_on_complete
                .clone()
                .or_else(|| self.remove_on_complete.clone()),
            remove_on_fail: overrides
                .remove_on_fail
                .clone()
                .or_else(|| self.remove_on_fail.clone()),
            repeat: overrides.repeat.clone().or_else(|| self.repeat.clone()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_remove_on_complete(mut self, keep: KeepJobs) -> Self {
        self.remove_on_complete = Some(keep);
        self
    }

    pub fn with_remove_on_fail(mut self, keep: KeepJobs) -> Self {
        self.remove_on_fail = Some(keep);
        self
    }

    pub fn with_repeat(mut self, repeat: RepeatOptions) -> Self {
        self.repeat = Some(repeat);
        self
    }

    /// Delay, or zero when unset.
    pub fn delay_or_zero(&self) -> Duration {
        self.delay.unwrap_or(Duration::ZERO)
    }

    /// Attempts, never less than one.
    pub fn attempts_or_default(&self) -> u32 {
        self.attempts.unwrap_or(1).max(1)
    }
}
