use std::time::Duration;

use serde::Deserialize;

/// Controls how work is batched, how many jobs run at once, and how failures are retried.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerBehavior {
    /// The maximum number of work units in one regular job.
    pub units_per_batch: usize,
    /// The maximum number of jobs to keep outstanding at once. Leave this as `None` to leave the
    /// limits to the execution backend.
    pub max_concurrent_jobs: Option<usize>,
    pub retry: RetryPolicy,
    /// Once a workflow has no work left, merge its remaining outputs even if they are smaller
    /// than the merge size.
    pub flush_on_exhaustion: bool,
    /// How long the run loop waits before asking for work again when nothing was claimable.
    pub poll_interval_ms: u64,
}

impl Default for SchedulerBehavior {
    fn default() -> Self {
        Self {
            units_per_batch: 10,
            max_concurrent_jobs: None,
            retry: RetryPolicy::default(),
            flush_on_exhaustion: true,
            poll_interval_ms: 1000,
        }
    }
}

impl SchedulerBehavior {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// When a failed work unit may be claimed again.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// The maximum number of attempts per work unit. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Delay before the first retry. Each further failure doubles it.
    pub backoff_base_secs: u64,
    /// Upper bound of the retry delay.
    pub backoff_max_secs: Option<u64>,
}

impl RetryPolicy {
    /// True if a unit that has failed `attempts` times may run again.
    pub fn eligible(&self, attempts: u32) -> bool {
        self.max_attempts.map(|max| attempts < max).unwrap_or(true)
    }

    /// The attempt cap as stored in the database, where "unlimited" is the largest integer.
    pub(crate) fn attempt_cap(&self) -> i64 {
        self.max_attempts.map(i64::from).unwrap_or(i64::MAX)
    }

    /// How long to wait after the `attempts`-th failure before the unit may be claimed again.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if self.backoff_base_secs == 0 || attempts == 0 {
            return Duration::ZERO;
        }

        let exponent = (attempts - 1).min(32);
        let secs = self.backoff_base_secs.saturating_mul(1u64 << exponent);
        let secs = self
            .backoff_max_secs
            .map(|max| secs.min(max))
            .unwrap_or(secs);
        Duration::from_secs(secs)
    }
}
