//! Reconnect backoff and failure streaks.

use std::time::Duration;

use camwatch_models::TaskId;
use tracing::{info, warn};

/// Reconnect schedule for a camera stream.
///
/// Attempt `n` (1-based) waits `min(n * step, max_delay)`. There is no
/// attempt past `max_attempts`; exceeding it is fatal for the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub step: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            step: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt`, or `None` once the cap is exceeded.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        Some(self.step.saturating_mul(attempt).min(self.max_delay))
    }
}

/// Consecutive-failure counter for per-frame loops.
///
/// The first `loud` failures of a streak are logged by the caller. The next
/// one emits a single notice and the rest stay quiet until a success ends
/// the streak.
#[derive(Debug, Clone)]
pub struct FailureStreak {
    task_id: TaskId,
    what: &'static str,
    length: u32,
    loud: u32,
}

impl FailureStreak {
    pub fn new(task_id: &TaskId, what: &'static str, loud: u32) -> Self {
        Self {
            task_id: task_id.clone(),
            what,
            length: 0,
            loud,
        }
    }

    /// Extend the streak. Returns whether the caller should log this failure.
    pub fn extend(&mut self) -> bool {
        self.length += 1;
        if self.length == self.loud + 1 {
            warn!(
                task_id = %self.task_id,
                what = self.what,
                "{} failing repeatedly, muting until it recovers",
                self.what
            );
        }
        self.length <= self.loud
    }

    /// End the streak.
    pub fn reset(&mut self) {
        if self.length > self.loud {
            info!(
                task_id = %self.task_id,
                what = self.what,
                failures = self.length,
                "{} recovered",
                self.what
            );
        }
        self.length = 0;
    }

    pub fn length(&self) -> u32 {
        self.length
    }
}
