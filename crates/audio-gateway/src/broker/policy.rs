//! Reconnect policy for the broker subscription.
//!
//! The subscriber retries on a linear ramp with a floor and gives up
//! permanently once either the current outage outlasts the ceiling or the
//! process has already burned through its connection budget. Giving up is
//! deliberate: the supervisor restarts the worker, which starts with a fresh
//! budget.

use std::time::Duration;

/// Linear backoff step per attempt.
pub const ATTEMPT_STEP: Duration = Duration::from_millis(100);

/// Minimum delay between attempts.
pub const MIN_DELAY: Duration = Duration::from_secs(3);

/// Reconnect policy parameters, taken from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Give up once a single outage has lasted longer than this.
    pub retry_ceiling: Duration,
    /// Give up once more than this many connections have succeeded over the
    /// process lifetime.
    pub max_connections: u32,
}

impl ReconnectPolicy {
    pub fn new(retry_ceiling: Duration, max_connections: u32) -> Self {
        Self {
            retry_ceiling,
            max_connections,
        }
    }

    /// Delay before the given attempt (attempts count from 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        std::cmp::max(ATTEMPT_STEP * attempt, MIN_DELAY)
    }

    /// Whether to stop retrying for good.
    pub fn should_abandon(&self, outage_elapsed: Duration, times_connected: u32) -> bool {
        outage_elapsed > self.retry_ceiling || times_connected > self.max_connections
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            retry_ceiling: Duration::from_secs(3600),
            max_connections: 10,
        }
    }
}
