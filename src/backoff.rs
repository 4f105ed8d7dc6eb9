//! Exponential backoff for rate-limit recovery.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Base delay after the first rate limit.
pub const RATE_LIMIT_BASE: Duration = Duration::from_secs(5 * 60);

/// Longest delay between rate-limit retries.
pub const RATE_LIMIT_CEILING: Duration = Duration::from_secs(40 * 60);

/// Exponential backoff with configurable min/max.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    /// Creates a new backoff starting at `initial`, capping at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the current backoff duration.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the ceiling.
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Advances to the next backoff interval (doubles, capped at max).
    pub fn next(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }

    /// Resets backoff to initial value.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Backoff schedule applied between a rate-limit signal and the next attempt.
///
/// A server-provided retry hint wins over the exponential schedule but is still
/// clamped to the ceiling.
#[derive(Debug, Clone)]
pub struct RateLimitBackoff {
    backoff: ExponentialBackoff,
    attempts: u32,
}

impl Default for RateLimitBackoff {
    fn default() -> Self {
        Self::new(RATE_LIMIT_BASE, RATE_LIMIT_CEILING)
    }
}

impl RateLimitBackoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            backoff: ExponentialBackoff::new(base, ceiling),
            attempts: 0,
        }
    }

    /// Consecutive rate limits seen since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the delay for this rate limit and advances the schedule.
    pub fn delay(&mut self, retry_after_seconds: Option<u64>) -> Duration {
        let scheduled = self.backoff.current();
        self.backoff.next();
        self.attempts += 1;

        match retry_after_seconds {
            Some(secs) if secs > 0 => Duration::from_secs(secs).min(self.backoff.max()),
            _ => scheduled,
        }
    }

    /// Called after any cycle that was not rate limited.
    pub fn reset(&mut self) {
        self.backoff.reset();
        self.attempts = 0;
    }
}
