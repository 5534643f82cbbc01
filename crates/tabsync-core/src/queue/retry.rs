//! Retry policy and loop backoff: decide how long to wait after a failure.

use std::time::Duration;

/// Retry policy for failed queue tasks.
///
/// No attempt limit: a task keeps retrying at `max_delay` until it succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Base delay the exponent is applied to.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Ceiling for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// 1s base, doubling, capped at 60s.
    pub fn default_v1() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }

    /// Delay before the next attempt of a task that has failed `tries` times.
    ///
    /// delay = min(max_delay, base_delay * multiplier^tries)
    ///
    /// With the defaults:
    /// - tries 1: 2s
    /// - tries 2: 4s
    /// - tries 5: 32s
    /// - tries 6+: 60s
    pub fn next_delay(&self, tries: u32) -> Duration {
        let exponent = tries.min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_v1()
    }
}

/// Doubling backoff for a polling loop.
///
/// `next()` hands out the current delay and doubles it for the following
/// failure, up to `max`. `reset()` after a success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base.min(max),
        }
    }

    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base.min(self.max);
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}
