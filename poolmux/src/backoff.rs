//! Bounded exponential backoff with jitter.
//!
//! Used by push sources between reconnect attempts and by the dispatch engine
//! while a chain has no usable work source. The delay doubles per attempt,
//! is capped at the configured maximum, and is spread by a jitter factor so
//! that many miners restarting together do not reconnect in lockstep.

use rand::Rng;
use std::time::Duration;

/// Default share of the delay that is randomized.
pub const DEFAULT_JITTER: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff between `min` and `max`.
    ///
    /// A `max` below `min` is raised to `min`.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            jitter: DEFAULT_JITTER,
            attempt: 0,
        }
    }

    /// Set the jitter factor, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Forget previous failures, so the next delay starts at `min` again.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Update the bounds without losing the attempt count.
    pub fn set_bounds(&mut self, min: Duration, max: Duration) {
        self.min = min;
        self.max = max.max(min);
    }

    /// Compute the next delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.min.saturating_mul(1u32 << self.attempt.min(16));
        let capped = base.min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        let capped_ms = capped.as_millis() as u64;
        let jitter_range = (capped_ms as f64 * self.jitter) as u64;
        if jitter_range == 0 {
            return capped;
        }

        let offset = rand::rng().random_range(0..jitter_range);
        let delay = Duration::from_millis(capped_ms.saturating_sub(jitter_range / 2) + offset);
        delay.min(self.max)
    }
}
