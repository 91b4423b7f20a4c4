//! Exponential backoff shared by upstream reconnection and sink retries.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with a cap and subtractive jitter.
///
/// `delay_for_attempt(n)` is `initial * multiplier^(n-1)`, capped at
/// `max_delay_ms`, then reduced by a random fraction below `jitter`.
/// The result never exceeds the cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay in milliseconds
    pub max_delay_ms: u64,
    /// Growth factor between consecutive attempts
    pub multiplier: f64,
    /// Fraction of the delay that may be shaved off at random, in `[0, 1)`
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Create a backoff without jitter.
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms,
            jitter: 0.0,
            ..Default::default()
        }
    }

    /// Set the jitter fraction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// The capped delay for an attempt, before jitter.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_ms = (self.initial_delay_ms as f64 * self.multiplier.powi(exponent))
            .min(self.max_delay_ms as f64);

        Duration::from_millis(delay_ms as u64)
    }

    /// The delay to wait before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }

        let jitter = self.jitter.min(0.99);
        let shave = rand::thread_rng().gen_range(0.0..jitter);
        base.mul_f64(1.0 - shave)
    }
}
