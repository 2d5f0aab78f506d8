//! Retry policy with exponential backoff, cap and jitter.

use std::time::Duration;

use rand::Rng;

/// How often and how patiently a failed step is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per step, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry (before jitter).
    pub initial_backoff: Duration,
    /// Cap on the delay (before jitter).
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Delay is multiplied by a random value in `[1 - jitter, 1 + jitter]`.
    /// Set to 0.0 for no jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Returns the un-jittered delay after `failed_attempts` failures.
    ///
    /// `initial * multiplier^(failed_attempts - 1)`, capped at `max_backoff`.
    pub fn base_backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(32) as i32;
        let initial = self.initial_backoff.as_secs_f64();
        let delay = initial * self.multiplier.max(1.0).powi(exponent);
        let capped = delay.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Returns the delay after `failed_attempts` failures with jitter applied.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let base = self.base_backoff(failed_attempts);
        if self.jitter <= 0.0 {
            return base;
        }

        let jitter = self.jitter.min(1.0);
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }

    /// Returns true once `attempts` has used up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
