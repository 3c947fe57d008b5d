//! Exponential backoff.

use std::time::Duration;

/// Delay before retrying after consecutive retryable failures.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound of any delay.
    pub max_delay: Duration,
    /// Factor applied per additional failure.
    pub multiplier: f64,
}

impl BackoffPolicy {
    /// Creates a policy with the given initial delay, a 5 hour cap and a
    /// multiplier of 2.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(5 * 60 * 60),
            multiplier: 2.0,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier. Values below 1 are treated as 1.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Calculates the delay after `failures` consecutive failures.
    ///
    /// Zero failures means no delay.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();

        if delay_secs.is_finite() && delay_secs < max_secs {
            Duration::from_secs_f64(delay_secs)
        } else {
            self.max_delay
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
