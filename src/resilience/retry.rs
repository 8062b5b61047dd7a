// ABOUTME: Retry policy with exponential backoff and downward jitter
// ABOUTME: Delay never exceeds base * 2^attempt capped at max_delay

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay that may be shaved off at random, 0.0..=1.0.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// Whether a failure at `attempt` may be retried.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Upper bound for the delay after a failure at `attempt`.
    pub fn ceiling_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay in `[ceiling * (1 - jitter), ceiling]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling_for_attempt(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || ceiling.is_zero() {
            return ceiling;
        }
        let scale = 1.0 - rand::thread_rng().gen_range(0.0..=jitter);
        ceiling.mul_f64(scale)
    }
}
