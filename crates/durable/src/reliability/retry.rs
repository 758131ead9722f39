//! Backoff schedules

use std::time::Duration;

use rand::Rng;

/// How many times to try, and how long to wait in between
///
/// Attempts are 1-based. The first attempt never waits; attempt `n` waits
/// `base_delay * multiplier^(n - 2)`, capped at `max_delay` and spread by
/// `jitter`.
///
/// ```
/// use std::time::Duration;
/// use waypoint_durable::RetryPolicy;
///
/// let policy = RetryPolicy::fixed(Duration::from_millis(50), 3);
/// assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(50));
/// assert!(!policy.has_attempts_remaining(3));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Resume task redelivery: 5 attempts starting at 1s, doubling up to a minute
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Lost append races clear once the competing pass finishes, so retry fast
    pub fn append_conflict() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(250),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Wait before `attempt`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(retries) = attempt.checked_sub(2) else {
            return Duration::ZERO;
        };

        let exponent = i32::try_from(retries).unwrap_or(i32::MAX);
        let delay = (self.base_delay.as_secs_f64() * self.multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());
        if self.jitter <= 0.0 || delay <= 0.0 {
            return Duration::from_secs_f64(delay);
        }

        let spread = delay * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay + offset).max(0.0))
    }

    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
