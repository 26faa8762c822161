use std::num::NonZeroU32;
use std::time::Duration;

/// Exponential backoff between redeliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: u32,
    pub max: Duration,
}

impl Backoff {
    /// Delay before the delivery following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// How many times a message may be delivered and how long to wait between
/// deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: NonZeroU32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Whether a transient failure on `attempt` may be retried.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.get()
    }

    /// A delivery beyond the limit means earlier deliveries stalled without
    /// acknowledging; such a message is dead-lettered unprocessed.
    pub fn is_dead_letter(&self, attempt: u32) -> bool {
        attempt > self.max_attempts.get()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: NonZeroU32::MIN.saturating_add(2),
            backoff: Backoff {
                initial: Duration::from_secs(2),
                multiplier: 2,
                max: Duration::from_secs(60),
            },
        }
    }
}
