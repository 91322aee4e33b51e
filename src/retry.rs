use std::time::Duration;

/// Delay schedule for reconnecting to a daemon that is still wanted.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryStrategy {
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryStrategy {
    pub(crate) fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// `min(base * 2^attempt, max)`.
    pub(crate) fn calculate_delay(&self, attempt: u32) -> Duration {
        2_u32
            .checked_pow(attempt)
            .and_then(|multiplier| self.base_delay.checked_mul(multiplier))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}
