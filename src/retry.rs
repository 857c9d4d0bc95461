//! Backoff policy for re-polling the result endpoint after a miss.
use std::time::Duration;

/// Tunable parameters for fallback retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of result fetches, including the first one.
    pub max_attempts: u32,
    /// Delay before the second fetch.
    pub initial_delay: Duration,
    /// Upper bound on the delay between fetches.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each miss.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that fetches once and never retries.
    pub fn once() -> Self {
        Self { max_attempts: 1, ..Default::default() }
    }

    /// Delay to wait after `current`, clamped to `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_clamps() {
        let policy = RetryPolicy::default();
        let mut delay = policy.initial_delay;
        for expected in [2, 4, 8, 16, 30, 30] {
            assert_eq!(delay.as_secs(), expected);
            delay = policy.next_delay(delay);
        }
    }

    #[test]
    fn once_has_single_attempt() {
        assert_eq!(RetryPolicy::once().max_attempts, 1);
    }
}
