//! Retry delay for failed sync windows.

use std::time::Duration;

use rand::Rng;

/// Largest share of the base delay added as jitter.
const JITTER_RATIO: f64 = 0.2;

/// Capped exponential backoff with jitter.
///
/// The base delay is `min * 2^failures`, never above `max`. Each delay adds
/// up to a fifth of the base at random so restarted supervisors spread out.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    /// A backoff with no failures recorded.
    pub const fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            failures: 0,
        }
    }

    /// Consecutive failures since the last success.
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// The delay before the next retry, without jitter.
    pub fn base_delay(&self) -> Duration {
        let factor = 2_u32.checked_pow(self.failures.saturating_sub(1));
        factor
            .and_then(|f| self.min.checked_mul(f))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let base = self.base_delay();
        let jitter = base.mul_f64(rand::rng().random_range(0.0..=JITTER_RATIO));
        base.saturating_add(jitter)
    }

    /// Forget past failures.
    pub const fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_then_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        let bases: Vec<u64> = (0..6)
            .map(|_| {
                backoff.record_failure();
                backoff.base_delay().as_secs()
            })
            .collect();
        assert_eq!(bases, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn jitter_stays_within_a_fifth() {
        let mut backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(100));
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.record_failure();
            assert!(delay >= Duration::from_secs(10));
            assert!(delay <= Duration::from_secs(12));
        }
    }

    #[test]
    fn huge_failure_count_saturates_at_max() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(60));
        for _ in 0..200 {
            backoff.record_failure();
        }
        assert_eq!(backoff.base_delay(), Duration::from_secs(60));
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
    }
}
