//! Exponential backoff with bounded jitter
//!
//! One policy drives every retry family in the engine: reconnects, failed
//! subscribe requests and unacknowledged resync requests.

use std::time::Duration;

use rand::Rng;

/// `min(base * 2^attempt, cap)` plus up to `jitter * nominal` of random delay
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the nominal delay added as random jitter, in `[0, 1]`
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `attempt` (zero-based), without jitter
    pub fn nominal(&self, attempt: u32) -> Duration {
        // 2^31 seconds is already far beyond any sane cap
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Largest jitter that may be added at `attempt`
    pub fn max_jitter(&self, attempt: u32) -> Duration {
        self.nominal(attempt).mul_f64(self.jitter.clamp(0.0, 1.0))
    }

    /// Delay before retry number `attempt` with jitter drawn from `rng`
    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal(attempt);
        let max_jitter_ms = self.max_jitter(attempt).as_millis() as u64;
        if max_jitter_ms == 0 {
            return nominal;
        }
        nominal + Duration::from_millis(rng.random_range(0..=max_jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_nominal_sequence_is_capped() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 0.0);
        let delays: Vec<u64> = (0..8).map(|a| policy.nominal(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_huge_attempts_do_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.nominal(200), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 0.25);
        let mut rng = StdRng::seed_from_u64(7);

        for attempt in 0..10 {
            let nominal = policy.nominal(attempt);
            for _ in 0..50 {
                let delay = policy.delay(attempt, &mut rng);
                assert!(delay >= nominal);
                assert!(delay <= nominal + nominal.mul_f64(0.25));
            }
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(4), 0.0);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(policy.delay(3, &mut rng), Duration::from_secs(4));
    }

    #[test]
    fn test_jitter_fraction_is_clamped() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(2), 3.0);
        assert_eq!(policy.jitter, 1.0);
    }
}
