use std::time::Duration;

use kgraph_core::config::BackoffConfig;
use rand::Rng;

/// Exponential backoff with equal jitter, applied after consecutive
/// cluster-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self { Self { base, max: max.max(base) } }

    pub fn from_config(cfg: &BackoffConfig) -> Self {
        Self::new(Duration::from_secs(cfg.base_secs), Duration::from_secs(cfg.max_secs))
    }

    /// Upper bound of the delay after `failures` consecutive failures.
    pub fn ceiling(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures.saturating_sub(1).min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Jittered delay in `[ceiling / 2, ceiling]`.
    pub fn delay(&self, failures: u32) -> Duration {
        let ceiling = self.ceiling(failures);
        let half = ceiling / 2;
        let spread = (ceiling - half).as_millis() as u64;
        if spread == 0 {
            return ceiling;
        }
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_and_caps() {
        let b = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(b.ceiling(0), Duration::ZERO);
        assert_eq!(b.ceiling(1), Duration::from_secs(5));
        assert_eq!(b.ceiling(2), Duration::from_secs(10));
        assert_eq!(b.ceiling(4), Duration::from_secs(40));
        assert_eq!(b.ceiling(5), Duration::from_secs(60));
        assert_eq!(b.ceiling(500), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let b = Backoff::new(Duration::from_secs(2), Duration::from_secs(30));
        for failures in 1..8 {
            let ceiling = b.ceiling(failures);
            for _ in 0..50 {
                let d = b.delay(failures);
                assert!(d >= ceiling / 2 && d <= ceiling, "{:?} outside [{:?}/2, {:?}]", d, ceiling, ceiling);
            }
        }
    }
}
