//! Token-bucket admission gate.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;

/// Token bucket in front of the lane queue. A rate of 0 disables limiting.
pub(crate) struct RateGate {
    limiter: DefaultDirectRateLimiter,
}

impl RateGate {
    pub(crate) fn new(per_second: u32) -> Option<Self> {
        NonZeroU32::new(per_second).map(|rate| Self {
            limiter: RateLimiter::direct(Quota::per_second(rate)),
        })
    }

    /// Wait until one token is available.
    pub(crate) async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_zero_rate_disables_gate() {
        assert!(RateGate::new(0).is_none());
        assert!(RateGate::new(10).is_some());
    }

    #[tokio::test]
    async fn test_rate_bounds_admissions_per_second() {
        // 20/s with a burst of 20: draining 25 tokens must take >= ~250ms.
        let gate = RateGate::new(20).unwrap();
        let start = Instant::now();
        for _ in 0..25 {
            gate.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
