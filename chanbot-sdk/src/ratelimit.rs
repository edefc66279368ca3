//! Outbound flood protection.
//!
//! A token bucket (governor's GCRA) with capacity `burst` refilling one token
//! per `interval`. The writer awaits [`RateLimiter::until_ready`] before each
//! user frame, so frames are only ever delayed, never dropped or reordered.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{Quota, RateLimiter as GovRateLimiter};

use crate::config::RateLimitConfig;

/// Type alias for governor's direct rate limiter.
type DirectRateLimiter = governor::DefaultDirectRateLimiter;

#[derive(Debug)]
pub struct RateLimiter {
    limiter: DirectRateLimiter,
    interval: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);
        let interval = config.interval().max(Duration::from_millis(1));
        let quota = Quota::with_period(interval)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);
        Self {
            limiter: GovRateLimiter::direct(quota),
            interval,
        }
    }

    /// Wait until one frame may go out, consuming a token.
    ///
    /// Cancel-safe: a token is only taken when the future completes.
    pub async fn until_ready(&self) {
        self.limiter.until_ready().await;
    }

    /// Upper bound on the wait for a queue of `depth` frames.
    pub fn max_latency(&self, depth: usize) -> Duration {
        self.interval.saturating_mul(depth.min(u32::MAX as usize) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn limiter(interval_ms: u64, burst: u32) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig { interval_ms, burst })
    }

    #[tokio::test]
    async fn burst_then_throttle() {
        let interval = Duration::from_millis(200);
        let limiter = limiter(200, 3);
        let start = Instant::now();
        let mut sent_at = Vec::new();

        for _ in 0..5 {
            limiter.until_ready().await;
            sent_at.push(start.elapsed());
        }

        // first three go out with no delay
        assert!(sent_at[2] < Duration::from_millis(100), "{sent_at:?}");
        // fourth and fifth are each held back by one more interval
        let slack = Duration::from_millis(5);
        assert!(sent_at[3] + slack >= interval, "{sent_at:?}");
        assert!(sent_at[4] + slack >= interval * 2, "{sent_at:?}");
    }

    #[tokio::test]
    async fn zero_burst_is_treated_as_one() {
        let limiter = limiter(150, 0);
        let start = Instant::now();
        limiter.until_ready().await;
        assert!(start.elapsed() < Duration::from_millis(100));
        limiter.until_ready().await;
        assert!(start.elapsed() + Duration::from_millis(5) >= Duration::from_millis(150));
    }

    #[test]
    fn latency_bound_scales_with_depth() {
        let limiter = limiter(2000, 3);
        assert_eq!(limiter.max_latency(4), Duration::from_secs(8));
    }
}
