//! Reconnect delays.
//!
//! Exponential from the base delay up to the cap. With jitter enabled each
//! delay is drawn from the upper half of its step (`[d/2, d]`), which keeps
//! consecutive delays non-decreasing while spreading out reconnect storms.

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        let base = Duration::from_millis(config.base_delay_ms.max(1));
        Self {
            base,
            cap: Duration::from_millis(config.max_delay_ms).max(base),
            jitter: config.jitter,
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let step = self.step(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        if !self.jitter || step >= self.cap {
            return step;
        }
        let half = step / 2;
        let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(spread)
    }

    /// Consecutive failures so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Start over after a session made it to `Ready`.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn step(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}
