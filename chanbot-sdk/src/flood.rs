//! Inbound command flood guard.
//!
//! Counts dispatched invocations per channel (or per nick for private
//! messages). A target that triggers `max_invocations` handlers within
//! `window` is ignored for `pause`; the first message ignored gets a single
//! "Throttled" notice back.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::FloodConfig;

const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodVerdict {
    Allowed,
    /// Drop the message. `warn` is set once per pause.
    Throttled { warn: bool },
}

#[derive(Debug, Default)]
struct TargetLog {
    recent: VecDeque<Instant>,
    paused_at: Option<Instant>,
    warned: bool,
}

#[derive(Debug)]
pub struct FloodGuard {
    config: FloodConfig,
    targets: Mutex<HashMap<String, TargetLog>>,
}

impl FloodGuard {
    pub fn new(config: FloodConfig) -> Self {
        Self {
            config,
            targets: Mutex::new(HashMap::new()),
        }
    }

    /// Decide on one invocation for `target` and record it when allowed.
    pub fn check(&self, target: &str, now: Instant) -> FloodVerdict {
        if !self.config.enabled || self.config.max_invocations == 0 {
            return FloodVerdict::Allowed;
        }

        let mut targets = self.targets.lock();
        if targets.len() > PRUNE_THRESHOLD {
            let window = self.config.window().max(self.config.pause());
            targets.retain(|_, log| {
                log.paused_at.is_some()
                    || log
                        .recent
                        .back()
                        .is_some_and(|last| now.duration_since(*last) < window)
            });
        }

        let log = targets.entry(target.to_string()).or_default();

        if let Some(paused_at) = log.paused_at {
            if now.duration_since(paused_at) < self.config.pause() {
                let warn = !log.warned;
                log.warned = true;
                return FloodVerdict::Throttled { warn };
            }
            tracing::debug!(key = %target, "Flood pause over");
            *log = TargetLog::default();
        }

        log.recent.push_back(now);
        if log.recent.len() > self.config.max_invocations {
            log.recent.pop_front();
        }
        if log.recent.len() == self.config.max_invocations
            && log
                .recent
                .front()
                .is_some_and(|first| now.duration_since(*first) < self.config.window())
        {
            tracing::debug!(key = %target, "Flood detected, pausing dispatch");
            log.paused_at = Some(now);
        }
        FloodVerdict::Allowed
    }
}
