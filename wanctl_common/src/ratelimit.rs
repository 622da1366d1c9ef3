//! Sliding-window cap on router writes.
//!
//! RouterOS persists queue configuration to NAND; an oscillating controller
//! could wear it out. The limiter allows at most `max_changes` writes within
//! any trailing `window`. The controller may bypass it in exactly one place:
//! applying a pending change on reconnection, where the outage itself already
//! provided the quiet period.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding window of write timestamps.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_changes: usize,
    stamps: VecDeque<Instant>,
}

impl RateLimiter {
    /// Create a limiter allowing `max_changes` writes per `window`.
    pub fn new(window: Duration, max_changes: usize) -> Self {
        Self {
            window,
            max_changes,
            stamps: VecDeque::with_capacity(max_changes + 1),
        }
    }

    /// Limiter with the stock 10 writes / 60 s budget.
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(60), 10)
    }

    /// Whether another write fits in the current window.
    pub fn can_change(&mut self) -> bool {
        self.prune(Instant::now());
        self.stamps.len() < self.max_changes
    }

    /// Record a write at the current instant.
    pub fn record_change(&mut self) {
        let now = Instant::now();
        self.prune(now);
        self.stamps.push_back(now);
    }

    /// Time until the oldest in-window entry expires, or zero if a write is
    /// already allowed.
    pub fn time_until_available(&mut self) -> Duration {
        let now = Instant::now();
        self.prune(now);
        if self.stamps.len() < self.max_changes {
            return Duration::ZERO;
        }
        match self.stamps.front() {
            Some(oldest) => self.window.saturating_sub(now.duration_since(*oldest)),
            None => Duration::ZERO,
        }
    }

    /// Writes currently inside the window.
    pub fn in_window(&mut self) -> usize {
        self.prune(Instant::now());
        self.stamps.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.stamps.front() {
            if now.duration_since(*front) >= self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }
}
