//! Bounded exponential reconnect backoff

use std::time::Duration;

/// Doubling delay, capped at a maximum
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay before the next attempt; doubles the one after it
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    /// Return to the initial delay after a successful connection
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}
