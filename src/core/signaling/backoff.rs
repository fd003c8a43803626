//! Reconnect backoff for the relay connection.

use std::time::Duration;

use crate::core::config::{RECONNECT_BASE, RECONNECT_CAP};

/// Doubling delay with a cap: 1s, 2s, 4s, 8s, 16s, 30s, 30s, ...
///
/// `schedule()` is idempotent while a reconnect is pending; only a
/// successful open (`reset()`) rewinds the sequence.
#[derive(Debug)]
pub struct ReconnectBackoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
    scheduled: bool,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(RECONNECT_BASE, RECONNECT_CAP)
    }
}

impl ReconnectBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
            scheduled: false,
        }
    }

    /// Delay for the next reconnect, or `None` if one is already pending.
    pub fn schedule(&mut self) -> Option<Duration> {
        if self.scheduled {
            return None;
        }
        self.scheduled = true;
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// The pending reconnect is being attempted now.
    pub fn fire(&mut self) {
        self.scheduled = false;
    }

    /// The connection opened.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.scheduled = false;
    }

    #[cfg(test)]
    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }
}
