//! Flow-control primitives of the send pump: backpressure against the
//! channel's outstanding buffer, bounded send retry, and progress coalescing.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::core::config::TransferSettings;
use crate::core::connection::DataChannel;
use crate::core::protocol::frame::RawFrame;
use crate::utils::sos::SignalOfStop;

use super::stream::StreamError;

// ── Progress ─────────────────────────────────────────────────────────────────

/// Lets at most one progress report through per interval.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// `true` when a report may be emitted at `now`; records it if so.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

// ── Retry ────────────────────────────────────────────────────────────────────

/// Linear backoff: `base × attempt`.
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base * attempt
}

/// Send one frame, retrying transient failures with linear backoff.
///
/// A channel that is (or becomes) closed is never retried.
pub async fn send_with_retry(
    channel: &dyn DataChannel,
    frame: &RawFrame,
    settings: &TransferSettings,
    cancel: &SignalOfStop,
) -> Result<(), StreamError> {
    let mut attempt = 0u32;
    loop {
        if !channel.is_open() {
            return Err(StreamError::ChannelClosed);
        }

        let result = match frame {
            RawFrame::Binary(data) => channel.send_binary(data.clone()).await,
            RawFrame::Text(text) => channel.send_text(text.clone()).await,
        };
        let err = match result {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if !channel.is_open() {
            return Err(StreamError::ChannelClosed);
        }

        attempt += 1;
        if attempt > settings.max_send_retries {
            error!(
                event = "send_failed",
                attempts = attempt,
                error = %err,
                "Giving up on frame after retries"
            );
            return Err(StreamError::SendFailed {
                attempts: attempt,
                reason: err.to_string(),
            });
        }

        let delay = retry_delay(settings.retry_base, attempt);
        warn!(
            event = "send_retry",
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Send failed, retrying"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.wait() => return Err(StreamError::Cancelled),
        }
    }
}

// ── Backpressure ─────────────────────────────────────────────────────────────

/// Suspend while the channel holds more than the high-water mark, resuming
/// once it drained below the low-water mark.
pub async fn wait_for_drain(
    channel: &dyn DataChannel,
    settings: &TransferSettings,
    cancel: &SignalOfStop,
) -> Result<(), StreamError> {
    let buffered = channel.buffered_amount().await;
    if buffered <= settings.high_water {
        return Ok(());
    }

    debug!(
        buffered,
        high_watermark = settings.high_water,
        low_watermark = settings.low_water,
        "Applying backpressure - waiting for buffer to drain"
    );

    loop {
        if !channel.is_open() {
            return Err(StreamError::ChannelClosed);
        }
        tokio::select! {
            _ = channel.wait_drained(settings.drain_poll) => {}
            _ = cancel.wait() => return Err(StreamError::Cancelled),
        }
        if channel.buffered_amount().await <= settings.low_water {
            return Ok(());
        }
    }
}
