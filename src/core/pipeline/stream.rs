//! ChunkStream: the send-side byte pump for one transfer.
//!
//! `META` → chunks (backpressure, retry, coalesced progress) → `DONE` →
//! wait for `ACK_RECEIVED` or the acknowledgment timeout.
//!
//! Cancellation is cooperative: the token is checked before every chunk and
//! raced against every suspension (read, retry backoff, drain, ACK wait).

use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::config::{SENDER_READ_AHEAD_CHUNKS, TransferSettings};
use crate::core::connection::DataChannel;
use crate::core::protocol::frame::{DoneMarker, FileMeta, Frame};
use crate::utils::sos::SignalOfStop;

use super::flow::{ProgressThrottle, send_with_retry, wait_for_drain};
use super::reader::spawn_reader;

/// Why a transfer did not reach its completion marker.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("transfer cancelled")]
    Cancelled,
    #[error("data channel closed")]
    ChannelClosed,
    #[error("send failed after {attempts} attempts: {reason}")]
    SendFailed { attempts: u32, reason: String },
    #[error("reading source failed: {0}")]
    Read(#[from] std::io::Error),
}

/// Result of a transfer that got its completion marker out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamReport {
    pub bytes_sent: u64,
    /// `false` when the acknowledgment wait timed out.
    pub acknowledged: bool,
}

pub struct ChunkStream {
    channel: Arc<dyn DataChannel>,
    settings: TransferSettings,
    cancel: SignalOfStop,
}

impl ChunkStream {
    pub fn new(channel: Arc<dyn DataChannel>, settings: TransferSettings, cancel: SignalOfStop) -> Self {
        Self {
            channel,
            settings,
            cancel,
        }
    }

    /// Pump `source` over the channel as the transfer described by `meta`.
    ///
    /// `arm_ack` is called once, right before `DONE` goes out; the receiver
    /// it returns resolves when the peer's `ACK_RECEIVED` arrives.
    /// `on_progress` receives the cumulative byte count, coalesced.
    pub async fn run<R, A, P>(
        &self,
        meta: FileMeta,
        source: R,
        arm_ack: A,
        mut on_progress: P,
    ) -> Result<StreamReport, StreamError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        A: FnOnce() -> oneshot::Receiver<()> + Send,
        P: FnMut(u64) + Send,
    {
        let channel = self.channel.as_ref();
        let settings = &self.settings;
        let cancel = &self.cancel;

        send_with_retry(channel, &Frame::Meta(meta.clone()).encode(), settings, cancel).await?;
        info!(
            event = "send_start",
            id = %meta.id,
            name = %meta.name,
            size = meta.size,
            "Starting file transfer"
        );

        let (mut chunks, reader) = spawn_reader(source, settings.chunk_size, SENDER_READ_AHEAD_CHUNKS);
        let result = self.pump(&mut chunks, &mut on_progress).await;
        // Releases the source on every exit path.
        reader.abort();
        let sent = result?;

        on_progress(sent);
        let ack = arm_ack();
        send_with_retry(
            channel,
            &Frame::Done(DoneMarker { id: meta.id.clone() }).encode(),
            settings,
            cancel,
        )
        .await?;
        debug!(id = %meta.id, sent, "Completion marker sent, waiting for acknowledgment");

        let acknowledged = tokio::select! {
            res = ack => match res {
                Ok(()) => true,
                Err(_) => return Err(StreamError::ChannelClosed),
            },
            _ = tokio::time::sleep(settings.ack_timeout) => {
                warn!(
                    event = "ack_timeout",
                    id = %meta.id,
                    timeout_ms = settings.ack_timeout.as_millis() as u64,
                    "Acknowledgment timeout"
                );
                false
            }
            _ = cancel.wait() => return Err(StreamError::Cancelled),
        };

        Ok(StreamReport {
            bytes_sent: sent,
            acknowledged,
        })
    }

    async fn pump<P>(
        &self,
        chunks: &mut tokio::sync::mpsc::Receiver<std::io::Result<bytes::Bytes>>,
        on_progress: &mut P,
    ) -> Result<u64, StreamError>
    where
        P: FnMut(u64) + Send,
    {
        let channel = self.channel.as_ref();
        let settings = &self.settings;
        let cancel = &self.cancel;
        let mut throttle = ProgressThrottle::new(settings.progress_interval);
        let mut sent = 0u64;

        loop {
            if cancel.cancelled() {
                return Err(StreamError::Cancelled);
            }

            let next = tokio::select! {
                next = chunks.recv() => next,
                _ = cancel.wait() => return Err(StreamError::Cancelled),
            };
            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(StreamError::Read(e)),
                None => return Ok(sent),
            };

            let len = chunk.len() as u64;
            send_with_retry(channel, &Frame::Chunk(chunk).encode(), settings, cancel).await?;
            sent += len;

            if throttle.ready(Instant::now()) {
                on_progress(sent);
            }

            wait_for_drain(channel, settings, cancel).await?;
        }
    }
}
