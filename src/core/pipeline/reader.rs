//! Source reader: streams a file (or any async byte source) in fixed-size
//! chunks with a bounded read-ahead.
//!
//! ```text
//! ┌──────────┐   bounded chan   ┌──────────────┐
//! │  Reader  │ ───────────────► │  Send pump   │──► data channel
//! │ (async)  │   Bytes chunks   │ (ChunkStream)│
//! └──────────┘                  └──────────────┘
//! ```
//!
//! Dropping the receiver (or aborting the handle) stops the reader, which is
//! how a cancelled transfer releases its file.

use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Spawn a reader that slices `source` into `chunk_size` chunks.
///
/// Every chunk is exactly `chunk_size` bytes except the last one. A read
/// error is forwarded as the final item.
pub fn spawn_reader<R>(
    mut source: R,
    chunk_size: usize,
    read_ahead: usize,
) -> (mpsc::Receiver<io::Result<Bytes>>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(read_ahead.max(1));

    let handle = tokio::spawn(async move {
        loop {
            let mut buf = vec![0u8; chunk_size];
            let mut filled = 0;
            while filled < chunk_size {
                match source.read(&mut buf[filled..]).await {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }

            if filled == 0 {
                return;
            }
            buf.truncate(filled);

            // Stop if the send pump has gone away.
            if tx.send(Ok(Bytes::from(buf))).await.is_err() {
                return;
            }
            if filled < chunk_size {
                return;
            }
        }
    });

    (rx, handle)
}
