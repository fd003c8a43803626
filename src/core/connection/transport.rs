//! Seams between the protocol core and the peer-connection library.
//!
//! The negotiation engine and the send pump only ever talk to these traits;
//! `rtc.rs` implements them on top of webrtc-rs and the unit tests implement
//! them in memory.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use super::types::{IceCandidate, SessionDescription, SignalingState};

/// A reliable, ordered, bidirectional message channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn send_binary(&self, data: Bytes) -> Result<()>;

    async fn send_text(&self, text: String) -> Result<()>;

    /// Bytes accepted by `send_*` but not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    /// Resolve once the channel reports it drained below its low-water
    /// threshold, or after `poll` elapsed, whichever is first.
    async fn wait_drained(&self, poll: std::time::Duration);

    async fn close(&self) -> Result<()>;
}

/// The operations perfect negotiation needs from a peer connection.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    async fn has_remote_description(&self) -> bool;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Discard a pending local offer and return to `Stable`.
    async fn rollback(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Create the session's data channel. Its open/close/message events are
    /// reported through the transport's event sink, not returned here.
    async fn create_data_channel(&self) -> Result<Arc<dyn DataChannel>>;

    async fn close(&self) -> Result<()>;
}
