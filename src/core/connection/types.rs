//! Transport-neutral negotiation types shared by the signaling wire format,
//! the negotiation engine and the peer-connection adapter.

use crate::core::protocol::frame::RawFrame;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::transport::DataChannel;

// ── Session descriptions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An offer or answer as carried in `sdp-offer` / `sdp-answer` messages:
/// `{"type": "offer", "sdp": "v=0..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate in its JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

// ── States ───────────────────────────────────────────────────────────────────

/// Offer/answer state of the local peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    /// Provisional answers or a closed connection.
    Other,
}

/// Aggregate connectivity of the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn is_lost(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

// ── Transport events ─────────────────────────────────────────────────────────

/// Everything the peer connection and its data channel report back.
/// Delivered into the session's single event queue.
#[derive(Clone)]
pub enum TransportEvent {
    /// A locally gathered ICE candidate, to be trickled to the remote.
    LocalCandidate(IceCandidate),
    /// The peer connection changed its aggregate state.
    Link(LinkState),
    /// The data channel (local or remotely announced) is open.
    ChannelOpened(Arc<dyn DataChannel>),
    /// The data channel closed.
    ChannelClosed,
    /// One frame arrived on the data channel.
    Frame(RawFrame),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::Link(s) => f.debug_tuple("Link").field(s).finish(),
            Self::ChannelOpened(_) => f.write_str("ChannelOpened"),
            Self::ChannelClosed => f.write_str("ChannelClosed"),
            Self::Frame(frame) => f.debug_tuple("Frame").field(frame).finish(),
        }
    }
}
