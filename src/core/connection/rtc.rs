//! webrtc-rs implementation of the transport seams.
//!
//! Every callback the library fires is turned into a [`TransportEvent`] and
//! pushed into the session's event sink; nothing here holds protocol state.

use anyhow::{Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use super::transport::{DataChannel, PeerTransport};
use super::types::{IceCandidate, LinkState, SdpKind, SessionDescription, SignalingState, TransportEvent};
use crate::core::config::{DATA_CHANNEL_LABEL, DC_BUFFERED_AMOUNT_LOW};
use crate::core::protocol::frame::RawFrame;

/// Where transport callbacks deliver their events.
pub type TransportSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Forward transport events into an unbounded queue of `E`.
pub fn sink<E>(tx: mpsc::UnboundedSender<E>) -> TransportSink
where
    E: From<TransportEvent> + Send + 'static,
{
    Arc::new(move |event| {
        let _ = tx.send(E::from(event));
    })
}

// ── Peer connection ──────────────────────────────────────────────────────────

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    sink: TransportSink,
}

impl RtcPeer {
    fn create_api() -> Result<API> {
        let mut me = MediaEngine::default();
        let reg = register_default_interceptors(Registry::new(), &mut me)?;
        Ok(APIBuilder::new()
            .with_media_engine(me)
            .with_interceptor_registry(reg)
            .build())
    }

    fn ice_servers(urls: &[String]) -> Vec<RTCIceServer> {
        urls.iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect()
    }

    /// Build the peer connection and wire its callbacks into `sink`.
    pub async fn connect(stun: &[String], sink: TransportSink) -> Result<Arc<Self>> {
        let api = Self::create_api()?;
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: Self::ice_servers(stun),
                ..Default::default()
            })
            .await?,
        );

        let s = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let s = s.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => s(TransportEvent::LocalCandidate(from_candidate_init(init))),
                    Err(e) => warn!(error = %e, "Could not serialize local ICE candidate"),
                }
            })
        }));

        let s = sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let s = s.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Failed => error!(event = "webrtc_failed", "WebRTC connection failed"),
                    RTCPeerConnectionState::Disconnected => {
                        warn!(event = "webrtc_disconnected", "WebRTC transient disconnect")
                    }
                    RTCPeerConnectionState::Closed => {
                        info!(event = "webrtc_closed", "WebRTC connection closed")
                    }
                    other => debug!(state = %other, "WebRTC connection state"),
                }
                if let Some(link) = link_state(state) {
                    s(TransportEvent::Link(link));
                }
            })
        }));

        let s = sink.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let s = s.clone();
            Box::pin(async move {
                if dc.label() != DATA_CHANNEL_LABEL {
                    warn!(channel = %dc.label(), "Ignoring unexpected data channel");
                    return;
                }
                debug!(channel = %dc.label(), "Remote data channel announced");
                RtcChannel::attach(dc, s).await;
            })
        }));

        Ok(Arc::new(Self { pc, sink }))
    }
}

#[async_trait]
impl PeerTransport for RtcPeer {
    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            _ => SignalingState::Other,
        }
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then_some(RTCOfferOptions {
            ice_restart: true,
            voice_activity_detection: false,
        });
        to_description(self.pc.create_offer(options).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        to_description(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(from_description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(from_description(desc)?).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        // webrtc-rs parses the SDP of every local description, rollback included.
        let Some(pending) = self.pc.pending_local_description().await else {
            bail!("no pending local description to roll back");
        };
        let mut desc = RTCSessionDescription::default();
        desc.sdp_type = RTCSdpType::Rollback;
        desc.sdp = pending.sdp;
        self.pc.set_local_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(to_candidate_init(candidate)).await?;
        Ok(())
    }

    async fn create_data_channel(&self) -> Result<Arc<dyn DataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(DATA_CHANNEL_LABEL, Some(init)).await?;
        let channel: Arc<dyn DataChannel> = RtcChannel::attach(dc, self.sink.clone()).await;
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

// ── Data channel ─────────────────────────────────────────────────────────────

pub struct RtcChannel {
    dc: Arc<RTCDataChannel>,
    drained: Arc<Notify>,
}

impl RtcChannel {
    /// Wrap `dc` and route its open/close/message callbacks into `sink`.
    async fn attach(dc: Arc<RTCDataChannel>, sink: TransportSink) -> Arc<Self> {
        let drained = Arc::new(Notify::new());
        dc.set_buffered_amount_low_threshold(DC_BUFFERED_AMOUNT_LOW).await;
        let n = drained.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            let n = n.clone();
            Box::pin(async move { n.notify_waiters() })
        }))
        .await;

        let channel = Arc::new(Self { dc: dc.clone(), drained });

        let weak: Weak<Self> = Arc::downgrade(&channel);
        let s = sink.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                if let Some(channel) = weak.upgrade() {
                    info!(event = "dc_open", channel = %channel.dc.label(), "DataChannel open");
                    s(TransportEvent::ChannelOpened(channel));
                }
            })
        }));

        let label = dc.label().to_string();
        let s = sink.clone();
        dc.on_close(Box::new(move || {
            let label = label.clone();
            let s = s.clone();
            Box::pin(async move {
                warn!(event = "dc_closed", channel = %label, "DataChannel closed by transport");
                s(TransportEvent::ChannelClosed);
            })
        }));

        let label = dc.label().to_string();
        dc.on_error(Box::new(move |err| {
            let label = label.clone();
            Box::pin(async move {
                error!(event = "dc_error", channel = %label, %err, "DataChannel transport error");
            })
        }));

        let s = sink;
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let s = s.clone();
            Box::pin(async move {
                let frame = if msg.is_string {
                    RawFrame::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    RawFrame::Binary(msg.data)
                };
                s(TransportEvent::Frame(frame));
            })
        }));

        channel
    }
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.dc.send(&data).await?;
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn wait_drained(&self, poll: Duration) {
        let _ = tokio::time::timeout(poll, self.drained.notified()).await;
    }

    async fn close(&self) -> Result<()> {
        self.dc.close().await?;
        Ok(())
    }
}

// ── Conversions ──────────────────────────────────────────────────────────────

fn link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    Some(match state {
        RTCPeerConnectionState::New => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
        _ => return None,
    })
}

fn to_description(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => bail!("unexpected session description type {other}"),
    }
}

fn from_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    Ok(match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    })
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_state_mapping() {
        assert_eq!(link_state(RTCPeerConnectionState::Connected), Some(LinkState::Connected));
        assert_eq!(link_state(RTCPeerConnectionState::Failed), Some(LinkState::Failed));
        assert_eq!(link_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[test]
    fn test_candidate_conversion_keeps_fields() {
        let c = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some("u".into()),
        };
        assert_eq!(from_candidate_init(to_candidate_init(c.clone())), c);
    }

    #[test]
    fn test_rollback_type_is_not_exposed() {
        let mut desc = RTCSessionDescription::default();
        desc.sdp_type = RTCSdpType::Rollback;
        assert!(to_description(desc).is_err());
    }

    #[tokio::test]
    async fn test_fresh_peer_is_stable_without_remote() {
        let peer = RtcPeer::connect(&[], Arc::new(|_: TransportEvent| {})).await.unwrap();
        assert_eq!(peer.signaling_state(), SignalingState::Stable);
        assert!(!peer.has_remote_description().await);
        peer.close().await.unwrap();
    }
}
