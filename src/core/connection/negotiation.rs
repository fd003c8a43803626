//! NegotiationEngine: perfect negotiation over the signaling relay.
//!
//! ```text
//! Idle ─► Negotiating ─► Stable ─► Connected
//!   any ─► Disconnected ─► Restarting ─► Negotiating
//!   any ─► Failed (restarts exhausted)
//! ```
//!
//! Glare is resolved by politeness alone: on a colliding offer the
//! impolite side (host) ignores it, the polite side rolls its own offer
//! back and answers. ICE restarts are bounded in count and spacing.
//!
//! Every method runs to completion on the session loop and returns
//! [`EngineOutput`]s instead of reaching into other components.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::transport::{DataChannel, PeerTransport};
use super::types::{IceCandidate, LinkState, SessionDescription, SignalingState, TransportEvent};
use crate::core::config::NegotiationSettings;
use crate::core::session::{Politeness, SessionIdentity};
use crate::core::signaling::SignalMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Negotiating,
    Stable,
    Connected,
    Disconnected,
    Failed,
    Restarting,
}

impl NegotiationState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Negotiating => "negotiating",
            Self::Stable => "stable",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Restarting => "restarting",
        }
    }
}

/// Per-session negotiation bookkeeping.
#[derive(Debug, Clone)]
pub struct PeerLink {
    pub remote_peer_id: Option<String>,
    pub politeness: Politeness,
    pub state: NegotiationState,
    pub making_offer: bool,
    pub ice_restart_attempts: u32,
    pub last_restart_at: Option<Instant>,
    restart_pending: bool,
}

impl PeerLink {
    fn new(politeness: Politeness) -> Self {
        Self {
            remote_peer_id: None,
            politeness,
            state: NegotiationState::Idle,
            making_offer: false,
            ice_restart_attempts: 0,
            last_restart_at: None,
            restart_pending: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Now,
    After(Duration),
    Exhausted,
    NotNeeded,
}

/// Side effects for the session loop.
#[derive(Clone)]
pub enum EngineOutput {
    Signal(SignalMessage),
    ChannelReady(Arc<dyn DataChannel>),
    ChannelLost,
    StateChanged(NegotiationState),
    /// Call [`NegotiationEngine::restart_due`] after this delay.
    ScheduleRestart(Duration),
    /// Restarts exhausted; the link is gone for good.
    ConnectionFailed,
}

impl std::fmt::Debug for EngineOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal(m) => f.debug_tuple("Signal").field(m).finish(),
            Self::ChannelReady(_) => f.write_str("ChannelReady"),
            Self::ChannelLost => f.write_str("ChannelLost"),
            Self::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            Self::ScheduleRestart(d) => f.debug_tuple("ScheduleRestart").field(d).finish(),
            Self::ConnectionFailed => f.write_str("ConnectionFailed"),
        }
    }
}

pub struct NegotiationEngine {
    client_id: String,
    is_host: bool,
    peer: Arc<dyn PeerTransport>,
    settings: NegotiationSettings,
    link: PeerLink,
    channel: Option<Arc<dyn DataChannel>>,
    channel_open: bool,
    pending_remote: Vec<IceCandidate>,
    pending_local: Vec<IceCandidate>,
}

impl NegotiationEngine {
    pub fn new(identity: &SessionIdentity, peer: Arc<dyn PeerTransport>, settings: NegotiationSettings) -> Self {
        Self {
            client_id: identity.client_id().to_string(),
            is_host: identity.is_host(),
            peer,
            settings,
            link: PeerLink::new(identity.politeness()),
            channel: None,
            channel_open: false,
            pending_remote: Vec::new(),
            pending_local: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn link(&self) -> &PeerLink {
        &self.link
    }

    #[cfg(test)]
    pub fn state(&self) -> NegotiationState {
        self.link.state
    }

    /// The data channel, once it is open.
    #[cfg(test)]
    pub fn open_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.clone().filter(|_| self.channel_open)
    }

    // ── Signaling input ──────────────────────────────────────────────────

    pub async fn on_signal(&mut self, msg: SignalMessage) -> Vec<EngineOutput> {
        let mut out = Vec::new();
        match msg {
            SignalMessage::Peers { peers } => self.on_peers(peers, &mut out).await,
            SignalMessage::SdpOffer { from, sdp, .. } => self.on_offer(from, sdp, &mut out).await,
            SignalMessage::SdpAnswer { sdp, .. } => self.on_answer(sdp, &mut out).await,
            SignalMessage::IceCandidate { candidate, .. } => self.on_remote_candidate(candidate).await,
            other => debug!(kind = other.kind(), "Signal not relevant to negotiation"),
        }
        out
    }

    async fn on_peers(&mut self, peers: Vec<String>, out: &mut Vec<EngineOutput>) {
        if self.link.remote_peer_id.is_some() {
            return;
        }
        let Some(remote) = peers.into_iter().find(|p| *p != self.client_id) else {
            return;
        };

        info!(
            event = "peer_discovered",
            remote = %remote,
            host = self.is_host,
            "Remote peer discovered"
        );
        self.set_remote(remote, out);

        if self.is_host {
            if self.channel.is_none() {
                match self.peer.create_data_channel().await {
                    Ok(dc) => self.channel = Some(dc),
                    Err(e) => {
                        error!(event = "data_channel_failed", error = %e, "Could not create data channel");
                        return;
                    }
                }
            }
            self.make_offer(false, out).await;
        } else {
            debug!("Waiting for the host's offer");
        }
    }

    async fn on_offer(&mut self, from: Option<String>, sdp: SessionDescription, out: &mut Vec<EngineOutput>) {
        let collision = self.link.making_offer || self.peer.signaling_state() != SignalingState::Stable;

        if collision {
            match self.link.politeness {
                Politeness::Impolite => {
                    info!(event = "offer_ignored", "Ignoring colliding offer (impolite side)");
                    return;
                }
                Politeness::Polite => match self.peer.rollback().await {
                    Ok(()) => info!(event = "offer_rollback", "Rolled back local offer to accept remote offer"),
                    Err(e) => debug!(error = %e, "Rollback failed or not needed"),
                },
            }
        }

        if let Err(e) = self.peer.set_remote_description(sdp).await {
            error!(event = "remote_offer_failed", error = %e, "Failed to apply remote offer");
            return;
        }
        self.flush_remote_candidates().await;

        let answer = match self.peer.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                error!(event = "answer_failed", error = %e, "Failed to create answer");
                return;
            }
        };
        if let Err(e) = self.peer.set_local_description(answer.clone()).await {
            error!(event = "answer_failed", error = %e, "Failed to apply local answer");
            return;
        }

        // The offer's sender may have rejoined under a new id.
        if let Some(from) = from {
            self.set_remote(from, out);
        }
        let Some(remote) = self.link.remote_peer_id.clone() else {
            warn!("Answer ready but no remote peer id is known");
            return;
        };
        debug!(to = %remote, "Sending answer");
        out.push(EngineOutput::Signal(SignalMessage::answer(&remote, answer)));
        self.set_state(NegotiationState::Stable, out);
    }

    async fn on_answer(&mut self, sdp: SessionDescription, out: &mut Vec<EngineOutput>) {
        let state = self.peer.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            warn!(event = "stale_answer", ?state, "Ignoring answer, no local offer pending");
            return;
        }
        if let Err(e) = self.peer.set_remote_description(sdp).await {
            error!(event = "remote_answer_failed", error = %e, "Failed to apply remote answer");
            return;
        }
        self.flush_remote_candidates().await;
        self.set_state(NegotiationState::Stable, out);
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.peer.has_remote_description().await {
            debug!("Buffering ICE candidate until the remote description is set");
            self.pending_remote.push(candidate);
            return;
        }
        self.apply_candidate(candidate).await;
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            warn!(event = "ice_candidate_failed", error = %e, "Failed to add ICE candidate");
        }
    }

    async fn flush_remote_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_remote) {
            self.apply_candidate(candidate).await;
        }
    }

    fn set_remote(&mut self, remote: String, out: &mut Vec<EngineOutput>) {
        if self.link.remote_peer_id.as_deref() == Some(remote.as_str()) {
            return;
        }
        for candidate in std::mem::take(&mut self.pending_local) {
            out.push(EngineOutput::Signal(SignalMessage::candidate(&remote, candidate)));
        }
        self.link.remote_peer_id = Some(remote);
    }

    async fn make_offer(&mut self, ice_restart: bool, out: &mut Vec<EngineOutput>) {
        let Some(remote) = self.link.remote_peer_id.clone() else {
            return;
        };

        self.link.making_offer = true;
        let result = async {
            let offer = self.peer.create_offer(ice_restart).await?;
            self.peer.set_local_description(offer.clone()).await?;
            anyhow::Ok(offer)
        }
        .await;
        self.link.making_offer = false;

        match result {
            Ok(offer) => {
                debug!(to = %remote, ice_restart, "Sending offer");
                out.push(EngineOutput::Signal(SignalMessage::offer(&remote, offer)));
                self.set_state(NegotiationState::Negotiating, out);
            }
            Err(e) => error!(event = "offer_failed", ice_restart, error = %e, "Failed to create offer"),
        }
    }

    // ── Transport input ──────────────────────────────────────────────────

    pub async fn on_transport(&mut self, event: TransportEvent, now: Instant) -> Vec<EngineOutput> {
        let mut out = Vec::new();
        match event {
            TransportEvent::LocalCandidate(candidate) => match &self.link.remote_peer_id {
                Some(remote) => out.push(EngineOutput::Signal(SignalMessage::candidate(remote, candidate))),
                None => self.pending_local.push(candidate),
            },
            TransportEvent::Link(state) => self.on_link_state(state, now, &mut out).await,
            TransportEvent::ChannelOpened(dc) => {
                if !self.channel_open {
                    info!(event = "channel_open", "Data channel open");
                    self.channel = Some(dc.clone());
                    self.channel_open = true;
                    out.push(EngineOutput::ChannelReady(dc));
                }
            }
            TransportEvent::ChannelClosed => self.lose_channel(&mut out),
            TransportEvent::Frame(_) => {}
        }
        out
    }

    async fn on_link_state(&mut self, state: LinkState, now: Instant, out: &mut Vec<EngineOutput>) {
        match state {
            LinkState::Connected => {
                info!(event = "webrtc_connected", "Peer connection established");
                self.link.ice_restart_attempts = 0;
                self.set_state(NegotiationState::Connected, out);
                // An ICE restart keeps the SCTP association, so the channel
                // may have survived the outage.
                if !self.channel_open
                    && let Some(dc) = self.channel.clone()
                    && dc.is_open()
                {
                    self.channel_open = true;
                    out.push(EngineOutput::ChannelReady(dc));
                }
            }
            lost if lost.is_lost() => {
                warn!(event = "webrtc_lost", state = ?lost, "Peer connection lost");
                self.lose_channel(out);
                if self.link.state != NegotiationState::Failed {
                    self.set_state(NegotiationState::Disconnected, out);
                }
                match lost {
                    LinkState::Disconnected => self.try_restart(now, Duration::ZERO, out).await,
                    LinkState::Failed => {
                        let delay = self.settings.failure_restart_delay;
                        self.try_restart(now, delay, out).await;
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn lose_channel(&mut self, out: &mut Vec<EngineOutput>) {
        if self.channel_open {
            info!(event = "channel_closed", "Data channel closed");
            self.channel_open = false;
            out.push(EngineOutput::ChannelLost);
        }
    }

    // ── ICE restart ──────────────────────────────────────────────────────

    /// Whether a restart may happen at `now`, waiting at least `min_delay`.
    pub fn restart_decision(&self, now: Instant, min_delay: Duration) -> RestartDecision {
        if self.link.remote_peer_id.is_none() || self.link.state == NegotiationState::Connected {
            return RestartDecision::NotNeeded;
        }
        if self.link.ice_restart_attempts >= self.settings.max_ice_restarts {
            return RestartDecision::Exhausted;
        }
        let spacing_left = self
            .link
            .last_restart_at
            .map(|at| self.settings.restart_spacing.saturating_sub(now.duration_since(at)))
            .unwrap_or(Duration::ZERO);
        let wait = spacing_left.max(min_delay);
        if wait.is_zero() {
            RestartDecision::Now
        } else {
            RestartDecision::After(wait)
        }
    }

    /// A previously scheduled restart is due.
    pub async fn restart_due(&mut self, now: Instant) -> Vec<EngineOutput> {
        self.link.restart_pending = false;
        let mut out = Vec::new();
        self.try_restart(now, Duration::ZERO, &mut out).await;
        out
    }

    async fn try_restart(&mut self, now: Instant, min_delay: Duration, out: &mut Vec<EngineOutput>) {
        match self.restart_decision(now, min_delay) {
            RestartDecision::Now => {
                self.link.ice_restart_attempts += 1;
                self.link.last_restart_at = Some(now);
                info!(
                    event = "ice_restart",
                    attempt = self.link.ice_restart_attempts,
                    max = self.settings.max_ice_restarts,
                    "Attempting ICE restart"
                );
                self.set_state(NegotiationState::Restarting, out);
                self.make_offer(true, out).await;
            }
            RestartDecision::After(delay) => {
                if !self.link.restart_pending {
                    self.link.restart_pending = true;
                    debug!(delay_ms = delay.as_millis() as u64, "ICE restart deferred");
                    out.push(EngineOutput::ScheduleRestart(delay));
                }
            }
            RestartDecision::Exhausted => {
                if self.link.state != NegotiationState::Failed {
                    error!(
                        event = "webrtc_failed",
                        attempts = self.link.ice_restart_attempts,
                        "ICE restarts exhausted, connection failed"
                    );
                    self.set_state(NegotiationState::Failed, out);
                    out.push(EngineOutput::ConnectionFailed);
                }
            }
            RestartDecision::NotNeeded => {}
        }
    }

    fn set_state(&mut self, state: NegotiationState, out: &mut Vec<EngineOutput>) {
        if self.link.state != state {
            debug!(from = ?self.link.state, to = ?state, "Negotiation state");
            self.link.state = state;
            out.push(EngineOutput::StateChanged(state));
        }
    }

    /// Tear down the channel and the peer connection.
    pub async fn close(&mut self) {
        if let Some(dc) = self.channel.take() {
            let _ = dc.close().await;
        }
        self.channel_open = false;
        if let Err(e) = self.peer.close().await {
            debug!(error = %e, "Peer connection close failed");
        }
    }
}
