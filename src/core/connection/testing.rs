//! In-memory implementations of the transport seams for unit tests.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::transport::{DataChannel, PeerTransport};
use super::types::{IceCandidate, SdpKind, SessionDescription, SignalingState};
use crate::core::protocol::frame::RawFrame;

// ── FakeChannel ──────────────────────────────────────────────────────────────

/// A data channel that records every frame and can simulate buffering,
/// transient send failures and closure. Optionally forwards frames to a peer.
pub struct FakeChannel {
    open: AtomicBool,
    buffered: AtomicUsize,
    max_buffered: AtomicUsize,
    failures: AtomicU32,
    drain_waits: AtomicUsize,
    auto_drain: AtomicBool,
    track_buffer: AtomicBool,
    close_after: Mutex<Option<usize>>,
    sent: Mutex<Vec<RawFrame>>,
    forward: Mutex<Option<mpsc::UnboundedSender<RawFrame>>>,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            buffered: AtomicUsize::new(0),
            max_buffered: AtomicUsize::new(0),
            failures: AtomicU32::new(0),
            drain_waits: AtomicUsize::new(0),
            auto_drain: AtomicBool::new(true),
            track_buffer: AtomicBool::new(false),
            close_after: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            forward: Mutex::new(None),
        }
    }

    /// Forward every successfully sent frame into `tx`.
    pub fn piped(tx: mpsc::UnboundedSender<RawFrame>) -> Arc<Self> {
        let ch = Self::new();
        *ch.forward.lock().unwrap() = Some(tx);
        Arc::new(ch)
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn set_buffered(&self, n: usize) {
        self.buffered.store(n, Ordering::SeqCst);
    }

    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    /// Every sent byte stays buffered until a drain wait.
    pub fn track_buffer(&self) {
        self.track_buffer.store(true, Ordering::SeqCst);
    }

    pub fn max_buffered(&self) -> usize {
        self.max_buffered.load(Ordering::SeqCst)
    }

    pub fn set_auto_drain(&self, on: bool) {
        self.auto_drain.store(on, Ordering::SeqCst);
    }

    pub fn fail_next_sends(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Close the channel once `n` binary frames went through.
    pub fn close_after_chunks(&self, n: usize) {
        *self.close_after.lock().unwrap() = Some(n);
    }

    pub fn drain_waits(&self) -> usize {
        self.drain_waits.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<RawFrame> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|f| match f {
                RawFrame::Text(t) => Some(t),
                RawFrame::Binary(_) => None,
            })
            .collect()
    }

    pub fn binary_bytes(&self) -> usize {
        self.sent()
            .iter()
            .map(|f| match f {
                RawFrame::Binary(b) => b.len(),
                RawFrame::Text(_) => 0,
            })
            .sum()
    }

    fn push(&self, frame: RawFrame) -> Result<()> {
        if !self.is_open() {
            return Err(anyhow!("data channel not open"));
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow!("transient send failure"));
        }

        if let RawFrame::Binary(data) = &frame
            && self.track_buffer.load(Ordering::SeqCst)
        {
            let now = self.buffered.fetch_add(data.len(), Ordering::SeqCst) + data.len();
            self.max_buffered.fetch_max(now, Ordering::SeqCst);
        }

        let is_binary = matches!(frame, RawFrame::Binary(_));
        if let Some(tx) = self.forward.lock().unwrap().as_ref() {
            let _ = tx.send(frame.clone());
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(frame);

        if is_binary && let Some(limit) = *self.close_after.lock().unwrap() {
            let chunks = sent.iter().filter(|f| matches!(f, RawFrame::Binary(_))).count();
            if chunks >= limit {
                self.set_open(false);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DataChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.push(RawFrame::Binary(data))
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.push(RawFrame::Text(text))
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered()
    }

    async fn wait_drained(&self, poll: Duration) {
        self.drain_waits.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(poll).await;
        if self.auto_drain.load(Ordering::SeqCst) {
            self.buffered.store(0, Ordering::SeqCst);
        }
    }

    async fn close(&self) -> Result<()> {
        self.set_open(false);
        Ok(())
    }
}

// ── FakePeer ─────────────────────────────────────────────────────────────────

/// One call made on a `FakePeer`, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    Rollback,
    AddCandidate(String),
    CreateDataChannel,
}

/// A peer connection that models the offer/answer signaling states.
pub struct FakePeer {
    name: &'static str,
    state: Mutex<SignalingState>,
    remote: AtomicBool,
    offers: AtomicU32,
    calls: Mutex<Vec<PeerCall>>,
    fail_candidates: AtomicBool,
}

impl FakePeer {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(SignalingState::Stable),
            remote: AtomicBool::new(false),
            offers: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
            fail_candidates: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &PeerCall) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn set_state(&self, state: SignalingState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn fail_candidates(&self) {
        self.fail_candidates.store(true, Ordering::SeqCst);
    }

    fn record(&self, call: PeerCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PeerTransport for FakePeer {
    fn signaling_state(&self) -> SignalingState {
        *self.state.lock().unwrap()
    }

    async fn has_remote_description(&self) -> bool {
        self.remote.load(Ordering::SeqCst)
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        self.record(PeerCall::CreateOffer { ice_restart });
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::offer(format!("{}-offer-{n}", self.name)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(PeerCall::CreateAnswer);
        if self.signaling_state() != SignalingState::HaveRemoteOffer {
            return Err(anyhow!("create_answer outside have-remote-offer"));
        }
        Ok(SessionDescription::answer(format!("{}-answer", self.name)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(PeerCall::SetLocal(desc.kind));
        let mut state = self.state.lock().unwrap();
        *state = match (desc.kind, *state) {
            (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                SignalingState::HaveLocalOffer
            }
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (kind, current) => return Err(anyhow!("set local {kind:?} in {current:?}")),
        };
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(PeerCall::SetRemote(desc.kind));
        let mut state = self.state.lock().unwrap();
        *state = match (desc.kind, *state) {
            (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                SignalingState::HaveRemoteOffer
            }
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, current) => return Err(anyhow!("set remote {kind:?} in {current:?}")),
        };
        self.remote.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.record(PeerCall::Rollback);
        let mut state = self.state.lock().unwrap();
        if *state != SignalingState::HaveLocalOffer {
            return Err(anyhow!("nothing to roll back in {:?}", *state));
        }
        *state = SignalingState::Stable;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(PeerCall::AddCandidate(candidate.candidate));
        if self.fail_candidates.load(Ordering::SeqCst) {
            return Err(anyhow!("bad candidate"));
        }
        Ok(())
    }

    async fn create_data_channel(&self) -> Result<Arc<dyn DataChannel>> {
        self.record(PeerCall::CreateDataChannel);
        Ok(Arc::new(FakeChannel::new()))
    }

    async fn close(&self) -> Result<()> {
        self.set_state(SignalingState::Other);
        Ok(())
    }
}
