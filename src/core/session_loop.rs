//! The session runtime: one task owns every piece of protocol state and
//! drains one event queue.
//!
//! Signaling, the peer connection, the send pump and timers all report back
//! as [`SessionEvent`]s; each event runs to completion before the next one,
//! so the engine, the scheduler and the receive assembly need no locks.
//! The front end talks to the loop with [`Command`]s and observes it through
//! [`SessionUpdate`]s.

use anyhow::Result;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::core::artifacts::ArtifactStore;
use crate::core::config::{DC_HEARTBEAT_INTERVAL, TransferSettings};
use crate::core::connection::{DataChannel, EngineOutput, NegotiationEngine, NegotiationState, TransportEvent};
use crate::core::pipeline::flow::ProgressThrottle;
use crate::core::pipeline::stream::{ChunkStream, StreamError, StreamReport};
use crate::core::protocol::assembly::{ReceiveOutcome, Receiver};
use crate::core::protocol::frame::{ChatText, Frame, RawFrame, decode};
use crate::core::scheduler::{SchedulerAction, SendTicket, TransferScheduler};
use crate::core::signaling::{SignalingEvent, SignalingHandle};
use crate::core::transfer::{TransferJob, TransferStatus};
use crate::utils::sos::SignalOfStop;

const DEFAULT_MIME: &str = "application/octet-stream";

// ── Inputs ───────────────────────────────────────────────────────────────────

/// What the front end asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SendFile(PathBuf),
    Cancel(String),
    Say(String),
    ListJobs,
    Shutdown,
}

#[derive(Debug)]
pub enum SessionEvent {
    Signaling(SignalingEvent),
    Transport(TransportEvent),
    SendProgress {
        generation: u64,
        sent: u64,
    },
    /// The pump is about to send `DONE`; `ack` resolves its wait.
    AwaitingAck {
        generation: u64,
        ack: oneshot::Sender<()>,
    },
    SendFinished {
        generation: u64,
        result: Result<StreamReport, StreamError>,
    },
    /// A received file finished writing to the download directory.
    Stored {
        id: String,
        result: Result<PathBuf>,
    },
    RestartDue,
    Command(Command),
}

impl From<SignalingEvent> for SessionEvent {
    fn from(e: SignalingEvent) -> Self {
        Self::Signaling(e)
    }
}

impl From<TransportEvent> for SessionEvent {
    fn from(e: TransportEvent) -> Self {
        Self::Transport(e)
    }
}

impl From<Command> for SessionEvent {
    fn from(c: Command) -> Self {
        Self::Command(c)
    }
}

// ── Outputs ──────────────────────────────────────────────────────────────────

/// What the front end gets to see.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    Job(TransferJob),
    Chat { from_me: bool, id: String, text: String },
    Link(NegotiationState),
    Signaling { connected: bool },
    Saved { id: String, path: PathBuf },
    Jobs(Vec<TransferJob>),
    Notice(String),
}

// ── Loop ─────────────────────────────────────────────────────────────────────

pub struct SessionLoop {
    engine: NegotiationEngine,
    signaling: SignalingHandle,
    scheduler: TransferScheduler,
    receiver: Receiver,
    store: ArtifactStore,
    settings: TransferSettings,
    channel: Option<Arc<dyn DataChannel>>,
    chat_queue: VecDeque<ChatText>,
    pending_ack: Option<oneshot::Sender<()>>,
    recv_progress: ProgressThrottle,
    events: mpsc::UnboundedSender<SessionEvent>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
}

impl SessionLoop {
    /// `events` must feed the queue later passed to [`SessionLoop::run`];
    /// spawned pumps and timers report through it.
    pub fn new(
        engine: NegotiationEngine,
        signaling: SignalingHandle,
        store: ArtifactStore,
        settings: TransferSettings,
        events: mpsc::UnboundedSender<SessionEvent>,
        updates: mpsc::UnboundedSender<SessionUpdate>,
    ) -> Self {
        Self {
            engine,
            signaling,
            scheduler: TransferScheduler::new(settings.ack_policy),
            receiver: Receiver::new(),
            store,
            recv_progress: ProgressThrottle::new(settings.progress_interval),
            settings,
            channel: None,
            chat_queue: VecDeque::new(),
            pending_ack: None,
            events,
            updates,
        }
    }

    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SessionEvent>, sos: SignalOfStop) -> Result<()> {
        let mut heartbeat = interval_at(Instant::now() + DC_HEARTBEAT_INTERVAL, DC_HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sos.wait() => break,
                event = inbox.recv() => {
                    let Some(event) = event else { break };
                    if self.handle(event).await.is_break() {
                        break;
                    }
                }
                _ = heartbeat.tick() => self.send_control(Frame::Heartbeat).await,
            }
        }

        info!(event = "session_shutdown", "Session loop stopping");
        self.scheduler.shutdown();
        self.engine.close().await;
        Ok(())
    }

    async fn handle(&mut self, event: SessionEvent) -> ControlFlow<()> {
        match event {
            SessionEvent::Signaling(SignalingEvent::Up) => self.publish(SessionUpdate::Signaling { connected: true }),
            SessionEvent::Signaling(SignalingEvent::Down) => {
                self.publish(SessionUpdate::Signaling { connected: false })
            }
            SessionEvent::Signaling(SignalingEvent::Message(msg)) => {
                let outputs = self.engine.on_signal(msg).await;
                self.apply_engine(outputs).await;
            }
            SessionEvent::Transport(TransportEvent::Frame(raw)) => self.on_frame(raw).await,
            SessionEvent::Transport(event) => {
                let outputs = self.engine.on_transport(event, Instant::now()).await;
                self.apply_engine(outputs).await;
            }
            SessionEvent::SendProgress { generation, sent } => {
                let actions = self.scheduler.send_progress(generation, sent);
                self.apply(actions);
            }
            SessionEvent::AwaitingAck { generation, ack } => {
                trace!(generation, "Waiting for acknowledgment");
                self.pending_ack = Some(ack);
            }
            SessionEvent::SendFinished { generation, result } => {
                self.pending_ack = None;
                let actions = self.scheduler.send_finished(generation, result);
                self.apply(actions);
            }
            SessionEvent::Stored { id, result } => {
                let status = match result {
                    Ok(path) => {
                        self.publish(SessionUpdate::Saved { id: id.clone(), path });
                        TransferStatus::Completed
                    }
                    Err(e) => {
                        error!(event = "file_save_failed", id = %id, error = %e, "Could not store received file");
                        TransferStatus::Error
                    }
                };
                let actions = self.scheduler.inbound_finished(&id, status);
                self.apply(actions);
            }
            SessionEvent::RestartDue => {
                let outputs = self.engine.restart_due(Instant::now()).await;
                self.apply_engine(outputs).await;
            }
            SessionEvent::Command(Command::Shutdown) => return ControlFlow::Break(()),
            SessionEvent::Command(command) => self.on_command(command).await,
        }
        ControlFlow::Continue(())
    }

    // ── Front-end commands ───────────────────────────────────────────────

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SendFile(path) => self.queue_file(path).await,
            Command::Cancel(id) => {
                let id = self.resolve_job_id(&id).unwrap_or(id);
                let actions = self.scheduler.cancel(&id);
                if actions.is_empty() {
                    self.publish(SessionUpdate::Notice(format!("nothing to cancel for {id}")));
                }
                self.apply(actions);
            }
            Command::Say(text) => {
                let chat = ChatText {
                    id: Uuid::new_v4().to_string(),
                    text,
                };
                self.publish(SessionUpdate::Chat {
                    from_me: true,
                    id: chat.id.clone(),
                    text: chat.text.clone(),
                });
                self.chat_queue.push_back(chat);
                self.flush_chat().await;
            }
            Command::ListJobs => {
                let jobs = self.scheduler.jobs().cloned().collect();
                self.publish(SessionUpdate::Jobs(jobs));
            }
            Command::Shutdown => {}
        }
    }

    /// Expand an unambiguous id prefix to the full job id.
    fn resolve_job_id(&self, prefix: &str) -> Option<String> {
        let mut matches = self.scheduler.jobs().filter(|j| j.id.starts_with(prefix));
        let first = matches.next()?;
        matches.next().is_none().then(|| first.id.clone())
    }

    async fn queue_file(&mut self, path: PathBuf) {
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => {
                self.publish(SessionUpdate::Notice(format!("{} is not a file", path.display())));
                return;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot queue file");
                self.publish(SessionUpdate::Notice(format!("{}: {e}", path.display())));
                return;
            }
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        let job = TransferJob::outbound(path, name, meta.len(), DEFAULT_MIME.to_string());
        let actions = self.scheduler.enqueue(job);
        self.apply(actions);
    }

    async fn flush_chat(&mut self) {
        let Some(channel) = self.channel.clone() else {
            debug!(queued = self.chat_queue.len(), "Chat queued until the data channel opens");
            return;
        };
        while let Some(chat) = self.chat_queue.pop_front() {
            let frame = Frame::Text(chat.clone());
            if let Err(e) = send_raw(channel.as_ref(), frame.encode()).await {
                warn!(event = "chat_send_failed", error = %e, "Chat send failed, re-queued");
                self.chat_queue.push_front(chat);
                break;
            }
        }
    }

    // ── Engine outputs ───────────────────────────────────────────────────

    async fn apply_engine(&mut self, outputs: Vec<EngineOutput>) {
        for output in outputs {
            match output {
                EngineOutput::Signal(msg) => self.signaling.send(msg),
                EngineOutput::ChannelReady(channel) => {
                    self.channel = Some(channel);
                    self.flush_chat().await;
                    let actions = self.scheduler.channel_opened();
                    self.apply(actions);
                }
                EngineOutput::ChannelLost => {
                    self.channel = None;
                    self.pending_ack = None;
                    self.receiver.abort();
                    let actions = self.scheduler.channel_lost();
                    self.apply(actions);
                }
                EngineOutput::StateChanged(state) => self.publish(SessionUpdate::Link(state)),
                EngineOutput::ScheduleRestart(delay) => {
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = events.send(SessionEvent::RestartDue);
                    });
                }
                EngineOutput::ConnectionFailed => {
                    self.channel = None;
                    self.pending_ack = None;
                    self.receiver.abort();
                    let actions = self.scheduler.connection_failed();
                    self.apply(actions);
                    self.publish(SessionUpdate::Notice("connection failed".to_string()));
                }
            }
        }
    }

    // ── Scheduler actions ────────────────────────────────────────────────

    fn apply(&mut self, actions: Vec<SchedulerAction>) {
        for action in actions {
            match action {
                SchedulerAction::Updated(id) => {
                    if let Some(job) = self.scheduler.job(&id) {
                        let job = job.clone();
                        self.publish(SessionUpdate::Job(job));
                    }
                }
                SchedulerAction::StartSend(ticket) => self.start_pump(ticket),
            }
        }
    }

    fn start_pump(&mut self, ticket: SendTicket) {
        let generation = ticket.generation;
        let Some(channel) = self.channel.clone() else {
            let _ = self.events.send(SessionEvent::SendFinished {
                generation,
                result: Err(StreamError::ChannelClosed),
            });
            return;
        };

        let settings = self.settings.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = run_pump(ticket, channel, settings, events.clone()).await;
            let _ = events.send(SessionEvent::SendFinished { generation, result });
        });
    }

    // ── Inbound frames ───────────────────────────────────────────────────

    async fn on_frame(&mut self, raw: RawFrame) {
        let frame = match decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event = "frame_dropped", error = %e, "Undecodable frame dropped");
                return;
            }
        };

        match self.receiver.accept(frame) {
            ReceiveOutcome::Opened { meta, displaced } => {
                if let Some(prev) = displaced {
                    let actions = self.scheduler.inbound_finished(&prev, TransferStatus::Error);
                    self.apply(actions);
                }
                match self.scheduler.inbound_opened(&meta) {
                    Ok(actions) => {
                        self.recv_progress = ProgressThrottle::new(self.settings.progress_interval);
                        self.apply(actions);
                    }
                    Err(e) => {
                        warn!(event = "meta_refused", id = %meta.id, error = %e, "META for a known job refused");
                        self.receiver.abort();
                    }
                }
            }
            ReceiveOutcome::Progress { id, received } => {
                if self.recv_progress.ready(Instant::now()) {
                    let actions = self.scheduler.inbound_progress(&id, received);
                    self.apply(actions);
                }
            }
            ReceiveOutcome::Completed(file) => {
                self.send_control(Frame::Ack).await;
                let id = file.meta.id.clone();
                self.scheduler.inbound_assembled(&id);

                let store = self.store.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = store.save(&file.meta.name, file.data).await;
                    let _ = events.send(SessionEvent::Stored { id, result });
                });
            }
            ReceiveOutcome::SizeMismatch { id, .. } => {
                let actions = self.scheduler.inbound_finished(&id, TransferStatus::Error);
                self.apply(actions);
            }
            ReceiveOutcome::Chat(chat) => self.publish(SessionUpdate::Chat {
                from_me: false,
                id: chat.id,
                text: chat.text,
            }),
            ReceiveOutcome::Ack => match self.pending_ack.take() {
                Some(ack) => {
                    let _ = ack.send(());
                }
                // ACKs carry no id: one that arrives before the current
                // DONE went out answers an earlier transfer.
                None => debug!("Acknowledgment with no DONE awaiting it, dropped"),
            },
            ReceiveOutcome::Heartbeat => trace!("Heartbeat"),
            ReceiveOutcome::Dropped(anomaly) => debug!(?anomaly, "Frame dropped"),
        }
    }

    async fn send_control(&self, frame: Frame) {
        let Some(channel) = &self.channel else {
            return;
        };
        if let Err(e) = send_raw(channel.as_ref(), frame.encode()).await {
            warn!(event = "control_send_failed", error = %e, "Control frame not sent");
        }
    }

    fn publish(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }
}

async fn send_raw(channel: &dyn DataChannel, raw: RawFrame) -> Result<()> {
    match raw {
        RawFrame::Text(text) => channel.send_text(text).await,
        RawFrame::Binary(data) => channel.send_binary(data).await,
    }
}

async fn run_pump(
    ticket: SendTicket,
    channel: Arc<dyn DataChannel>,
    settings: TransferSettings,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> Result<StreamReport, StreamError> {
    let generation = ticket.generation;
    let source = tokio::fs::File::open(&ticket.path).await?;
    let stream = ChunkStream::new(channel, settings, ticket.cancel);
    let armer = events.clone();
    let arm_ack = move || {
        let (ack, wait) = oneshot::channel();
        let _ = armer.send(SessionEvent::AwaitingAck { generation, ack });
        wait
    };
    stream
        .run(ticket.meta, source, arm_ack, move |sent| {
            let _ = events.send(SessionEvent::SendProgress { generation, sent });
        })
        .await
}
