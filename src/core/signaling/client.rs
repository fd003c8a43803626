//! The relay connection task.
//!
//! Owns the websocket, the [`Outbox`] and the [`ReconnectBackoff`]. Callers
//! talk to it through a [`SignalingHandle`] and hear back through an event
//! sender; the task survives any number of relay drops until the stop
//! signal fires.

use anyhow::{Context, Result};
use futures_util::{Sink, SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use super::backoff::ReconnectBackoff;
use super::message::SignalMessage;
use super::outbox::Outbox;
use crate::core::config::{RECONNECT_BASE, RECONNECT_CAP, RELAY_SESSION_PATH, SIGNALING_KEEPALIVE};
use crate::utils::sos::SignalOfStop;

/// What the relay connection reports to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Up,
    Down,
    Message(SignalMessage),
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub url: String,
    pub join: SignalMessage,
    pub keepalive: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
}

impl SignalingConfig {
    pub fn new(url: String, join: SignalMessage) -> Self {
        Self {
            url,
            join,
            keepalive: SIGNALING_KEEPALIVE,
            reconnect_base: RECONNECT_BASE,
            reconnect_cap: RECONNECT_CAP,
        }
    }
}

/// `ws://relay` + `/api/ws/session/<id>`.
pub fn session_url(relay: &str, session_id: &str) -> String {
    format!("{}{RELAY_SESSION_PATH}/{session_id}", relay.trim_end_matches('/'))
}

/// Cheap, cloneable sender into the relay task. Never blocks; messages
/// are queued while the relay is unreachable.
#[derive(Debug, Clone)]
pub struct SignalingHandle {
    tx: mpsc::UnboundedSender<SignalMessage>,
}

impl SignalingHandle {
    pub fn send(&self, msg: SignalMessage) {
        if self.tx.send(msg).is_err() {
            debug!("Signaling task is gone, dropping message");
        }
    }

    /// A handle whose messages land in the returned receiver.
    #[cfg(test)]
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<SignalMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

/// Spawn the relay task.
pub fn spawn<E>(
    config: SignalingConfig,
    events: mpsc::UnboundedSender<E>,
    sos: SignalOfStop,
) -> (SignalingHandle, JoinHandle<()>)
where
    E: From<SignalingEvent> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run(config, rx, events, sos));
    (SignalingHandle { tx }, handle)
}

enum Exit {
    /// The relay went away; reconnect.
    Closed,
    /// Stop signal or every handle dropped.
    Shutdown,
}

async fn run<E>(
    config: SignalingConfig,
    mut commands: mpsc::UnboundedReceiver<SignalMessage>,
    events: mpsc::UnboundedSender<E>,
    sos: SignalOfStop,
) where
    E: From<SignalingEvent> + Send + 'static,
{
    let mut outbox = Outbox::new();
    let mut backoff = ReconnectBackoff::new(config.reconnect_base, config.reconnect_cap);

    loop {
        info!(event = "relay_connecting", url = %config.url, "Connecting to signaling relay");
        let connected = tokio::select! {
            res = connect_async(config.url.as_str()) => res,
            _ = sos.wait() => return,
        };

        match connected {
            Ok((ws, _)) => {
                backoff.reset();
                let result = serve(ws, &config, &mut outbox, &mut commands, &events, &sos).await;
                outbox.on_close();
                let _ = events.send(SignalingEvent::Down.into());
                match result {
                    Ok(Exit::Shutdown) => return,
                    Ok(Exit::Closed) => info!(event = "relay_closed", "Relay connection closed"),
                    Err(e) => warn!(event = "relay_error", error = %e, "Relay connection lost"),
                }
            }
            Err(e) => {
                warn!(event = "relay_connect_failed", url = %config.url, error = %e, "Relay unreachable");
            }
        }

        let Some(delay) = backoff.schedule() else {
            continue;
        };
        info!(
            event = "relay_reconnect_scheduled",
            delay_ms = delay.as_millis() as u64,
            queued = outbox.len(),
            "Reconnecting to relay"
        );

        // Keep accepting outbound messages while waiting.
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = commands.recv() => match cmd {
                    Some(msg) => {
                        outbox.send(msg);
                    }
                    None => return,
                },
                _ = sos.wait() => return,
            }
        }
        backoff.fire();
    }
}

async fn serve<S, E>(
    ws: S,
    config: &SignalingConfig,
    outbox: &mut Outbox,
    commands: &mut mpsc::UnboundedReceiver<SignalMessage>,
    events: &mpsc::UnboundedSender<E>,
    sos: &SignalOfStop,
) -> Result<Exit>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
    E: From<SignalingEvent>,
{
    let (mut write, mut read) = ws.split();

    let mut pending = outbox.on_open(config.join.clone()).into_iter();
    while let Some(msg) = pending.next() {
        if let Err(e) = transmit(&mut write, &msg).await {
            for rest in pending.rev() {
                outbox.requeue_front(rest);
            }
            if !matches!(msg, SignalMessage::Join { .. }) {
                outbox.requeue_front(msg);
            }
            return Err(e);
        }
    }
    info!(event = "relay_connected", "Joined signaling relay");
    if events.send(SignalingEvent::Up.into()).is_err() {
        return Ok(Exit::Shutdown);
    }

    let mut keepalive = interval_at(Instant::now() + config.keepalive, config.keepalive);

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let Some(msg) = cmd else {
                    return Ok(Exit::Shutdown);
                };
                if let Some(msg) = outbox.send(msg) {
                    trace!(kind = msg.kind(), "Relay send");
                    if let Err(e) = transmit(&mut write, &msg).await {
                        outbox.requeue_front(msg);
                        return Err(e);
                    }
                }
            }
            frame = read.next() => {
                let text = match frame {
                    None | Some(Ok(Message::Close(_))) => return Ok(Exit::Closed),
                    Some(Err(e)) => return Err(e).context("relay read"),
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(_)) => continue,
                };
                match serde_json::from_str::<SignalMessage>(&text) {
                    Ok(SignalMessage::Pong | SignalMessage::Ping | SignalMessage::Unknown) => {
                        trace!("Relay keepalive or unknown message");
                    }
                    Ok(msg) => {
                        debug!(kind = msg.kind(), "Relay message");
                        if events.send(SignalingEvent::Message(msg).into()).is_err() {
                            return Ok(Exit::Shutdown);
                        }
                    }
                    Err(e) => warn!(event = "relay_bad_message", error = %e, "Unparseable relay message"),
                }
            }
            _ = keepalive.tick() => {
                transmit(&mut write, &SignalMessage::Ping).await?;
            }
            _ = sos.wait() => {
                let _ = transmit(&mut write, &SignalMessage::Leave).await;
                let _ = write.close().await;
                return Ok(Exit::Shutdown);
            }
        }
    }
}

async fn transmit<W>(write: &mut W, msg: &SignalMessage) -> Result<()>
where
    W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(msg).context("encode signal")?;
    write
        .send(Message::Text(text))
        .await
        .with_context(|| format!("relay send {}", msg.kind()))
}
