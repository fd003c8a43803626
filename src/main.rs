mod core;
mod utils;
mod workers;

use anyhow::bail;
use std::env;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::core::artifacts::ArtifactStore;
use crate::core::config::{NegotiationSettings, TransferSettings};
use crate::core::connection::NegotiationEngine;
use crate::core::connection::rtc::{RtcPeer, sink};
use crate::core::session::SessionIdentity;
use crate::core::session_loop::{SessionEvent, SessionLoop};
use crate::core::signaling::client::{self, session_url};
use crate::core::signaling::{SignalMessage, SignalingConfig};
use crate::utils::log_file::FileLogLayer;
use crate::utils::sos::SignalOfStop;
use workers::args::{Args, Mode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load()?;

    // RUST_LOG wins over -v when set.
    let filter_layer = match env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(args.log_filter()),
    };
    let file_layer = args.log_file.as_deref().map(FileLogLayer::new).transpose()?;

    // Logs go to stderr; stdout belongs to the console.
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    let identity = match &args.mode {
        Some(Mode::Host) => SessionIdentity::host(),
        Some(Mode::Join { session_id }) => SessionIdentity::join(session_id.clone()),
        None => bail!("choose a mode: `peerdrop host` or `peerdrop join <session-id>`"),
    };
    println!("session {} ({})", identity.session_id(), identity.role());
    println!("type /help for commands");
    info!(
        event = "session_start",
        session = identity.session_id(),
        client = identity.client_id(),
        role = %identity.role(),
        "Starting session"
    );

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    let (events_tx, events_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (updates_tx, updates_rx) = mpsc::unbounded_channel();

    let join = SignalMessage::Join {
        client_id: identity.client_id().to_string(),
        role: identity.role(),
    };
    let config = SignalingConfig::new(session_url(args.relay(), identity.session_id()), join);
    let (signaling, signaling_task) = client::spawn(config, events_tx.clone(), sos.clone());

    let peer = RtcPeer::connect(&args.stun_servers(), sink(events_tx.clone())).await?;
    let engine = NegotiationEngine::new(&identity, peer, NegotiationSettings::default());

    let settings = TransferSettings {
        ack_policy: args.ack_policy(),
        ..TransferSettings::default()
    };
    let store = ArtifactStore::new(args.download_dir());
    println!("received files go to {}", store.dir().display());

    let printer = workers::console::spawn(events_tx.clone(), updates_rx, sos.clone());

    let session = SessionLoop::new(engine, signaling, store, settings, events_tx, updates_tx);
    let result = session.run(events_rx, sos.clone()).await;

    sos.cancel();
    let _ = signaling_task.await;
    let _ = printer.await;

    result
}
