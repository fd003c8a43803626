//! Line-oriented front end.
//!
//! Reads commands from stdin and prints session updates to stdout. Logs
//! stay on stderr so the two never interleave mid-line.

use std::io::BufRead;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::session_loop::{Command, SessionEvent, SessionUpdate};
use crate::core::transfer::{TransferJob, TransferStatus};
use crate::utils::sos::SignalOfStop;

pub const HELP: &str = "\
commands:
  /send <path>   queue a file
  /cancel <id>   cancel a queued or running transfer (id prefix is fine)
  /jobs          list transfers
  /quit          leave the session
  anything else  is sent as a chat message";

/// What a console line asks for.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Command(Command),
    Help,
    Unknown(String),
}

/// Parse one console line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Input::Command(Command::Say(line.to_string())));
    };

    let (verb, arg) = match rest.split_once(char::is_whitespace) {
        Some((verb, arg)) => (verb, arg.trim()),
        None => (rest, ""),
    };
    let input = match (verb, arg) {
        ("send", path) if !path.is_empty() => Input::Command(Command::SendFile(PathBuf::from(path))),
        ("cancel", id) if !id.is_empty() => Input::Command(Command::Cancel(id.to_string())),
        ("jobs", _) => Input::Command(Command::ListJobs),
        ("quit" | "exit", _) => Input::Command(Command::Shutdown),
        ("help", _) => Input::Help,
        _ => Input::Unknown(line.to_string()),
    };
    Some(input)
}

/// Converts bytes to human-readable file size format
pub fn format_file_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn format_job(job: &TransferJob) -> String {
    let (arrow, done) = if job.is_outbound() {
        ("->", job.sent_bytes)
    } else {
        ("<-", job.recv_bytes)
    };
    let progress = match job.status {
        TransferStatus::Sending | TransferStatus::Receiving if job.size > 0 => {
            format!(" {}%", done.saturating_mul(100) / job.size)
        }
        _ => String::new(),
    };
    format!(
        "[{}] {arrow} {} ({}) {}{progress}",
        short_id(&job.id),
        job.name,
        format_file_size(job.size),
        job.status.label(),
    )
}

/// One console line (or several, for a job list) per update.
pub fn render(update: &SessionUpdate) -> String {
    match update {
        SessionUpdate::Job(job) => format_job(job),
        SessionUpdate::Chat { from_me: true, text, .. } => format!("me: {text}"),
        SessionUpdate::Chat { from_me: false, text, .. } => format!("peer: {text}"),
        SessionUpdate::Link(state) => format!("* link {}", state.label()),
        SessionUpdate::Signaling { connected: true } => "* relay connected".to_string(),
        SessionUpdate::Signaling { connected: false } => "* relay unreachable, retrying".to_string(),
        SessionUpdate::Saved { path, .. } => format!("* saved {}", path.display()),
        SessionUpdate::Jobs(jobs) if jobs.is_empty() => "no transfers".to_string(),
        SessionUpdate::Jobs(jobs) => jobs.iter().map(format_job).collect::<Vec<_>>().join("\n"),
        SessionUpdate::Notice(text) => format!("! {text}"),
    }
}

/// Spawn the stdin reader and the update printer.
///
/// stdin is read on a plain thread that is never joined: a blocking read
/// cannot be interrupted, and the runtime must not wait on it at exit.
pub fn spawn(
    events: mpsc::UnboundedSender<SessionEvent>,
    mut updates: mpsc::UnboundedReceiver<SessionUpdate>,
    sos: SignalOfStop,
) -> JoinHandle<()> {
    let reader_sos = sos.clone();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if reader_sos.cancelled() {
                return;
            }
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    debug!("stdin read failed: {e}");
                    return;
                }
            };
            match parse_line(&line) {
                Some(Input::Command(command)) => {
                    if events.send(command.into()).is_err() {
                        return;
                    }
                }
                Some(Input::Help) => println!("{HELP}"),
                Some(Input::Unknown(line)) => println!("! unknown command: {line} (try /help)"),
                None => {}
            }
        }
        debug!("stdin closed");
        let _ = events.send(Command::Shutdown.into());
    });

    tokio::spawn(async move {
        loop {
            let update = tokio::select! {
                _ = sos.wait() => break,
                update = updates.recv() => update,
            };
            let Some(update) = update else { break };
            println!("{}", render(&update));
        }
    })
}
