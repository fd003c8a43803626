//! Centralized configuration constants for peerdrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (frame prefixes, signaling
//! message tags) stay in their respective modules.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Payload bytes carried by one binary frame (64 KiB).
///
/// Matches the largest message the default SCTP receive path of common
/// peer-connection stacks accepts without fragmentation issues.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Sender read-ahead: chunks prefetched from the source while the pump is
/// busy sending or waiting for the channel to drain.
pub const SENDER_READ_AHEAD_CHUNKS: usize = 16;

/// Outstanding-buffer level above which the send pump suspends (1 MiB).
pub const DC_BUFFERED_AMOUNT_HIGH: usize = 1024 * 1024;

/// Outstanding-buffer level the channel must drain below before the pump
/// resumes (256 KiB). Also installed as the channel's low-water threshold.
pub const DC_BUFFERED_AMOUNT_LOW: usize = 256 * 1024;

/// Retries of a single frame send before the job is aborted.
pub const DC_SEND_MAX_RETRIES: u32 = 3;

/// Base delay of the linear send-retry backoff (`base × attempt`).
pub const DC_SEND_RETRY_BASE: Duration = Duration::from_millis(200);

/// Upper bound on one drain wait before the buffered amount is re-polled.
/// The low-water callback is edge-triggered, so a missed edge must not
/// stall the pump forever.
pub const DC_DRAIN_POLL: Duration = Duration::from_millis(50);

/// Minimum spacing between two progress reports of one transfer.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// How long the sender waits for `ACK_RECEIVED` after the completion marker.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Data-channel heartbeat period while the channel is open.
pub const DC_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Label of the single reliable, ordered data channel.
pub const DATA_CHANNEL_LABEL: &str = "file";

// ── Signaling ────────────────────────────────────────────────────────────────

/// Keepalive `ping` period on the relay connection.
pub const SIGNALING_KEEPALIVE: Duration = Duration::from_secs(15);

/// First reconnect delay after the relay connection drops.
pub const RECONNECT_BASE: Duration = Duration::from_secs(1);

/// Cap of the doubling reconnect delay.
pub const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Path prefix of the relay's per-session websocket endpoint.
pub const RELAY_SESSION_PATH: &str = "/api/ws/session";

/// Relay used when neither the CLI nor the config file names one.
pub const DEFAULT_RELAY: &str = "ws://localhost:8001";

// ── Negotiation ──────────────────────────────────────────────────────────────

/// ICE restarts allowed before the link is declared failed.
pub const MAX_ICE_RESTARTS: u32 = 3;

/// Minimum spacing between two ICE restart attempts.
pub const ICE_RESTART_SPACING: Duration = Duration::from_secs(5);

/// Delay before a restart triggered by a hard ICE failure.
pub const ICE_FAILURE_RESTART_DELAY: Duration = Duration::from_millis(1500);

/// STUN servers used when none are configured.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];

// ── Storage ──────────────────────────────────────────────────────────────────

/// Directory completed downloads are written to when none is configured.
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";

// ── Runtime settings ─────────────────────────────────────────────────────────

/// What the sender concludes when `ACK_RECEIVED` never arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckTimeoutPolicy {
    /// Optimistically mark the job completed.
    #[default]
    AssumeDelivered,
    /// Mark the job as failed.
    Fail,
}

impl FromStr for AckTimeoutPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assume-delivered" => Ok(Self::AssumeDelivered),
            "fail" => Ok(Self::Fail),
            other => Err(anyhow::anyhow!("unknown ack timeout policy: {other}")),
        }
    }
}

impl Display for AckTimeoutPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AssumeDelivered => f.write_str("assume-delivered"),
            Self::Fail => f.write_str("fail"),
        }
    }
}

/// Transfer tunables, defaulting to the constants above.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub high_water: usize,
    pub low_water: usize,
    pub max_send_retries: u32,
    pub retry_base: Duration,
    pub drain_poll: Duration,
    pub progress_interval: Duration,
    pub ack_timeout: Duration,
    pub ack_policy: AckTimeoutPolicy,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            high_water: DC_BUFFERED_AMOUNT_HIGH,
            low_water: DC_BUFFERED_AMOUNT_LOW,
            max_send_retries: DC_SEND_MAX_RETRIES,
            retry_base: DC_SEND_RETRY_BASE,
            drain_poll: DC_DRAIN_POLL,
            progress_interval: PROGRESS_INTERVAL,
            ack_timeout: ACK_TIMEOUT,
            ack_policy: AckTimeoutPolicy::default(),
        }
    }
}

/// Negotiation tunables.
#[derive(Debug, Clone)]
pub struct NegotiationSettings {
    pub max_ice_restarts: u32,
    pub restart_spacing: Duration,
    pub failure_restart_delay: Duration,
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self {
            max_ice_restarts: MAX_ICE_RESTARTS,
            restart_spacing: ICE_RESTART_SPACING,
            failure_restart_delay: ICE_FAILURE_RESTART_DELAY,
        }
    }
}
