//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file
//! - Merging CLI with file config (CLI takes precedence)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::config::{AckTimeoutPolicy, DEFAULT_DOWNLOAD_DIR, DEFAULT_RELAY, DEFAULT_STUN_SERVERS};

const DEFAULT_CONFIG_FILE: &str = "peerdrop.toml";

/// Peerdrop - browser-compatible P2P file transfer and chat over WebRTC.
#[derive(Parser, Deserialize, Clone, Debug, Default)]
#[command(author, version, about)]
#[command(propagate_version = true)]
#[serde(default)]
pub struct Args {
    #[command(subcommand)]
    #[serde(skip)]
    pub mode: Option<Mode>,

    /// Signaling relay base URL (ws:// or wss://).
    #[clap(long, global = true)]
    pub relay: Option<String>,

    /// Where received files are stored.
    #[clap(long, global = true)]
    pub download_dir: Option<PathBuf>,

    /// STUN server URL; repeat to use several.
    #[clap(long = "stun", global = true)]
    pub stun: Vec<String>,

    /// What to conclude when the receiver never acknowledges a file.
    #[clap(long, global = true)]
    pub ack_timeout_policy: Option<AckTimeoutPolicy>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Append logs to this file as well.
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// TOML configuration file. Defaults to ./peerdrop.toml when present.
    #[clap(long, global = true)]
    #[serde(skip)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Create a new session and wait for a peer.
    Host,
    /// Join an existing session.
    Join {
        /// The id printed by the host.
        session_id: String,
    },
}

impl Args {
    /// Load Args from CLI + TOML file (if any).
    /// CLI values override those from the file.
    pub fn load() -> Result<Self> {
        Self::resolve(Args::parse())
    }

    fn resolve(cli: Args) -> Result<Self> {
        match &cli.config {
            Some(path) => {
                let file = Self::from_file(path)?;
                Ok(Self::merge(file, cli))
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    let file = Self::from_file(default_path)?;
                    Ok(Self::merge(file, cli))
                } else {
                    Ok(cli)
                }
            }
        }
    }

    /// Load args from a TOML file.
    fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        toml::from_str::<Args>(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        file.mode = cli.mode;
        file.config = cli.config;
        if cli.relay.is_some() {
            file.relay = cli.relay;
        }
        if cli.download_dir.is_some() {
            file.download_dir = cli.download_dir;
        }
        if !cli.stun.is_empty() {
            file.stun = cli.stun;
        }
        if cli.ack_timeout_policy.is_some() {
            file.ack_timeout_policy = cli.ack_timeout_policy;
        }
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        if cli.log_file.is_some() {
            file.log_file = cli.log_file;
        }
        file
    }

    // ── Resolved values ──────────────────────────────────────────────────

    pub fn relay(&self) -> &str {
        self.relay.as_deref().unwrap_or(DEFAULT_RELAY)
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR))
    }

    pub fn stun_servers(&self) -> Vec<String> {
        if self.stun.is_empty() {
            DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
        } else {
            self.stun.clone()
        }
    }

    pub fn ack_policy(&self) -> AckTimeoutPolicy {
        self.ack_timeout_policy.unwrap_or_default()
    }

    /// Default tracing filter for the verbosity level.
    ///
    /// webrtc_ice logs every late STUN response as a warning; those are
    /// normal and kept out below trace.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn,peerdrop=info,webrtc_ice::agent=error",
            1 => "info,webrtc_ice::agent=error",
            2 => "debug,webrtc_ice::agent=error",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv.iter().copied()).unwrap()
    }

    #[test]
    fn test_host_and_join_modes() {
        assert_eq!(parse(&["peerdrop", "host"]).mode, Some(Mode::Host));
        assert_eq!(
            parse(&["peerdrop", "join", "abc-123"]).mode,
            Some(Mode::Join {
                session_id: "abc-123".into()
            })
        );
    }

    #[test]
    fn test_flags_after_subcommand() {
        let args = parse(&[
            "peerdrop",
            "join",
            "s1",
            "--relay",
            "wss://relay.example",
            "--stun",
            "stun:a:1",
            "--stun",
            "stun:b:2",
            "--ack-timeout-policy",
            "fail",
            "-vv",
        ]);
        assert_eq!(args.relay(), "wss://relay.example");
        assert_eq!(args.stun_servers(), ["stun:a:1", "stun:b:2"]);
        assert_eq!(args.ack_policy(), AckTimeoutPolicy::Fail);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.log_filter(), "debug,webrtc_ice::agent=error");
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["peerdrop", "host"]);
        assert_eq!(args.relay(), DEFAULT_RELAY);
        assert_eq!(args.download_dir(), PathBuf::from(DEFAULT_DOWNLOAD_DIR));
        assert_eq!(args.stun_servers().len(), DEFAULT_STUN_SERVERS.len());
        assert_eq!(args.ack_policy(), AckTimeoutPolicy::AssumeDelivered);
    }

    #[test]
    fn test_bad_policy_is_rejected() {
        assert!(Args::try_parse_from(["peerdrop", "host", "--ack-timeout-policy", "maybe"]).is_err());
    }

    #[test]
    fn test_toml_merge_cli_wins() {
        let file: Args = toml::from_str(
            r#"
            relay = "ws://file-relay"
            download_dir = "/tmp/in"
            stun = ["stun:file:1"]
            ack_timeout_policy = "fail"
            verbose = 1
            "#,
        )
        .unwrap();
        let cli = parse(&["peerdrop", "host", "--relay", "ws://cli-relay"]);

        let merged = Args::merge(file, cli);
        assert_eq!(merged.relay(), "ws://cli-relay");
        assert_eq!(merged.download_dir(), PathBuf::from("/tmp/in"));
        assert_eq!(merged.stun_servers(), ["stun:file:1"]);
        assert_eq!(merged.ack_policy(), AckTimeoutPolicy::Fail);
        assert_eq!(merged.verbose, 1);
        assert_eq!(merged.mode, Some(Mode::Host));
    }

    #[test]
    fn test_explicit_missing_config_is_an_error() {
        let cli = parse(&["peerdrop", "host", "--config", "/nonexistent/peerdrop.toml"]);
        assert!(Args::resolve(cli).is_err());
    }
}
