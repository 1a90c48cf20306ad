//! Clap CLI definitions for the demo node.

use clap::Parser;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  peerlink-node                                   Listen on a random local port
  peerlink-node --addr tcp://0.0.0.0:4100         Listen on a fixed port
  peerlink-node --peer tcp://<hexkey>@host:4100   Dial a peer and ping it

Set RUST_LOG=debug to see per-message traffic.";

/// Peerlink demo node: listens for peers and answers Ping with Pong.
#[derive(Parser, Debug)]
#[command(name = "peerlink-node", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Listen address; overrides `listen_addr` from the config file.
    #[arg(long)]
    pub addr: Option<String>,

    /// Peer to dial on startup. May be repeated.
    #[arg(long)]
    pub peer: Vec<String>,

    /// Pings to send to each dialed peer.
    #[arg(long, default_value_t = 1)]
    pub pings: u32,
}
