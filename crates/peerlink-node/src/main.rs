//! Demo node for the Peerlink session layer.

mod cli;

use async_trait::async_trait;
use clap::Parser;
use cli::Cli;
use peerlink_wire::{
    load_config, Message, Network, NetworkConfig, PeerSession, Plugin, PluginContext, WireError,
};
use serde::{Deserialize, Serialize};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping {
    seq: u32,
}

impl Message for Ping {
    const TYPE_TAG: &'static str = "demo.ping";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Pong {
    seq: u32,
}

impl Message for Pong {
    const TYPE_TAG: &'static str = "demo.pong";
}

/// Answers Ping with Pong and logs peer comings and goings.
struct Echo;

#[async_trait]
impl Plugin for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn on_peer_connect(&self, session: &Arc<PeerSession>) {
        info!(peer = %session.remote_address(), "Peer connected");
    }

    async fn on_peer_disconnect(&self, session: &Arc<PeerSession>) {
        info!(peer = %session.remote_address(), "Peer disconnected");
    }

    async fn on_message(&self, ctx: &PluginContext) -> Result<(), WireError> {
        if let Some(ping) = ctx.message::<Ping>() {
            info!(from = %ctx.remote_id_hex(), seq = ping.seq, "Ping");
            ctx.reply(&Pong { seq: ping.seq }).await?;
        } else if let Some(pong) = ctx.message::<Pong>() {
            info!(from = %ctx.remote_id_hex(), seq = pong.seq, "Pong");
        }
        Ok(())
    }
}

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config(cli: &Cli) -> NetworkConfig {
    let mut config = match &cli.config {
        Some(path) => load_config(path),
        None => NetworkConfig::default(),
    };
    if let Some(addr) = &cli.addr {
        config.listen_addr = addr.clone();
    }
    config
}

async fn run(cli: Cli) -> Result<(), WireError> {
    let network = Network::from_config(resolve_config(&cli))?;
    network.register_message::<Ping>();
    network.register_message::<Pong>();
    network.add_plugin(Arc::new(Echo));

    let accept_handle = network.listen().await?;
    println!("{}", network.address());

    for peer in &cli.peer {
        match network.new_session(peer).await {
            Ok(session) => {
                for seq in 0..cli.pings {
                    if let Err(e) = session.send(&Ping { seq }).await {
                        error!(peer = %peer, error = %e, "Ping failed");
                        break;
                    }
                }
            }
            Err(e) => error!(peer = %peer, error = %e, "Dial failed"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    network.close();
    let _ = accept_handle.await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing_stderr();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Node failed");
            ExitCode::FAILURE
        }
    }
}
