//! Duomesh Node - bridges two mesh radio networks
//!
//! This binary loads a JSON bridge configuration, opens both radio links
//! and logs every packet that arrives. With `--ping` it also answers
//! `ping` with `pong` on whichever network the request came from.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use duomesh_bridge::{
    BridgeConfig, CommandProcessor, DualNetworkRouter, LoggingSink, Packet, Reply,
};

#[derive(Parser)]
#[command(name = "duomesh-node")]
#[command(about = "Dual-network mesh radio bridge")]
struct Args {
    /// Bridge configuration (JSON)
    #[arg(long, short)]
    config: PathBuf,

    /// Escalation marker file (overrides the config)
    #[arg(long)]
    marker: Option<PathBuf>,

    /// Answer "ping" with "pong"
    #[arg(long)]
    ping: bool,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

/// Replies to `ping`
struct PingResponder;

#[async_trait]
impl CommandProcessor for PingResponder {
    async fn process(&self, packet: &Packet) -> Option<Reply> {
        let text = packet.text()?;
        text.trim()
            .eq_ignore_ascii_case("ping")
            .then(|| Reply::to_sender("pong"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = BridgeConfig::from_json_file(&args.config)?;
    if let Some(marker) = args.marker {
        config.watchdog.marker_path = Some(marker);
    }

    info!(
        "Starting Duomesh Node v{} with {} network(s)",
        duomesh_bridge::VERSION,
        config.networks.len()
    );
    for network in &config.networks {
        info!(network = %network.network, endpoint = %network.transport.endpoint(), "Configured link");
    }

    let router = DualNetworkRouter::builder(config).start().await?;
    if router.is_single_network() {
        warn!(networks = ?router.active_networks(), "Running in single-network mode");
    }

    let processor: Option<Arc<dyn CommandProcessor>> = if args.ping {
        Some(Arc::new(PingResponder))
    } else {
        None
    };
    let consumer = tokio::spawn(router.clone().run(Arc::new(LoggingSink), processor));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    router.shutdown().await;
    consumer.await??;

    println!("{}", serde_json::to_string_pretty(&router.stats())?);
    Ok(())
}
