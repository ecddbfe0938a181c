//! Passage
//!
//! A local proxy daemon that:
//! - Maintains one authenticated SSH connection to a remote server
//! - Runs local SOCKS5/HTTP proxy listeners
//! - Tunnels client traffic through per-destination SSH channels
//! - Reconnects with bounded exponential backoff when the connection drops

use anyhow::{Context, Result};
use clap::Parser;
use passage::{AppConfig, Tunnel};
use tracing::info;

/// Passage - SSH-backed SOCKS5/HTTP proxy
#[derive(Parser, Debug)]
#[command(name = "passage")]
#[command(about = "Local SOCKS5/HTTP proxy over a single SSH connection")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// SSH server host (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Local SOCKS5 proxy address (overrides config)
    #[arg(long)]
    socks5: Option<String>,

    /// Local HTTP proxy address (overrides config)
    #[arg(long)]
    http: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    // Load configuration
    let mut config = AppConfig::load(&args.config).context("Failed to load configuration")?;

    // Command-line overrides
    if let Some(server) = args.server {
        config.ssh.host = server;
    }
    if let Some(socks5) = args.socks5 {
        config.socks5.enabled = true;
        config.socks5.listen = socks5;
    }
    if let Some(http) = args.http {
        config.http.enabled = true;
        config.http.listen = http;
    }

    info!("passage v{} starting", passage::VERSION);
    let tunnel = Tunnel::load(config)
        .await
        .context("Failed to start tunnel")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("received shutdown signal");

    tunnel.shutdown().await;
    Ok(())
}
