//! portwarden supervisor daemon
//!
//! Starts the VPN tunnel and the download client, keeps the client's peer
//! port on the forwarded port, and shuts both down on SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pw_core::config::{self, SupervisorConfig};
use pw_supervisor::sync::TransmissionRpc;
use pw_supervisor::{Orchestrator, TorrentCleaner};

#[derive(Parser)]
#[command(name = "portwarden")]
#[command(about = "Keeps a VPN tunnel and a download client's forwarded port in sync")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "PORTWARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("portwarden starting...");

    let config = load_config(args.config.as_ref())?;

    let orchestrator =
        Orchestrator::from_config(config.clone()).context("Failed to set up supervisor")?;

    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, shutting down...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, shutting down...");
            }
        }

        cancel_clone.cancel();
    });

    let cleaner = if config.cleaner.enabled {
        let client = TransmissionRpc::new(config.client.rpc.clone())
            .context("Failed to create client RPC for the torrent cleaner")?;
        let cleaner = TorrentCleaner::new(Arc::new(client), config.cleaner.interval)
            .context("Invalid torrent cleaner configuration")?;
        Some(tokio::spawn(cleaner.run(cancel.child_token())))
    } else {
        None
    };

    let result = orchestrator.run(cancel.clone()).await;

    // A fatal orchestrator error also ends the cleaner
    cancel.cancel();
    if let Some(cleaner) = cleaner {
        if let Err(e) = cleaner.await {
            tracing::error!("Torrent cleaner task failed: {}", e);
        }
    }

    result.context("Supervisor failed")?;
    tracing::info!("portwarden shutdown complete");
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<SupervisorConfig> {
    if let Some(config_path) = path {
        return config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        config::load_config(&default_path)
            .with_context(|| format!("Failed to load config from {:?}", default_path))
    } else {
        tracing::info!(
            "No config at {:?}; using defaults",
            default_path
        );
        Ok(SupervisorConfig::default())
    }
}
