//! onsong-relay: relay server binary.
//!
//! Accepts agent WebSocket uplinks and tenant HTTP calls on one port.

use clap::Parser;
use onsong_relay::{RelayConfig, RelayServer};
use std::path::PathBuf;
use tracing::{error, info};

/// onsong-relay: routes tenant calls to local-network agents
#[derive(Parser, Debug)]
#[command(name = "onsong-relay", version, about = "OnSong bridge relay server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.onsong/relay.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting onsong-relay");

    let config_path = PathBuf::from(&cli.config);
    let config = match RelayConfig::load(Some(&config_path), cli.bind, cli.port) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = RelayServer::new(config);
    let listener = match server.bind().await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind listener");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.serve(listener, shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("onsong-relay stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("received shutdown signal");
}
