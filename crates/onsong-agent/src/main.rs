//! onsong-agent: bridge agent binary.
//!
//! Runs inside the venue network, next to the OnSong devices.

use anyhow::Context;
use clap::Parser;
use onsong_agent::discovery::{self, Discovery};
use onsong_agent::{AgentConfig, AutoRequestManager, DeviceRegistry, Dispatcher, HttpDeviceClient, Uplink};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// onsong-agent: connects local OnSong devices to the bridge relay
#[derive(Parser, Debug)]
#[command(name = "onsong-agent", version, about = "OnSong bridge agent")]
struct Cli {
    /// Bootstrap config file
    #[arg(long, default_value = "./onsong-agent.toml")]
    config: String,

    /// Relay WebSocket URL (overrides the config file)
    #[arg(long)]
    relay_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Disable mDNS device discovery
    #[arg(long)]
    no_discovery: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting onsong-agent");

    let config = AgentConfig::load(&PathBuf::from(&cli.config), cli.relay_url)
        .context("failed to load agent config")?;
    info!(
        church_tools_url = %config.church_tools_url,
        uuid = %config.uuid,
        public = config.public,
        relay = %config.relay_url,
        "agent configured"
    );

    let client = Arc::new(HttpDeviceClient::new().context("failed to build device client")?);
    let devices = Arc::new(DeviceRegistry::new(config.timings.device_grace));
    let auto = Arc::new(AutoRequestManager::new(client.clone(), config.timings));
    let dispatcher = Dispatcher::new(devices.clone(), auto.clone(), client, config.timings);

    let discovery = if cli.no_discovery {
        info!("device discovery disabled");
        None
    } else {
        match Discovery::start(&config.service_type) {
            Ok((discovery, events)) => {
                let devices = devices.clone();
                tokio::spawn(async move { discovery::feed(&devices, events).await });
                Some(discovery)
            }
            Err(e) => {
                warn!(error = %e, "device discovery unavailable");
                None
            }
        }
    };

    Uplink::new(&config, dispatcher).run(shutdown_signal()).await;

    if let Some(discovery) = discovery {
        discovery.shutdown();
    }
    auto.cancel_all().await;

    info!("onsong-agent stopped");
    Ok(())
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
