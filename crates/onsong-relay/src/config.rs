//! Relay configuration: TOML file + CLI overrides.

use onsong_core::{BridgeError, BridgeResult, DEFAULT_TIMEOUT};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_discover_timeout_ms")]
    pub discover_timeout_ms: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            request_timeout_ms: default_request_timeout_ms(),
            discover_timeout_ms: default_discover_timeout_ms(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_request_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}
fn default_discover_timeout_ms() -> u64 {
    10_000
}
fn default_ping_interval_secs() -> u64 {
    30
}

/// Resolved relay configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: String,
    pub port: u16,
    /// Wait for an `api-response` before answering 504.
    pub request_timeout: Duration,
    /// Wait for a `discover-response` before answering 504.
    pub discover_timeout: Duration,
    /// Interval between relay → agent pings.
    pub ping_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default(), None, None)
    }
}

impl RelayConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind: Option<String>,
        cli_port: Option<u16>,
    ) -> BridgeResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| BridgeError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Ok(Self::from_file(file_config, cli_bind, cli_port))
    }

    fn from_file(file: ConfigFile, cli_bind: Option<String>, cli_port: Option<u16>) -> Self {
        Self {
            bind: cli_bind.unwrap_or(file.server.bind),
            port: cli_port.unwrap_or(file.server.port),
            request_timeout: Duration::from_millis(file.server.request_timeout_ms),
            discover_timeout: Duration::from_millis(file.server.discover_timeout_ms),
            ping_interval: Duration::from_secs(file.server.ping_interval_secs.max(1)),
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
