//! Agent bootstrap configuration.
//!
//! Written once by packaging and read at start-up:
//!
//! ```toml
//! church_tools_url = "https://a.church.tools"
//! secret = "s1"
//! uuid = "u1"
//! location = "Main hall"
//! public = false
//! relay_url = "wss://relay.example.org/ws"
//!
//! [timing]
//! watchdog_threshold_secs = 70
//! ```

use onsong_core::{BridgeError, BridgeResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const DEFAULT_SERVICE_TYPE: &str = "_onsong._tcp.local.";

/// Raw config file contents.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub church_tools_url: Option<String>,
    pub secret: Option<String>,
    pub uuid: Option<String>,
    pub location: Option<String>,
    #[serde(default)]
    pub public: bool,
    pub relay_url: Option<String>,
    pub service_type: Option<String>,
    #[serde(default)]
    pub timing: TimingSection,
}

/// `[timing]` overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingSection {
    #[serde(default = "default_watchdog_check_secs")]
    pub watchdog_check_secs: u64,
    #[serde(default = "default_watchdog_threshold_secs")]
    pub watchdog_threshold_secs: u64,
    #[serde(default = "default_reconnect_stale_ms")]
    pub reconnect_stale_ms: u64,
    #[serde(default = "default_reconnect_closed_ms")]
    pub reconnect_closed_ms: u64,
    #[serde(default = "default_device_grace_secs")]
    pub device_grace_secs: u64,
    #[serde(default = "default_auto_interval_ms")]
    pub auto_interval_ms: u64,
    #[serde(default = "default_auto_window_secs")]
    pub auto_window_secs: u64,
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    #[serde(default = "default_api_timeout_ms")]
    pub api_timeout_ms: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            watchdog_check_secs: default_watchdog_check_secs(),
            watchdog_threshold_secs: default_watchdog_threshold_secs(),
            reconnect_stale_ms: default_reconnect_stale_ms(),
            reconnect_closed_ms: default_reconnect_closed_ms(),
            device_grace_secs: default_device_grace_secs(),
            auto_interval_ms: default_auto_interval_ms(),
            auto_window_secs: default_auto_window_secs(),
            auth_timeout_ms: default_auth_timeout_ms(),
            api_timeout_ms: default_api_timeout_ms(),
        }
    }
}

fn default_watchdog_check_secs() -> u64 {
    10
}
fn default_watchdog_threshold_secs() -> u64 {
    70
}
fn default_reconnect_stale_ms() -> u64 {
    1_000
}
fn default_reconnect_closed_ms() -> u64 {
    5_000
}
fn default_device_grace_secs() -> u64 {
    600
}
fn default_auto_interval_ms() -> u64 {
    2_000
}
fn default_auto_window_secs() -> u64 {
    60
}
fn default_auth_timeout_ms() -> u64 {
    5_000
}
fn default_api_timeout_ms() -> u64 {
    30_000
}

/// Resolved timing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub watchdog_check: Duration,
    pub watchdog_threshold: Duration,
    /// Delay before reconnecting after the watchdog forced a close.
    pub reconnect_stale: Duration,
    /// Delay before reconnecting after the relay closed the socket.
    pub reconnect_closed: Duration,
    pub device_grace: Duration,
    pub auto_interval: Duration,
    pub auto_window: Duration,
    /// Timeout for device auth and ping calls.
    pub auth_timeout: Duration,
    /// Timeout for any other device call.
    pub api_timeout: Duration,
}

impl From<&TimingSection> for Timings {
    fn from(t: &TimingSection) -> Self {
        Self {
            watchdog_check: Duration::from_secs(t.watchdog_check_secs.max(1)),
            watchdog_threshold: Duration::from_secs(t.watchdog_threshold_secs),
            reconnect_stale: Duration::from_millis(t.reconnect_stale_ms),
            reconnect_closed: Duration::from_millis(t.reconnect_closed_ms),
            device_grace: Duration::from_secs(t.device_grace_secs),
            auto_interval: Duration::from_millis(t.auto_interval_ms.max(1)),
            auto_window: Duration::from_secs(t.auto_window_secs),
            auth_timeout: Duration::from_millis(t.auth_timeout_ms),
            api_timeout: Duration::from_millis(t.api_timeout_ms),
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self::from(&TimingSection::default())
    }
}

/// Resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub church_tools_url: String,
    pub secret: String,
    pub uuid: String,
    pub location: Option<String>,
    pub public: bool,
    pub relay_url: String,
    pub service_type: String,
    pub timings: Timings,
}

impl AgentConfig {
    /// Read the bootstrap file, then apply the CLI relay override.
    pub fn load(path: &Path, cli_relay_url: Option<String>) -> BridgeResult<Self> {
        let expanded = expand_tilde(path);
        info!(path = %expanded.display(), "loading agent config");
        let content = std::fs::read_to_string(&expanded).map_err(|e| {
            BridgeError::Config(format!("cannot read {}: {e}", expanded.display()))
        })?;
        let file = toml::from_str::<ConfigFile>(&content)
            .map_err(|e| BridgeError::Config(format!("config parse error: {e}")))?;
        Self::from_file(file, cli_relay_url)
    }

    /// Validate raw file contents. Every missing required field is reported.
    pub fn from_file(file: ConfigFile, cli_relay_url: Option<String>) -> BridgeResult<Self> {
        let relay_url = cli_relay_url.or(file.relay_url);
        let required = [
            ("church_tools_url", &file.church_tools_url),
            ("secret", &file.secret),
            ("uuid", &file.uuid),
            ("relay_url", &relay_url),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, v)| v.as_deref().map_or(true, |s| s.trim().is_empty()))
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(BridgeError::Config(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        let timings = Timings::from(&file.timing);
        Ok(Self {
            church_tools_url: file.church_tools_url.unwrap_or_default(),
            secret: file.secret.unwrap_or_default(),
            uuid: file.uuid.unwrap_or_default(),
            location: file.location.filter(|l| !l.trim().is_empty()),
            public: file.public,
            relay_url: relay_url.unwrap_or_default(),
            service_type: file
                .service_type
                .unwrap_or_else(|| DEFAULT_SERVICE_TYPE.to_string()),
            timings,
        })
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
