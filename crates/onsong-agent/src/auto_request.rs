//! Auto-request state machine for device authentication.
//!
//! When a relayed call to a device's auth action fails, the agent keeps
//! retrying it on the user's behalf (the device shows an approval prompt
//! that may take a while to accept). Once the device accepts, the agent
//! keeps the grant alive with periodic ping calls for a while.
//!
//! ```text
//! start ──► AuthRetry ──(200)──► PingKeepalive ──(window)──► gone
//!               │
//!               └──(window without 200)──► gone
//! ```

use crate::config::Timings;
use crate::device_client::{DeviceClient, DeviceRequest};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout_at, Instant};
use tracing::{debug, info, warn};

/// The auth token in a device auth path (`/api/<token>/auth`).
pub fn auth_token(path: &str) -> Option<&str> {
    let path = path.split('?').next().unwrap_or(path);
    let mut segments = path.trim_matches('/').split('/');
    match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some("api"), Some(token), Some("auth"), None) if !token.is_empty() => Some(token),
        _ => None,
    }
}

pub fn ping_path(token: &str) -> String {
    format!("/api/{token}/ping")
}

/// (device id, auth token)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AutoKey {
    pub device_id: String,
    pub token: String,
}

impl AutoKey {
    pub fn new(device_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            token: token.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AuthRetry,
    PingKeepalive,
}

struct AutoState {
    generation: u64,
    phase: Phase,
    handle: JoinHandle<()>,
}

type StateTable = Arc<Mutex<HashMap<AutoKey, AutoState>>>;

pub struct AutoRequestManager {
    client: Arc<dyn DeviceClient>,
    timings: Timings,
    states: StateTable,
    generation: AtomicU64,
}

impl AutoRequestManager {
    pub fn new(client: Arc<dyn DeviceClient>, timings: Timings) -> Self {
        Self {
            client,
            timings,
            states: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Start retrying `auth` for `key`, replacing any state already running
    /// for it. Returns `true` when an earlier state was replaced.
    pub async fn start_auth_retry(&self, key: AutoKey, auth: DeviceRequest) -> bool {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let mut states = self.states.lock().await;

        let handle = tokio::spawn(run(
            self.client.clone(),
            self.states.clone(),
            key.clone(),
            generation,
            auth,
            self.timings,
        ));

        info!(device = %key.device_id, "device auth failed, retrying automatically");
        let previous = states.insert(
            key,
            AutoState {
                generation,
                phase: Phase::AuthRetry,
                handle,
            },
        );
        match previous {
            Some(old) => {
                old.handle.abort();
                true
            }
            None => false,
        }
    }

    pub async fn phase(&self, key: &AutoKey) -> Option<Phase> {
        self.states.lock().await.get(key).map(|s| s.phase)
    }

    pub async fn cancel(&self, key: &AutoKey) -> bool {
        match self.states.lock().await.remove(key) {
            Some(state) => {
                state.handle.abort();
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) {
        for (_, state) in self.states.lock().await.drain() {
            state.handle.abort();
        }
    }

    pub async fn active_count(&self) -> usize {
        self.states.lock().await.len()
    }
}

async fn run(
    client: Arc<dyn DeviceClient>,
    states: StateTable,
    key: AutoKey,
    generation: u64,
    auth: DeviceRequest,
    timings: Timings,
) {
    let started = Instant::now();
    let mut ticker = interval_at(started + timings.auto_interval, timings.auto_interval);
    let authed = timeout_at(started + timings.auto_window, async {
        loop {
            ticker.tick().await;
            match client.send(&auth).await {
                Ok(resp) if resp.status == 200 => break,
                Ok(resp) => debug!(device = %key.device_id, status = resp.status, "auth retry rejected"),
                Err(e) => debug!(device = %key.device_id, error = %e, "auth retry failed"),
            }
        }
    })
    .await
    .is_ok();

    if authed && set_phase(&states, &key, generation, Phase::PingKeepalive).await {
        info!(device = %key.device_id, "device auth accepted, keeping alive");
        let ping = DeviceRequest {
            method: "GET".into(),
            path: ping_path(&key.token),
            body: None,
            timeout: timings.auth_timeout,
            ..auth
        };
        let started = Instant::now();
        let mut ticker = interval_at(started + timings.auto_interval, timings.auto_interval);
        let _ = timeout_at(started + timings.auto_window, async {
            loop {
                ticker.tick().await;
                match client.send(&ping).await {
                    Ok(resp) if resp.is_success() => {}
                    Ok(resp) => warn!(device = %key.device_id, status = resp.status, "keepalive ping rejected"),
                    Err(e) => warn!(device = %key.device_id, error = %e, "keepalive ping failed"),
                }
            }
        })
        .await;
    } else if !authed {
        info!(device = %key.device_id, "device auth not accepted in time, giving up");
    }

    let mut states = states.lock().await;
    if states.get(&key).is_some_and(|s| s.generation == generation) {
        states.remove(&key);
    }
}

async fn set_phase(states: &StateTable, key: &AutoKey, generation: u64, phase: Phase) -> bool {
    match states.lock().await.get_mut(key) {
        Some(state) if state.generation == generation => {
            state.phase = phase;
            true
        }
        _ => false,
    }
}
