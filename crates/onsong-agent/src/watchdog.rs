//! Heartbeat watchdog for the relay uplink.
//!
//! The relay pings every agent periodically. Each inbound `ping` resets the
//! watchdog; if none arrives within the threshold the uplink is considered
//! stale and is torn down.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Watchdog {
    last_heartbeat: Instant,
    threshold: Duration,
}

impl Watchdog {
    pub fn new(threshold: Duration) -> Self {
        Self {
            last_heartbeat: Instant::now(),
            threshold,
        }
    }

    pub fn beat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    pub fn silence(&self) -> Duration {
        self.last_heartbeat.elapsed()
    }

    pub fn is_stale(&self) -> bool {
        self.silence() > self.threshold
    }
}
