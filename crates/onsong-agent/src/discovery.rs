//! mDNS discovery: browses for OnSong services and turns resolve/remove
//! events into `up`/`down` presence events for the Device Registry.
//!
//! mdns-sd delivers events on a blocking channel, so the browse loop runs on
//! the blocking pool and forwards into a tokio channel.

use crate::devices::{DeviceRegistry, ServiceDescription};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use onsong_core::{BridgeError, BridgeResult};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Up(ServiceDescription),
    Down(ServiceDescription),
}

/// Remembers the last description per service fullname, so a removal
/// (which only carries the name) can be reported with its attributes.
#[derive(Debug, Default)]
pub struct ServiceTracker {
    known: HashMap<String, ServiceDescription>,
}

impl ServiceTracker {
    pub fn resolved(&mut self, fullname: &str, description: ServiceDescription) -> PresenceEvent {
        self.known.insert(fullname.to_string(), description.clone());
        PresenceEvent::Up(description)
    }

    pub fn removed(&mut self, fullname: &str) -> Option<PresenceEvent> {
        self.known.remove(fullname).map(PresenceEvent::Down)
    }
}

/// Translate a resolved mDNS record.
pub fn describe(info: &ServiceInfo, service_type: &str) -> ServiceDescription {
    let fullname = info.get_fullname();
    let name = fullname
        .strip_suffix(service_type)
        .map(|n| n.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string();

    let mut addresses: Vec<_> = info.get_addresses().iter().copied().collect();
    addresses.sort();

    let attributes: BTreeMap<String, String> = info
        .get_properties()
        .iter()
        .map(|p| (p.key().to_string(), p.val_str().to_string()))
        .collect();

    ServiceDescription {
        name,
        service_type: service_type.to_string(),
        host: info.get_hostname().to_string(),
        addresses,
        port: info.get_port(),
        attributes,
    }
}

/// A running mDNS browse.
pub struct Discovery {
    daemon: ServiceDaemon,
}

impl Discovery {
    /// Start browsing `service_type`; events arrive on the returned channel.
    pub fn start(service_type: &str) -> BridgeResult<(Self, mpsc::Receiver<PresenceEvent>)> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| BridgeError::Other(format!("mDNS daemon start failed: {e}")))?;
        let browse = daemon
            .browse(service_type)
            .map_err(|e| BridgeError::Other(format!("mDNS browse failed: {e}")))?;

        info!(service_type, "mDNS browse started");

        let (tx, rx) = mpsc::channel(64);
        let service_type = service_type.to_string();
        tokio::task::spawn_blocking(move || {
            let mut tracker = ServiceTracker::default();
            while let Ok(event) = browse.recv() {
                let presence = match event {
                    ServiceEvent::ServiceResolved(info) => {
                        Some(tracker.resolved(info.get_fullname(), describe(&info, &service_type)))
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => tracker.removed(&fullname),
                    ServiceEvent::SearchStopped(_) => break,
                    _ => None,
                };
                if let Some(presence) = presence {
                    if tx.blocking_send(presence).is_err() {
                        break;
                    }
                }
            }
            debug!("mDNS browse loop ended");
        });

        Ok((Self { daemon }, rx))
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.daemon.shutdown() {
            warn!(error = %e, "mDNS daemon shutdown failed");
        }
    }
}

/// Apply presence events to the registry until the channel closes.
pub async fn feed(devices: &DeviceRegistry, mut events: mpsc::Receiver<PresenceEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            PresenceEvent::Up(service) => {
                if devices.up(&service).await.is_none() {
                    debug!(name = %service.name, "ignoring non-OnSong service");
                }
            }
            PresenceEvent::Down(service) => {
                devices.down(&service).await;
            }
        }
    }
}
