//! Device Registry: the agent's view of OnSong devices on the local network.
//!
//! Fed by `up`/`down` presence events. A `down` never removes a device
//! immediately; it arms a removal timer for the grace period, and any `up`
//! for the same device before it fires cancels the removal. Every `up`
//! also stamps the device with a fresh sighting number, and a removal only
//! goes through if the device has not been sighted since its `down`.

use onsong_core::messages::DeviceInfo;
use onsong_core::KeyedTimers;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Attribute naming the device's role.
pub const ROLE_ATTRIBUTE: &str = "role";
/// Attribute carrying the stable device id.
pub const ID_ATTRIBUTE: &str = "id";

/// A presence announcement from the discovery collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescription {
    pub name: String,
    pub service_type: String,
    pub host: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub attributes: BTreeMap<String, String>,
}

impl ServiceDescription {
    /// The device id, if this service is an OnSong server or client.
    pub fn device_id(&self) -> Option<&str> {
        let role = self.attributes.get(ROLE_ATTRIBUTE)?;
        if role != "server" && role != "client" {
            return None;
        }
        self.attributes
            .get(ID_ATTRIBUTE)
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
    }

    fn has_ipv4(&self) -> bool {
        self.addresses.iter().any(IpAddr::is_ipv4)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub host: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub attributes: BTreeMap<String, String>,
}

impl Device {
    fn from_service(id: String, service: &ServiceDescription) -> Self {
        Self {
            id,
            name: service.name.clone(),
            host: service.host.clone(),
            addresses: service.addresses.clone(),
            port: service.port,
            attributes: service.attributes.clone(),
        }
    }

    /// Wire form for `discover-response`.
    pub fn to_info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            host: self.host.clone(),
            addresses: self.addresses.iter().map(ToString::to_string).collect(),
            port: self.port,
            attributes: self.attributes.clone(),
        }
    }
}

/// A device plus the number of its latest sighting.
#[derive(Debug)]
struct Tracked {
    device: Device,
    sighting: u64,
}

type DeviceTable = Arc<RwLock<HashMap<String, Tracked>>>;

pub struct DeviceRegistry {
    devices: DeviceTable,
    removals: KeyedTimers<String>,
    sightings: AtomicU64,
    grace: Duration,
}

impl DeviceRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            removals: KeyedTimers::new(),
            sightings: AtomicU64::new(0),
            grace,
        }
    }

    /// Handle a service coming up. Returns the device id when it qualified.
    pub async fn up(&self, service: &ServiceDescription) -> Option<String> {
        let id = service.device_id()?.to_string();

        if self.removals.cancel(&id).await {
            debug!(device = %id, "pending removal cancelled");
        }

        let mut devices = self.devices.write().await;
        let sighting = self.sightings.fetch_add(1, Ordering::Relaxed) + 1;
        match devices.get_mut(&id) {
            None => {
                info!(device = %id, name = %service.name, "device discovered");
                let device = Device::from_service(id.clone(), service);
                devices.insert(id.clone(), Tracked { device, sighting });
            }
            // Keep a known-good address rather than clobbering it with an empty record.
            Some(existing) if service.has_ipv4() => {
                existing.device = Device::from_service(id.clone(), service);
                existing.sighting = sighting;
                debug!(device = %id, "device updated");
            }
            Some(existing) => {
                existing.sighting = sighting;
                debug!(device = %id, "update without IPv4 address ignored");
            }
        }
        Some(id)
    }

    /// Handle a service going down. Unknown devices are ignored.
    pub async fn down(&self, service: &ServiceDescription) -> Option<String> {
        let id = service.device_id()?.to_string();
        let sighting = self.devices.read().await.get(&id)?.sighting;

        let devices = self.devices.clone();
        let fire_id = id.clone();
        self.removals
            .arm(id.clone(), self.grace, move || async move {
                if remove_unless_sighted(&devices, &fire_id, sighting).await {
                    info!(device = %fire_id, "device removed after grace period");
                }
            })
            .await;
        debug!(device = %id, grace_secs = self.grace.as_secs(), "device down, removal scheduled");
        Some(id)
    }

    /// Every known device, ordered by id.
    pub async fn snapshot(&self) -> Vec<Device> {
        let mut list: Vec<Device> = self
            .devices
            .read()
            .await
            .values()
            .map(|t| t.device.clone())
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn get(&self, id: &str) -> Option<Device> {
        self.devices.read().await.get(id).map(|t| t.device.clone())
    }

    /// The device advertising `address`, if any.
    pub async fn find_by_address(&self, address: &str) -> Option<Device> {
        let ip: IpAddr = address.parse().ok()?;
        self.devices
            .read()
            .await
            .values()
            .find(|t| t.device.addresses.contains(&ip))
            .map(|t| t.device.clone())
    }

    /// Whether a removal is scheduled for `id`.
    pub async fn pending_removal(&self, id: &str) -> bool {
        self.removals.is_armed(&id.to_string()).await
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Remove `id` if its latest sighting is still `sighting`.
async fn remove_unless_sighted(devices: &DeviceTable, id: &str, sighting: u64) -> bool {
    let mut devices = devices.write().await;
    match devices.get(id).map(|t| t.sighting) {
        Some(latest) if latest == sighting => {
            devices.remove(id);
            true
        }
        Some(_) => {
            debug!(device = %id, "device seen again, removal skipped");
            false
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::from_secs(600);

    fn service(id: &str, addresses: &[&str]) -> ServiceDescription {
        let mut attributes = BTreeMap::new();
        attributes.insert("role".to_string(), "server".to_string());
        attributes.insert("id".to_string(), id.to_string());
        ServiceDescription {
            name: format!("OnSong {id}"),
            service_type: "_onsong._tcp.local.".into(),
            host: format!("{id}.local."),
            addresses: addresses.iter().map(|a| a.parse().unwrap()).collect(),
            port: 80,
            attributes,
        }
    }

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn qualification() {
        let mut s = service("d1", &[]);
        assert_eq!(s.device_id(), Some("d1"));

        s.attributes.insert("role".into(), "printer".into());
        assert_eq!(s.device_id(), None);

        s.attributes.insert("role".into(), "client".into());
        s.attributes.insert("id".into(), "  ".into());
        assert_eq!(s.device_id(), None);

        s.attributes.remove("role");
        s.attributes.insert("id".into(), "d1".into());
        assert_eq!(s.device_id(), None);
    }

    #[tokio::test]
    async fn non_qualifying_service_ignored() {
        let reg = DeviceRegistry::new(GRACE);
        let mut s = service("d1", &["10.0.0.5"]);
        s.attributes.clear();
        assert_eq!(reg.up(&s).await, None);
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn update_requires_ipv4() {
        let reg = DeviceRegistry::new(GRACE);
        reg.up(&service("d1", &["10.0.0.5"])).await;

        let mut renamed = service("d1", &["fe80::1"]);
        renamed.name = "renamed".into();
        reg.up(&renamed).await;
        let d = reg.get("d1").await.unwrap();
        assert_eq!(d.name, "OnSong d1");
        assert_eq!(d.addresses, vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);

        let mut moved = service("d1", &["10.0.0.9"]);
        moved.name = "moved".into();
        reg.up(&moved).await;
        let d = reg.get("d1").await.unwrap();
        assert_eq!(d.name, "moved");
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn first_up_without_address_still_registers() {
        let reg = DeviceRegistry::new(GRACE);
        reg.up(&service("d1", &[])).await;
        assert!(reg.get("d1").await.is_some());
    }

    #[tokio::test]
    async fn down_for_unknown_device_ignored() {
        let reg = DeviceRegistry::new(GRACE);
        assert_eq!(reg.down(&service("ghost", &[])).await, None);
        assert!(!reg.pending_removal("ghost").await);
    }

    #[tokio::test(start_paused = true)]
    async fn down_then_up_within_grace_keeps_device() {
        let reg = DeviceRegistry::new(GRACE);
        let s = service("d1", &["10.0.0.5"]);
        reg.up(&s).await;
        reg.down(&s).await;
        assert!(reg.pending_removal("d1").await);

        tokio::time::advance(Duration::from_secs(300)).await;
        settle().await;
        reg.up(&s).await;
        assert!(!reg.pending_removal("d1").await);

        tokio::time::advance(Duration::from_secs(900)).await;
        settle().await;
        assert!(reg.get("d1").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn down_removes_only_after_grace() {
        let reg = DeviceRegistry::new(GRACE);
        let s = service("d1", &["10.0.0.5"]);
        reg.up(&s).await;
        reg.down(&s).await;

        tokio::time::advance(Duration::from_secs(599)).await;
        settle().await;
        assert!(reg.get("d1").await.is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert!(reg.get("d1").await.is_none());
        assert!(!reg.pending_removal("d1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_down_restarts_grace() {
        let reg = DeviceRegistry::new(GRACE);
        let s = service("d1", &["10.0.0.5"]);
        reg.up(&s).await;
        reg.down(&s).await;
        tokio::time::advance(Duration::from_secs(400)).await;
        settle().await;
        reg.down(&s).await;

        tokio::time::advance(Duration::from_secs(400)).await;
        settle().await;
        assert!(reg.get("d1").await.is_some());

        tokio::time::advance(Duration::from_secs(201)).await;
        settle().await;
        assert!(reg.get("d1").await.is_none());
    }

    #[tokio::test]
    async fn removal_skips_device_sighted_after_down() {
        let reg = DeviceRegistry::new(GRACE);
        let s = service("d1", &["10.0.0.5"]);
        reg.up(&s).await;
        let at_down = reg.devices.read().await["d1"].sighting;

        // An `up` that lands after the timer fired but before it removed.
        reg.up(&service("d1", &[])).await;
        assert!(!remove_unless_sighted(&reg.devices, "d1", at_down).await);
        assert!(reg.get("d1").await.is_some());

        let latest = reg.devices.read().await["d1"].sighting;
        assert!(latest > at_down);
        assert!(remove_unless_sighted(&reg.devices, "d1", latest).await);
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn snapshot_and_address_lookup() {
        let reg = DeviceRegistry::new(GRACE);
        reg.up(&service("b", &["10.0.0.2"])).await;
        reg.up(&service("a", &["10.0.0.1", "fe80::1"])).await;

        let ids: Vec<String> = reg.snapshot().await.into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert_eq!(reg.find_by_address("10.0.0.2").await.unwrap().id, "b");
        assert_eq!(reg.find_by_address("fe80::1").await.unwrap().id, "a");
        assert!(reg.find_by_address("10.0.0.3").await.is_none());
        assert!(reg.find_by_address("not-an-ip").await.is_none());

        let info = reg.get("a").await.unwrap().to_info();
        assert_eq!(info.addresses, vec!["10.0.0.1", "fe80::1"]);
    }
}
