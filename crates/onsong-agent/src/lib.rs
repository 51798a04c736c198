//! onsong-agent: local-network side of the OnSong bridge.
//!
//! Keeps one WebSocket uplink to the relay, discovers OnSong devices on the
//! LAN over mDNS, and executes the device calls the relay forwards to it.

pub mod auto_request;
pub mod config;
pub mod device_client;
pub mod devices;
pub mod discovery;
pub mod dispatch;
pub mod uplink;
pub mod watchdog;

// Re-export primary public types.
pub use auto_request::{AutoKey, AutoRequestManager, Phase};
pub use config::{AgentConfig, Timings};
pub use device_client::{DeviceClient, DeviceRequest, DeviceResponse, HttpDeviceClient};
pub use devices::{Device, DeviceRegistry, ServiceDescription};
pub use dispatch::Dispatcher;
pub use uplink::{LinkOutcome, Uplink};

pub use onsong_core::{BridgeError, BridgeResult};
