//! onsong-relay: always-on relay between browser tenants and local agents.
//!
//! Agents dial in over WebSocket and register under (tenant hostname,
//! instance id). Tenant HTTP calls are authorized against that registry and
//! forwarded to the agent as correlated requests over its socket.

pub mod auth;
pub mod config;
pub mod gateway;
pub mod registry;
pub mod server;
pub mod transport;

pub use config::RelayConfig;
pub use registry::{Session, SessionKey, SessionRegistry};
pub use server::{build_router, RelayServer, RelayState};
