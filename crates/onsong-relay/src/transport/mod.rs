//! Agent-facing transport.

pub mod websocket;
