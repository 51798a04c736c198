//! JSON text framing for the relay ↔ agent socket.
//!
//! One message per WebSocket text frame. Decoding distinguishes three
//! outcomes: a known message, a well-formed object with an unrecognised
//! `type` (logged and dropped by callers), and a protocol error.

use crate::error::{BridgeError, BridgeResult};
use crate::messages::Message;

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(Message),
    Unknown { msg_type: String },
}

/// Serialize a message into a text frame.
pub fn encode(message: &Message) -> BridgeResult<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a text frame.
pub fn decode(text: &str) -> BridgeResult<Inbound> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| BridgeError::Protocol(format!("invalid json: {e}")))?;

    let msg_type = match value.get("type").and_then(|t| t.as_str()) {
        Some(t) => t.to_string(),
        None => return Err(BridgeError::Protocol("missing message type".into())),
    };

    if !Message::KNOWN_TYPES.contains(&msg_type.as_str()) {
        return Ok(Inbound::Unknown { msg_type });
    }

    serde_json::from_value(value)
        .map(Inbound::Message)
        .map_err(|e| BridgeError::Protocol(format!("malformed {msg_type}: {e}")))
}
