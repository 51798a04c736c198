//! Wire messages exchanged between the relay and its agents.
//!
//! Every message is a JSON object whose `type` field selects the variant:
//!
//! | `type`              | direction       | correlated |
//! |---------------------|-----------------|------------|
//! | `register`          | agent → relay   | no         |
//! | `registered`        | relay → agent   | no         |
//! | `error`             | relay → agent   | no         |
//! | `discover`          | relay → agent   | yes        |
//! | `discover-response` | agent → relay   | yes        |
//! | `api-request`       | relay → agent   | yes        |
//! | `api-response`      | agent → relay   | yes        |
//! | `ping` / `pong`     | both            | no         |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Correlation id carried as `requestId` on request/response pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId(s.to_string())
    }
}

/// A control message on the relay ↔ agent socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    Register(RegisterPayload),
    Registered { message: String },
    Error { message: String },
    Discover(DiscoverRequest),
    DiscoverResponse(DiscoverResponse),
    ApiRequest(ApiRequest),
    ApiResponse(ApiResponse),
    Ping,
    Pong,
}

impl Message {
    /// Every `type` value this protocol version understands.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "register",
        "registered",
        "error",
        "discover",
        "discover-response",
        "api-request",
        "api-response",
        "ping",
        "pong",
    ];

    /// The wire `type` tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Register(_) => "register",
            Message::Registered { .. } => "registered",
            Message::Error { .. } => "error",
            Message::Discover(_) => "discover",
            Message::DiscoverResponse(_) => "discover-response",
            Message::ApiRequest(_) => "api-request",
            Message::ApiResponse(_) => "api-response",
            Message::Ping => "ping",
            Message::Pong => "pong",
        }
    }

    /// The correlation id, for message kinds that carry one.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Message::Discover(m) => Some(&m.request_id),
            Message::DiscoverResponse(m) => Some(&m.request_id),
            Message::ApiRequest(m) => Some(&m.request_id),
            Message::ApiResponse(m) => Some(&m.request_id),
            _ => None,
        }
    }
}

/// `register`: the first message an agent sends after connecting.
///
/// Every field is optional on the wire; the relay validates the required
/// ones (`churchToolsUrl`, `secret`, `uuid`) and answers with `error`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub church_tools_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverRequest {
    pub request_id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverResponse {
    pub request_id: RequestId,
    pub success: bool,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A locally discovered device as reported to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    pub port: u16,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequest {
    pub request_id: RequestId,
    pub target_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub request_id: RequestId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    /// A failed response carrying only an error text.
    pub fn failure(request_id: RequestId, error: impl Into<String>) -> Self {
        Self {
            request_id,
            success: false,
            status_code: None,
            headers: None,
            data: None,
            error: Some(error.into()),
        }
    }
}
