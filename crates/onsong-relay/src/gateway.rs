//! Tenant-facing HTTP handlers.
//!
//! Each handler extracts credentials from the request headers, runs the
//! identity policy, and (for data-path calls) drives the session's
//! correlator. Errors map to status codes in one place, [`GatewayError`].

use crate::auth::{self, Credentials};
use crate::server::RelayState;
use axum::body::{Body, Bytes};
use axum::extract::{OriginalUri, Path, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use onsong_core::messages::{ApiRequest, ApiResponse, DiscoverRequest, DiscoverResponse};
use onsong_core::{BridgeError, Message};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Secret presented by the tenant.
pub const HEADER_AUTH: &str = "x-auth";
/// Agent instance id.
pub const HEADER_ID: &str = "x-id";
/// Target device address.
pub const HEADER_DEVICE_IP: &str = "onsongip";
/// Target device port (default 80).
pub const HEADER_DEVICE_PORT: &str = "onsongport";

const DEFAULT_DEVICE_PORT: u16 = 80;

/// Request headers that carry routing or identity and are never forwarded.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    HEADER_AUTH,
    HEADER_ID,
    HEADER_DEVICE_IP,
    HEADER_DEVICE_PORT,
    "host",
    "referer",
    "origin",
    "cookie",
    "connection",
    "content-length",
    "transfer-encoding",
    "accept-encoding",
];

/// Response headers recomputed by the relay rather than copied from the device.
const STRIPPED_RESPONSE_HEADERS: &[&str] =
    &["content-length", "transfer-encoding", "connection", "keep-alive"];

/// Error wrapper that renders a [`BridgeError`] as an HTTP response.
#[derive(Debug)]
pub struct GatewayError(pub BridgeError);

impl From<BridgeError> for GatewayError {
    fn from(e: BridgeError) -> Self {
        GatewayError(e)
    }
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            BridgeError::Validation(_) => StatusCode::BAD_REQUEST,
            BridgeError::MissingCredential(_) => StatusCode::UNAUTHORIZED,
            BridgeError::Unauthorized(_) => StatusCode::FORBIDDEN,
            BridgeError::Upstream(_) => StatusCode::BAD_GATEWAY,
            BridgeError::Timeout | BridgeError::Disconnected(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self.0 {
            BridgeError::Upstream(m)
            | BridgeError::Validation(m)
            | BridgeError::MissingCredential(m)
            | BridgeError::Unauthorized(m)
            | BridgeError::Disconnected(m) => m.clone(),
            BridgeError::Timeout => "no response from agent within timeout".to_string(),
            other => other.to_string(),
        };
        let body = json!({ "error": self.0.code(), "message": message });
        (status, Json(body)).into_response()
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Extract tenant credentials from request headers.
pub fn credentials(headers: &HeaderMap) -> Credentials {
    Credentials {
        origin: header_str(headers, "referer").or_else(|| header_str(headers, "origin")),
        instance_id: header_str(headers, HEADER_ID),
        secret: header_str(headers, HEADER_AUTH),
    }
}

/// `GET /health`
pub async fn health(State(state): State<Arc<RelayState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.registry.count().await,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /ws`: agent uplink.
pub async fn agent_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> Response {
    ws.on_upgrade(move |socket| crate::transport::websocket::handle_agent_socket(socket, state))
}

/// `GET /api/connection`: strict presence check for the browser UI.
pub async fn connection(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let session = auth::check_presence(&state.registry, &credentials(&headers)).await?;
    Ok(Json(json!({
        "connected": true,
        "location": session.location,
        "agentVersion": session.agent_version,
        "registeredAt": session.registered_at.to_rfc3339(),
        "lastSeen": session.last_seen().map(|t| t.to_rfc3339()),
    })))
}

/// `GET /api/discover`: list devices seen by the agent.
pub async fn discover(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let session = auth::authorize(&state.registry, &credentials(&headers)).await?;

    let reply = session
        .correlator()
        .request(
            |request_id| Message::Discover(DiscoverRequest { request_id }),
            state.config.discover_timeout,
        )
        .await?;

    match reply {
        Message::DiscoverResponse(DiscoverResponse {
            success: true,
            devices,
            ..
        }) => Ok(Json(json!({ "devices": devices }))),
        Message::DiscoverResponse(DiscoverResponse { error, .. }) => Err(BridgeError::Upstream(
            error.unwrap_or_else(|| "discovery failed".into()),
        )
        .into()),
        other => Err(unexpected_reply(&other).into()),
    }
}

/// `ANY /api/device/*path`: forward a call to a device behind the agent.
pub async fn device_call(
    State(state): State<Arc<RelayState>>,
    method: Method,
    Path(path): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let session = auth::authorize(&state.registry, &credentials(&headers)).await?;

    let target_ip = header_str(&headers, HEADER_DEVICE_IP)
        .ok_or_else(|| BridgeError::Validation(format!("missing {HEADER_DEVICE_IP} header")))?;
    let target_port = match header_str(&headers, HEADER_DEVICE_PORT) {
        Some(raw) => raw.parse::<u16>().map_err(|_| {
            BridgeError::Validation(format!("invalid {HEADER_DEVICE_PORT} header: {raw}"))
        })?,
        None => DEFAULT_DEVICE_PORT,
    };

    let device_path = match uri.query() {
        Some(q) => format!("/{path}?{q}"),
        None => format!("/{path}"),
    };

    let forwarded = forwardable_headers(&headers);
    let body = decode_body(&body);
    let method = method.as_str().to_string();

    debug!(key = %session.key, %target_ip, target_port, %method, path = %device_path, "forwarding device call");

    let reply = session
        .correlator()
        .request(
            move |request_id| {
                Message::ApiRequest(ApiRequest {
                    request_id,
                    target_ip,
                    target_port: Some(target_port),
                    method,
                    path: device_path,
                    headers: forwarded,
                    body,
                })
            },
            state.config.request_timeout,
        )
        .await?;

    match reply {
        Message::ApiResponse(resp) if resp.success => Ok(device_response(resp)),
        Message::ApiResponse(resp) => {
            let detail = resp
                .error
                .unwrap_or_else(|| "device call failed".to_string());
            let detail = match resp.status_code {
                Some(code) => format!("{detail} (device status {code})"),
                None => detail,
            };
            Err(BridgeError::Upstream(detail).into())
        }
        other => Err(unexpected_reply(&other).into()),
    }
}

fn unexpected_reply(msg: &Message) -> BridgeError {
    warn!(kind = msg.kind(), "unexpected reply kind from agent");
    BridgeError::Upstream(format!("unexpected reply: {}", msg.kind()))
}

fn forwardable_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !STRIPPED_REQUEST_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// JSON bodies travel as JSON, anything else as a string.
fn decode_body(body: &Bytes) -> Option<serde_json::Value> {
    if body.is_empty() {
        return None;
    }
    match serde_json::from_slice(body) {
        Ok(value) => Some(value),
        Err(_) => Some(serde_json::Value::String(
            String::from_utf8_lossy(body).into_owned(),
        )),
    }
}

/// Turn a successful `api-response` into the tenant's HTTP response.
fn device_response(resp: ApiResponse) -> Response {
    let status = resp
        .status_code
        .and_then(|c| StatusCode::from_u16(c).ok())
        .unwrap_or(StatusCode::OK);

    let mut builder = Response::builder().status(status);
    if let Some(headers) = &resp.headers {
        for (name, value) in headers {
            let lower = name.to_ascii_lowercase();
            if STRIPPED_RESPONSE_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(lower.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                builder = builder.header(name, value);
            }
        }
    }

    let body = match resp.data {
        None | Some(serde_json::Value::Null) => Body::empty(),
        Some(serde_json::Value::String(text)) => Body::from(text),
        Some(value) => Body::from(value.to_string()),
    };

    builder.body(body).unwrap_or_else(|e| {
        GatewayError(BridgeError::Other(format!("invalid device response: {e}"))).into_response()
    })
}
