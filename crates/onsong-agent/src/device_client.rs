//! Outbound HTTP calls to devices on the local network.

use onsong_core::{BridgeError, BridgeResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRequest {
    pub address: String,
    pub port: u16,
    pub method: String,
    /// Path plus query, starting with `/`.
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl DeviceRequest {
    pub fn url(&self) -> String {
        let host = match self.address.parse::<std::net::IpAddr>() {
            Ok(std::net::IpAddr::V6(v6)) => format!("[{v6}]"),
            _ => self.address.clone(),
        };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("http://{host}:{}{path}", self.port)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON body, or the raw text when it is not JSON.
    pub data: Value,
}

impl DeviceResponse {
    pub fn is_success(&self) -> bool {
        self.status < 400
    }
}

/// Something that can perform a device call.
///
/// Transport failures (refused, timed out) are errors; any HTTP status is a
/// response.
pub trait DeviceClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: &'a DeviceRequest,
    ) -> Pin<Box<dyn Future<Output = BridgeResult<DeviceResponse>> + Send + 'a>>;
}

/// reqwest-backed client.
pub struct HttpDeviceClient {
    http: reqwest::Client,
}

impl HttpDeviceClient {
    pub fn new() -> BridgeResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("onsong-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BridgeError::Transport(format!("http client build failed: {e}")))?;
        Ok(Self { http })
    }
}

impl DeviceClient for HttpDeviceClient {
    fn send<'a>(
        &'a self,
        req: &'a DeviceRequest,
    ) -> Pin<Box<dyn Future<Output = BridgeResult<DeviceResponse>> + Send + 'a>> {
        Box::pin(async move {
            let method = reqwest::Method::from_bytes(req.method.to_ascii_uppercase().as_bytes())
                .map_err(|_| BridgeError::Validation(format!("invalid method: {}", req.method)))?;

            let mut builder = self
                .http
                .request(method, req.url())
                .timeout(req.timeout);
            for (name, value) in &req.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &req.body {
                builder = match body {
                    Value::String(text) => builder.body(text.clone()),
                    other => builder.json(other),
                };
            }

            let resp = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    BridgeError::Timeout
                } else {
                    BridgeError::Transport(format!("device call failed: {e}"))
                }
            })?;

            let status = resp.status().as_u16();
            let headers = resp
                .headers()
                .iter()
                .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
                .collect();
            let text = resp
                .text()
                .await
                .map_err(|e| BridgeError::Transport(format!("device body read failed: {e}")))?;

            Ok(DeviceResponse {
                status,
                headers,
                data: parse_body(&text),
            })
        })
    }
}

/// JSON when it parses, otherwise the text itself.
pub fn parse_body(text: &str) -> Value {
    if text.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
