//! Handling of relay → agent messages.
//!
//! `discover` is answered from the Device Registry; `api-request` is
//! executed against the target device on its own task so slow devices never
//! hold up the uplink, and responses go back in completion order.

use crate::auto_request::{self, AutoKey, AutoRequestManager};
use crate::config::Timings;
use crate::device_client::{DeviceClient, DeviceRequest};
use crate::devices::{Device, DeviceRegistry};
use onsong_core::messages::{ApiRequest, ApiResponse, DiscoverRequest, DiscoverResponse};
use onsong_core::{Inbound, Message};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Port used when an `api-request` carries no `targetPort`.
pub const DEFAULT_DEVICE_PORT: u16 = 80;

/// Outcome of handling one relay frame.
#[derive(Debug, Default, PartialEq)]
pub struct Handled {
    /// The frame was a relay heartbeat.
    pub heartbeat: bool,
    /// Answer to write back on the uplink.
    pub reply: Option<Message>,
}

pub struct Dispatcher {
    devices: Arc<DeviceRegistry>,
    auto: Arc<AutoRequestManager>,
    client: Arc<dyn DeviceClient>,
    timings: Timings,
}

impl Dispatcher {
    pub fn new(
        devices: Arc<DeviceRegistry>,
        auto: Arc<AutoRequestManager>,
        client: Arc<dyn DeviceClient>,
        timings: Timings,
    ) -> Arc<Self> {
        Arc::new(Self {
            devices,
            auto,
            client,
            timings,
        })
    }

    /// Handle one inbound frame. Immediate answers come back in the result
    /// for the caller to queue; only `api-request` results go through `out`,
    /// from their own task.
    pub async fn handle(self: &Arc<Self>, inbound: Inbound, out: &mpsc::Sender<Message>) -> Handled {
        let msg = match inbound {
            Inbound::Message(msg) => msg,
            Inbound::Unknown { msg_type } => {
                warn!(msg_type = %msg_type, "ignoring unknown message type");
                return Handled::default();
            }
        };

        match msg {
            Message::Ping => {
                return Handled {
                    heartbeat: true,
                    reply: Some(Message::Pong),
                };
            }
            Message::Pong => debug!("pong from relay"),
            Message::Registered { message } => info!(message = %message, "registered with relay"),
            Message::Error { message } => warn!(message = %message, "relay reported an error"),
            Message::Discover(req) => {
                let resp = self.discover(req).await;
                return Handled {
                    heartbeat: false,
                    reply: Some(Message::DiscoverResponse(resp)),
                };
            }
            Message::ApiRequest(req) => {
                let this = self.clone();
                let out = out.clone();
                tokio::spawn(async move {
                    let resp = this.api_call(req).await;
                    if out.send(Message::ApiResponse(resp)).await.is_err() {
                        debug!("uplink gone before api-response could be sent");
                    }
                });
            }
            other @ (Message::Register(_) | Message::DiscoverResponse(_) | Message::ApiResponse(_)) => {
                warn!(kind = other.kind(), "unexpected message from relay");
            }
        }
        Handled::default()
    }

    pub async fn discover(&self, req: DiscoverRequest) -> DiscoverResponse {
        let devices = self.devices.snapshot().await;
        debug!(count = devices.len(), "answering discover");
        DiscoverResponse {
            request_id: req.request_id,
            success: true,
            devices: devices.iter().map(Device::to_info).collect(),
            error: None,
        }
    }

    /// Execute a relayed device call. Failed auth calls start the
    /// auto-request retry for that device and token.
    pub async fn api_call(&self, req: ApiRequest) -> ApiResponse {
        if req.target_ip.trim().is_empty() {
            return ApiResponse::failure(req.request_id, "missing target address");
        }

        let token = auto_request::auth_token(&req.path).map(str::to_string);
        let timeout = if token.is_some() {
            self.timings.auth_timeout
        } else {
            self.timings.api_timeout
        };
        let device_req = DeviceRequest {
            address: req.target_ip.clone(),
            port: req.target_port.unwrap_or(DEFAULT_DEVICE_PORT),
            method: req.method,
            path: req.path,
            headers: req.headers,
            body: req.body,
            timeout,
        };

        let result = self.client.send(&device_req).await;

        let failed = result.as_ref().map_or(true, |r| !r.is_success());
        if let (true, Some(token)) = (failed, token) {
            let device_id = match self.devices.find_by_address(&req.target_ip).await {
                Some(device) => device.id,
                None => req.target_ip.clone(),
            };
            self.auto
                .start_auth_retry(AutoKey::new(device_id, token), device_req)
                .await;
        }

        match result {
            Ok(resp) => {
                let success = resp.is_success();
                ApiResponse {
                    request_id: req.request_id,
                    success,
                    status_code: Some(resp.status),
                    headers: Some(resp.headers),
                    data: Some(resp.data),
                    error: (!success).then(|| format!("device returned status {}", resp.status)),
                }
            }
            Err(e) => {
                debug!(target = %req.target_ip, error = %e, "device call failed");
                ApiResponse::failure(req.request_id, e.to_string())
            }
        }
    }
}
