//! JSON command table shared by LAN sockets and cloud tunnels.

pub mod logs;

use std::{sync::Arc, time::Instant};

use beach_pier_core::{ClaimStore, ClientId, ControlResponse};
use metrics::counter;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    device::{redact_secrets, ConfigSink, DeviceState},
    endpoint::{RelayEndpoint, Topic},
    tunnel::CloudTunnel,
};

pub use logs::{FileLog, LogChunk, LogReadError, LogRequest, LogSource, LogStart, MemoryLog};

/// Who receives a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyRoute {
    /// Only the client that sent the command.
    Requester,
    /// Every LAN client on the endpoint.
    Broadcast,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlReply {
    pub response: ControlResponse,
    pub route: ReplyRoute,
}

impl ControlReply {
    fn to_requester(response: ControlResponse) -> Self {
        Self {
            response,
            route: ReplyRoute::Requester,
        }
    }
}

/// Per-client binary media switches, implemented by the endpoint that owns
/// the requesting client.
pub trait MediaControl: Send + Sync {
    fn set_camera(&self, client: ClientId, enabled: bool) -> bool;
    fn request_snapshot(&self, client: ClientId) -> bool;
    fn camera_subscribed(&self, client: ClientId) -> bool;
}

impl MediaControl for RelayEndpoint {
    fn set_camera(&self, client: ClientId, enabled: bool) -> bool {
        self.set_topic(client, Topic::Camera, enabled)
    }

    fn request_snapshot(&self, client: ClientId) -> bool {
        self.set_topic(client, Topic::CameraSnapshot, true)
    }

    fn camera_subscribed(&self, client: ClientId) -> bool {
        self.has_topic(client, Topic::Camera)
    }
}

pub struct ControlProtocol {
    device: Arc<dyn DeviceState>,
    config_sink: Arc<dyn ConfigSink>,
    claims: Arc<ClaimStore>,
    logs: Option<Arc<dyn LogSource>>,
    tunnels: Vec<CloudTunnel>,
}

impl ControlProtocol {
    pub fn new(
        device: Arc<dyn DeviceState>,
        config_sink: Arc<dyn ConfigSink>,
        claims: Arc<ClaimStore>,
    ) -> Self {
        Self {
            device,
            config_sink,
            claims,
            logs: None,
            tunnels: Vec::new(),
        }
    }

    pub fn with_logs(mut self, logs: Arc<dyn LogSource>) -> Self {
        self.logs = Some(logs);
        self
    }

    /// Tunnels reported under `cloudTunnel` in `get_info`.
    pub fn with_tunnels(mut self, tunnels: Vec<CloudTunnel>) -> Self {
        self.tunnels = tunnels;
        self
    }

    /// Greeting sent to a freshly connected control client.
    pub fn hello(&self) -> ControlResponse {
        ControlResponse::ok("hello")
            .with("type", "hello")
            .with("hostname", self.device.hostname())
            .with("ip", self.device.ip_address())
    }

    /// Handles one text command from `client`. Never fails: malformed input
    /// and unknown commands produce an error envelope.
    pub async fn dispatch(
        &self,
        client: ClientId,
        text: &str,
        media: &dyn MediaControl,
    ) -> ControlReply {
        let request: Value = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(err) => {
                counter!("beach_pier_control_errors_total", 1, "error" => "bad_json");
                return ControlReply::to_requester(
                    ControlResponse::error(None, "bad_json").detail(err.to_string()),
                );
            }
        };
        let cmd = request.get("cmd").and_then(Value::as_str).unwrap_or("");
        debug!(client = %client, cmd, "control command");

        let response = match cmd {
            "ping" => ControlResponse::ok(cmd).with("type", "pong"),
            "get_status" => ControlResponse::ok(cmd)
                .with("ip", self.device.ip_address())
                .with("hostname", self.device.hostname())
                .with("wifiMode", self.device.wifi_mode()),
            "get_info" => ControlResponse::ok(cmd).with("info", self.info()),
            "get_config" => ControlResponse::ok(cmd)
                .with("config", redact_secrets(&self.device.config_snapshot())),
            "get_claim" => self.get_claim(&request),
            "get_rssi" => {
                return ControlReply {
                    response: self.get_rssi(),
                    route: ReplyRoute::Broadcast,
                }
            }
            "get_logs" => logs::get_logs(self.logs.as_deref(), &request, client.is_tunnel()).await,
            "camera_subscribe" => {
                let enable = request
                    .get("enable")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                self.camera_command(cmd, |media| media.set_camera(client, enable), media)
                    .with("subscribed", enable)
            }
            "camera_snapshot" => self
                .camera_command(cmd, |media| media.request_snapshot(client), media)
                .with("queued", true),
            "camera_status" => ControlResponse::ok(cmd)
                .with("available", self.device.camera_available())
                .with("subscribed", media.camera_subscribed(client)),
            "set_config" => self.set_config(&request),
            _ => {
                counter!("beach_pier_control_errors_total", 1, "error" => "unknown_cmd");
                ControlResponse::error(Some(cmd), "unknown_cmd")
            }
        };
        ControlReply::to_requester(response)
    }

    /// Device description returned by `get_info`.
    pub fn info(&self) -> Value {
        let mut info = self.device.info();
        info.insert("hostname".into(), json!(self.device.hostname()));
        info.insert("ip".into(), json!(self.device.ip_address()));
        info.insert("camera".into(), json!(self.device.camera_available()));

        let now = Instant::now();
        let claim = self.claims.current_at(false, now);
        info.insert(
            "pairing".into(),
            json!({
                "claim_code": claim.code,
                "claim_expires_in_ms": self.claims.expires_in(now).as_millis() as u64,
            }),
        );

        let endpoints: Vec<_> = self.tunnels.iter().map(CloudTunnel::status).collect();
        info.insert(
            "cloudTunnel".into(),
            json!({
                "enabled": endpoints.iter().any(|status| status.enabled),
                "connected": endpoints.iter().any(|status| status.connected),
                "endpoints": endpoints,
            }),
        );
        Value::Object(info)
    }

    fn get_claim(&self, request: &Value) -> ControlResponse {
        let rotate = request
            .get("rotate")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let now = Instant::now();
        let claim = self.claims.current_at(rotate, now);
        ControlResponse::ok("get_claim")
            .with("code", claim.code)
            .with("expires_in_ms", self.claims.expires_in(now).as_millis() as u64)
    }

    fn get_rssi(&self) -> ControlResponse {
        match self.device.link() {
            Some(link) => ControlResponse::ok("get_rssi")
                .with("connected", true)
                .with("ssid", link.ssid)
                .with("rssi", link.rssi),
            None => ControlResponse::ok("get_rssi")
                .with("connected", false)
                .with("rssi", 0),
        }
    }

    fn camera_command(
        &self,
        cmd: &str,
        apply: impl FnOnce(&dyn MediaControl) -> bool,
        media: &dyn MediaControl,
    ) -> ControlResponse {
        if !self.device.camera_available() {
            return ControlResponse::error(Some(cmd), "camera_unavailable");
        }
        if !apply(media) {
            return ControlResponse::error(Some(cmd), "unknown_client");
        }
        ControlResponse::ok(cmd)
    }

    fn set_config(&self, request: &Value) -> ControlResponse {
        const CMD: &str = "set_config";
        let payload = match request.get("config") {
            Some(payload @ (Value::Object(_) | Value::Array(_))) => payload.clone(),
            _ => return ControlResponse::error(Some(CMD), "missing_config"),
        };
        if self.config_sink.queue_config_update(payload) {
            ControlResponse::ok(CMD).with("queued", true)
        } else {
            ControlResponse::error(Some(CMD), "queue_failed").with("queued", false)
        }
    }
}
