//! The device's three WebSocket relays and their cloud tunnels.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use beach_pier_core::{ClaimStore, ClientId, ControlResponse, Frame, TunnelConfig};
use serde_json::Value;
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    control::{ControlProtocol, LogSource, ReplyRoute},
    device::{ConfigSink, DeviceState},
    endpoint::{
        AuthCheck, EndpointError, EndpointLimits, FrameHandler, LocalServer, RelayEndpoint, Topic,
    },
    media::CameraHub,
    tunnel::{CloudTunnel, DialGate, TunnelOptions},
};

pub const CONTROL_PATH: &str = "/ws/control";
pub const CAMERA_PATH: &str = "/ws/camera";
pub const RSSI_PATH: &str = "/ws/rssi";

pub const CONTROL_LIMITS: EndpointLimits = EndpointLimits {
    max_clients: 8,
    max_message_len: 2 * 1024,
    max_broadcast_len: 160 * 1024,
};
pub const CAMERA_LIMITS: EndpointLimits = EndpointLimits {
    max_clients: 4,
    max_message_len: 0,
    max_broadcast_len: 200 * 1024,
};
pub const RSSI_LIMITS: EndpointLimits = EndpointLimits {
    max_clients: 8,
    max_message_len: 0,
    max_broadcast_len: 64,
};

pub const RSSI_PERIOD: Duration = Duration::from_secs(1);

/// Tunnel key for an endpoint path: `/ws/control` becomes `ws_control`.
pub fn tunnel_key_for(path: &str) -> String {
    path.trim_start_matches('/').replace('/', "_")
}

/// Cloud settings as read from the device configuration document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudSettings {
    pub enabled: bool,
    pub base_url: String,
    pub device_id: String,
    pub auth_token: String,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
}

impl Default for CloudSettings {
    fn default() -> Self {
        let timing = TunnelConfig::default();
        Self {
            enabled: false,
            base_url: String::new(),
            device_id: String::new(),
            auth_token: String::new(),
            auto_reconnect: timing.auto_reconnect,
            reconnect_delay: timing.reconnect_delay,
            ping_interval: timing.ping_interval,
        }
    }
}

impl CloudSettings {
    /// Reads `cloudTunnel.{enabled,baseUrl,deviceId,authToken}` and the
    /// optional `autoReconnect`, `reconnectDelay` and `pingInterval` (both in
    /// milliseconds). A missing device id falls back to `default_device_id`.
    pub fn from_config(config: &Value, default_device_id: &str) -> Self {
        let field = |name: &str| {
            config
                .pointer(&format!("/cloudTunnel/{name}"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string()
        };
        let millis = |name: &str| {
            config
                .pointer(&format!("/cloudTunnel/{name}"))
                .and_then(Value::as_u64)
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
        };
        let defaults = Self::default();
        let device_id = Some(field("deviceId"))
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| default_device_id.to_string());
        Self {
            enabled: config
                .pointer("/cloudTunnel/enabled")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            base_url: field("baseUrl"),
            device_id,
            auth_token: field("authToken"),
            auto_reconnect: config
                .pointer("/cloudTunnel/autoReconnect")
                .and_then(Value::as_bool)
                .unwrap_or(defaults.auto_reconnect),
            reconnect_delay: millis("reconnectDelay").unwrap_or(defaults.reconnect_delay),
            ping_interval: millis("pingInterval").unwrap_or(defaults.ping_interval),
        }
    }
}

/// Collaborators the relays are built from.
pub struct RelayDeps {
    pub device: Arc<dyn DeviceState>,
    pub config_sink: Arc<dyn ConfigSink>,
    pub claims: Arc<ClaimStore>,
    pub logs: Option<Arc<dyn LogSource>>,
}

#[derive(Clone, Default)]
pub struct RelaySettings {
    pub auth: Option<AuthCheck>,
    /// Attach tunnels to the camera and RSSI endpoints as well as control.
    pub tunnel_all: bool,
    pub tunnel_options: TunnelOptions,
    pub rssi_period: Option<Duration>,
}

/// Running relays. Cheap to clone.
#[derive(Clone)]
pub struct DeviceRelays {
    pub control: RelayEndpoint,
    pub camera: RelayEndpoint,
    pub rssi: RelayEndpoint,
    tunnels: Vec<CloudTunnel>,
    ticker: Arc<JoinHandle<()>>,
}

impl DeviceRelays {
    /// Registers `/ws/control`, `/ws/camera` and `/ws/rssi` on `server`,
    /// builds their tunnels on one shared dial gate and starts the RSSI
    /// ticker. Tunnels stay disabled until [`apply_cloud`](Self::apply_cloud).
    pub fn start(
        server: &LocalServer,
        deps: RelayDeps,
        settings: RelaySettings,
    ) -> Result<Self, EndpointError> {
        let gate = DialGate::serial();
        let tunnel_for = |path: &str| CloudTunnel::new(path, Arc::clone(&gate), settings.tunnel_options.clone());

        let control_tunnel = tunnel_for(CONTROL_PATH);
        let media_tunnels = settings
            .tunnel_all
            .then(|| (tunnel_for(CAMERA_PATH), tunnel_for(RSSI_PATH)));
        let mut tunnels = vec![control_tunnel.clone()];
        if let Some((camera, rssi)) = &media_tunnels {
            tunnels.extend([camera.clone(), rssi.clone()]);
        }

        let mut protocol =
            ControlProtocol::new(Arc::clone(&deps.device), deps.config_sink, deps.claims)
                .with_tunnels(tunnels.clone());
        if let Some(logs) = deps.logs {
            protocol = protocol.with_logs(logs);
        }

        let control = server.begin(
            CONTROL_PATH,
            CONTROL_LIMITS,
            settings.auth.clone(),
            Arc::new(ControlRelay {
                protocol: Arc::new(protocol),
            }),
        )?;
        control.attach_tunnel(control_tunnel);

        let camera = server.begin(CAMERA_PATH, CAMERA_LIMITS, settings.auth.clone(), Arc::new(CameraRelay))?;
        let rssi = server.begin(RSSI_PATH, RSSI_LIMITS, settings.auth.clone(), Arc::new(RssiRelay))?;
        if let Some((camera_tunnel, rssi_tunnel)) = media_tunnels {
            camera.attach_tunnel(camera_tunnel);
            camera.set_topic(ClientId::TUNNEL, Topic::Camera, true);
            rssi.attach_tunnel(rssi_tunnel);
        }

        let ticker = spawn_rssi_ticker(
            rssi.clone(),
            deps.device,
            settings.rssi_period.unwrap_or(RSSI_PERIOD),
        );
        Ok(Self {
            control,
            camera,
            rssi,
            tunnels,
            ticker: Arc::new(ticker),
        })
    }

    pub fn tunnels(&self) -> &[CloudTunnel] {
        &self.tunnels
    }

    pub fn camera_hub(&self) -> CameraHub {
        CameraHub::new(vec![self.camera.clone(), self.control.clone()])
    }

    /// Pushes cloud settings into every tunnel. Unchanged tunnels keep their
    /// connection.
    pub async fn apply_cloud(&self, settings: &CloudSettings) {
        for tunnel in &self.tunnels {
            let key = tunnel_key_for(tunnel.label());
            tunnel.set_timing(
                settings.auto_reconnect,
                settings.reconnect_delay,
                settings.ping_interval,
            );
            tunnel
                .configure(
                    &settings.base_url,
                    &settings.device_id,
                    &settings.auth_token,
                    &key,
                )
                .await;
            let ready = !settings.base_url.is_empty() && !settings.device_id.is_empty();
            tunnel.set_enabled(settings.enabled && ready).await;
        }
        info!(
            enabled = settings.enabled,
            base_url = %settings.base_url,
            tunnels = self.tunnels.len(),
            "cloud settings applied"
        );
    }

    /// Disables every tunnel and stops the RSSI ticker.
    pub async fn shutdown(&self) {
        self.ticker.abort();
        for tunnel in &self.tunnels {
            tunnel.set_enabled(false).await;
        }
    }
}

struct ControlRelay {
    protocol: Arc<ControlProtocol>,
}

#[async_trait]
impl FrameHandler for ControlRelay {
    async fn on_connect(&self, endpoint: &RelayEndpoint, client: ClientId) {
        let hello = Frame::Text(self.protocol.hello().to_json());
        if let Err(err) = endpoint.send_to(client, hello).await {
            debug!(client = %client, error = %err, "hello not delivered");
        }
    }

    async fn on_frame(&self, endpoint: &RelayEndpoint, client: ClientId, frame: Frame) {
        let Frame::Text(text) = frame else {
            debug!(client = %client, "binary frame on control socket ignored");
            return;
        };
        let reply = self.protocol.dispatch(client, &text, endpoint).await;
        let body = reply.response.to_json();

        match reply.route {
            ReplyRoute::Requester => reply_to(endpoint, client, &reply.response, body).await,
            ReplyRoute::Broadcast => {
                if let Err(err) = endpoint.broadcast(Frame::Text(body.clone())) {
                    warn!(client = %client, error = %err, "broadcast reply rejected");
                }
                if client.is_tunnel() {
                    reply_to(endpoint, client, &reply.response, body).await;
                }
            }
        }
    }
}

/// Sends a reply to one client. A reply too large for the endpoint is
/// replaced by a small error envelope.
async fn reply_to(endpoint: &RelayEndpoint, client: ClientId, response: &ControlResponse, body: String) {
    match endpoint.send_to(client, Frame::Text(body)).await {
        Ok(()) => {}
        Err(EndpointError::PayloadTooLarge { len, max }) => {
            let cmd = response.get("cmd").and_then(Value::as_str);
            let fallback = ControlResponse::error(cmd, "response_too_large")
                .with("size", len)
                .with("max", max);
            if let Err(err) = endpoint.send_to(client, Frame::Text(fallback.to_json())).await {
                debug!(client = %client, error = %err, "error reply not delivered");
            }
        }
        Err(err) => debug!(client = %client, error = %err, "reply not delivered"),
    }
}

struct CameraRelay;

#[async_trait]
impl FrameHandler for CameraRelay {
    async fn on_connect(&self, endpoint: &RelayEndpoint, client: ClientId) {
        endpoint.set_topic(client, Topic::Camera, true);
    }

    async fn on_frame(&self, _endpoint: &RelayEndpoint, client: ClientId, _frame: Frame) {
        debug!(client = %client, "camera socket is send-only; frame ignored");
    }
}

struct RssiRelay;

#[async_trait]
impl FrameHandler for RssiRelay {
    async fn on_frame(&self, _endpoint: &RelayEndpoint, client: ClientId, _frame: Frame) {
        debug!(client = %client, "rssi socket is send-only; frame ignored");
    }
}

/// Publishes the current dBm as a text integer every `period` while the
/// station link is up and someone is listening.
pub fn spawn_rssi_ticker(
    endpoint: RelayEndpoint,
    device: Arc<dyn DeviceState>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let listening = endpoint.client_count() > 0
                || endpoint.tunnel().is_some_and(|tunnel| tunnel.is_connected());
            if !listening {
                continue;
            }
            let Some(link) = device.link() else {
                continue;
            };
            if let Err(err) = endpoint.publish(Frame::Text(link.rssi.to_string())).await {
                debug!(error = %err, "rssi sample not published");
            }
        }
    })
}
