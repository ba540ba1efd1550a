use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::{json, Map, Value};

#[derive(Debug, Parser)]
#[command(
    name = "beach-pier",
    author,
    version,
    about = "Device relay: local websocket endpoints plus an outbound cloud tunnel"
)]
pub struct Cli {
    /// Address the local HTTP/WebSocket server binds to.
    #[arg(long, env = "BEACH_PIER_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Hostname reported to clients. Defaults to $HOSTNAME.
    #[arg(long, env = "BEACH_PIER_HOSTNAME")]
    pub hostname: Option<String>,

    /// Identifier used when dialing the broker. Defaults to the hostname.
    #[arg(long, env = "BEACH_PIER_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Token required on local WebSocket upgrades (header or ?token=).
    #[arg(long, env = "BEACH_PIER_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Device log file; also served through `get_logs`.
    #[arg(long, env = "BEACH_PIER_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// JSON device configuration document loaded at startup.
    #[arg(long, env = "BEACH_PIER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Broker base URL, e.g. wss://pier.example.com.
    #[arg(long, env = "BEACH_PIER_CLOUD_URL")]
    pub cloud_url: Option<String>,

    /// Token presented to the broker.
    #[arg(long, env = "BEACH_PIER_CLOUD_TOKEN")]
    pub cloud_token: Option<String>,

    /// Start the cloud tunnel at boot.
    #[arg(long, env = "BEACH_PIER_CLOUD_ENABLED", default_value_t = false)]
    pub cloud_enabled: bool,

    /// Tunnel the camera and RSSI endpoints too, not only control.
    #[arg(long, env = "BEACH_PIER_TUNNEL_ALL", default_value_t = false)]
    pub tunnel_all: bool,

    /// PEM bundle trusted for the broker connection instead of system roots.
    #[arg(long, env = "BEACH_PIER_CA_CERT")]
    pub ca_cert: Option<PathBuf>,

    /// Directory of JPEG files replayed as the camera feed.
    #[arg(long, env = "BEACH_PIER_CAMERA_FRAMES")]
    pub camera_frames: Option<PathBuf>,

    #[arg(long, env = "BEACH_PIER_CAMERA_FPS", default_value_t = 5)]
    pub camera_fps: u32,

    /// Source of link statistics for RSSI reporting.
    #[arg(
        long,
        env = "BEACH_PIER_WIRELESS_STATS",
        default_value = "/proc/net/wireless"
    )]
    pub wireless_stats: PathBuf,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_PIER_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub listen_addr: SocketAddr,
    pub hostname: String,
    pub device_id: String,
    pub auth_token: Option<String>,
    pub log_file: Option<PathBuf>,
    /// Startup configuration document with command-line overrides applied.
    pub document: Value,
    pub tunnel_all: bool,
    pub ca_cert_pem: Option<Vec<u8>>,
    pub camera_frames: Option<PathBuf>,
    pub camera_fps: u32,
    pub wireless_stats: PathBuf,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for DeviceConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        let hostname = cli
            .hostname
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "beach-pier".to_string());
        let device_id = cli
            .device_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| hostname.clone());

        let mut document = match &cli.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                serde_json::from_str::<Value>(&raw)
                    .with_context(|| format!("config {} is not valid JSON", path.display()))?
            }
            None => Value::Object(Map::new()),
        };
        if !document.is_object() {
            bail!("device config must be a JSON object");
        }
        apply_cloud_overrides(
            &mut document,
            cli.cloud_enabled,
            cli.cloud_url.as_deref(),
            cli.cloud_token.as_deref(),
        );

        let ca_cert_pem = cli
            .ca_cert
            .as_ref()
            .map(|path| {
                std::fs::read(path)
                    .with_context(|| format!("failed to read CA bundle {}", path.display()))
            })
            .transpose()?;

        Ok(DeviceConfig {
            listen_addr,
            hostname,
            device_id,
            auth_token: cli.auth_token.filter(|token| !token.is_empty()),
            log_file: cli.log_file,
            document,
            tunnel_all: cli.tunnel_all,
            ca_cert_pem,
            camera_frames: cli.camera_frames,
            camera_fps: cli.camera_fps,
            wireless_stats: cli.wireless_stats,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

/// Command-line cloud values win over the loaded document; an absent flag
/// leaves the document's value alone.
fn apply_cloud_overrides(
    document: &mut Value,
    enabled: bool,
    base_url: Option<&str>,
    token: Option<&str>,
) {
    let mut overrides = Map::new();
    if enabled {
        overrides.insert("enabled".into(), json!(true));
    }
    if let Some(url) = base_url {
        overrides.insert("baseUrl".into(), json!(url));
    }
    if let Some(token) = token {
        overrides.insert("authToken".into(), json!(token));
    }
    if !overrides.is_empty() {
        beach_pier_device::device::merge_json(
            document,
            &json!({ "cloudTunnel": Value::Object(overrides) }),
        );
    }
}
