//! Host-facing device facts and the configuration hand-off.
//!
//! The control protocol reads through [`DeviceState`] and writes through
//! [`ConfigSink`]; [`HostDevice`] and [`ConfigQueue`] are the implementations
//! used by the binary.

use std::{
    net::{IpAddr, Ipv4Addr, UdpSocket},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::debug;

const REDACTED: &str = "********";
const SECRET_KEYS: &[&str] = &["token", "authToken", "password", "psk"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub ssid: String,
    pub rssi: i32,
}

pub trait DeviceState: Send + Sync {
    fn hostname(&self) -> String;
    fn ip_address(&self) -> String;
    fn wifi_mode(&self) -> String;
    /// Full configuration document, secrets included.
    fn config_snapshot(&self) -> Value;
    /// Static identity fields merged into `get_info`.
    fn info(&self) -> Map<String, Value>;
    /// Current station link, `None` when not associated.
    fn link(&self) -> Option<LinkStatus>;
    fn camera_available(&self) -> bool;
}

/// Accepts configuration updates for asynchronous application.
pub trait ConfigSink: Send + Sync {
    /// Returns false when the update could not be queued.
    fn queue_config_update(&self, update: Value) -> bool;
}

/// Bounded queue drained by the config-apply loop.
#[derive(Clone)]
pub struct ConfigQueue {
    updates: mpsc::Sender<Value>,
}

impl ConfigQueue {
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<Value>) {
        let (updates, receiver) = mpsc::channel(depth.max(1));
        (Self { updates }, receiver)
    }
}

impl ConfigSink for ConfigQueue {
    fn queue_config_update(&self, update: Value) -> bool {
        match self.updates.try_send(update) {
            Ok(()) => true,
            Err(err) => {
                debug!(error = %err, "config update not queued");
                false
            }
        }
    }
}

pub struct HostDevice {
    hostname: String,
    ip_address: String,
    config: RwLock<Value>,
    wireless_stats: Option<PathBuf>,
    /// Interface and signal level from the last stats read.
    link: RwLock<Option<(String, i32)>>,
    camera: AtomicBool,
    started: Instant,
}

impl HostDevice {
    pub fn new(hostname: impl Into<String>, ip_address: impl Into<String>, config: Value) -> Self {
        let config = if config.is_object() {
            config
        } else {
            Value::Object(Map::new())
        };
        Self {
            hostname: hostname.into(),
            ip_address: ip_address.into(),
            config: RwLock::new(config),
            wireless_stats: None,
            link: RwLock::new(None),
            camera: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    /// Reads link quality from a `/proc/net/wireless`-format file. The file
    /// is only read by [`refresh_link`](Self::refresh_link).
    pub fn with_wireless_stats(mut self, path: impl Into<PathBuf>) -> Self {
        self.wireless_stats = Some(path.into());
        self
    }

    /// Re-reads the wireless stats file into the cached link status.
    pub async fn refresh_link(&self) {
        let Some(path) = &self.wireless_stats else {
            return;
        };
        let link = match tokio::fs::read_to_string(path).await {
            Ok(text) => parse_wireless(&text),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "wireless stats unreadable");
                None
            }
        };
        *self.link.write() = link;
    }

    /// Refreshes the cached link status every `period` until aborted.
    pub fn spawn_link_monitor(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let device = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                device.refresh_link().await;
            }
        })
    }

    pub fn set_camera_available(&self, available: bool) {
        self.camera.store(available, Ordering::SeqCst);
    }

    /// Merges an update into the stored document and returns the result.
    /// An array is applied as a sequence of partial documents.
    pub fn apply_update(&self, update: &Value) -> Value {
        let mut config = self.config.write();
        match update {
            Value::Array(patches) => {
                for patch in patches {
                    merge_json(&mut config, patch);
                }
            }
            patch => merge_json(&mut config, patch),
        }
        config.clone()
    }
}

impl DeviceState for HostDevice {
    fn hostname(&self) -> String {
        self.hostname.clone()
    }

    fn ip_address(&self) -> String {
        self.ip_address.clone()
    }

    fn wifi_mode(&self) -> String {
        self.config
            .read()
            .pointer("/wifi/mode")
            .and_then(Value::as_str)
            .unwrap_or("sta")
            .to_string()
    }

    fn config_snapshot(&self) -> Value {
        self.config.read().clone()
    }

    fn info(&self) -> Map<String, Value> {
        let mut info = Map::new();
        info.insert("version".into(), json!(env!("CARGO_PKG_VERSION")));
        info.insert("platform".into(), json!(std::env::consts::OS));
        info.insert(
            "uptime_ms".into(),
            json!(self.started.elapsed().as_millis() as u64),
        );
        info
    }

    fn link(&self) -> Option<LinkStatus> {
        let (interface, rssi) = self.link.read().clone()?;
        let ssid = self
            .config
            .read()
            .pointer("/wifi/ssid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(interface);
        Some(LinkStatus { ssid, rssi })
    }

    fn camera_available(&self) -> bool {
        self.camera.load(Ordering::SeqCst)
    }
}

/// First interface and its signal level (dBm) from `/proc/net/wireless`.
pub fn parse_wireless(text: &str) -> Option<(String, i32)> {
    text.lines().skip(2).find_map(|line| {
        let (interface, rest) = line.split_once(':')?;
        let level = rest.split_whitespace().nth(2)?;
        let rssi = level.trim_end_matches('.').parse::<f32>().ok()?;
        Some((interface.trim().to_string(), rssi as i32))
    })
}

/// Recursive object merge; non-object values replace the target.
pub fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                merge_json(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Copy of `config` with credential fields masked.
pub fn redact_secrets(config: &Value) -> Value {
    match config {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let masked = SECRET_KEYS.contains(&key.as_str())
                        && value.as_str().is_some_and(|secret| !secret.is_empty());
                    let value = if masked {
                        Value::String(REDACTED.into())
                    } else {
                        redact_secrets(value)
                    };
                    (key.clone(), value)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_secrets).collect()),
        other => other.clone(),
    }
}

/// Address of the interface holding the default route. No packets are sent.
pub fn local_ip() -> IpAddr {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const WIRELESS: &str = "\
Inter-| sta-|   Quality        |   Discarded packets               | Missed | WE
 face | tus | link level noise |  nwid  crypt   frag  retry   misc | beacon | 22
 wlan0: 0000   54.  -56.  -256        0      0      0      0      0        0
";

    #[test]
    fn parses_signal_level_from_proc_wireless() {
        assert_eq!(parse_wireless(WIRELESS), Some(("wlan0".to_string(), -56)));
        assert_eq!(parse_wireless("header\nheader\n"), None);
    }

    #[tokio::test]
    async fn link_prefers_configured_ssid() {
        let mut stats = tempfile::NamedTempFile::new().unwrap();
        stats.write_all(WIRELESS.as_bytes()).unwrap();
        let device = HostDevice::new("pier", "10.0.0.2", json!({"wifi": {"ssid": "harbor"}}))
            .with_wireless_stats(stats.path());
        assert_eq!(device.link(), None);
        device.refresh_link().await;
        assert_eq!(
            device.link(),
            Some(LinkStatus {
                ssid: "harbor".into(),
                rssi: -56
            })
        );

        let unlinked = HostDevice::new("pier", "10.0.0.2", json!({}));
        unlinked.refresh_link().await;
        assert_eq!(unlinked.link(), None);
    }

    #[tokio::test]
    async fn link_monitor_tracks_stats_file_changes() {
        let stats = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(stats.path(), WIRELESS).unwrap();
        let device = Arc::new(
            HostDevice::new("pier", "10.0.0.2", json!({})).with_wireless_stats(stats.path()),
        );
        let monitor = device.spawn_link_monitor(Duration::from_millis(20));

        let linked = tokio::time::timeout(Duration::from_secs(2), async {
            while device.link().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(linked.is_ok());
        assert_eq!(device.link().map(|link| link.ssid), Some("wlan0".to_string()));

        std::fs::write(stats.path(), "header\nheader\n").unwrap();
        let dropped = tokio::time::timeout(Duration::from_secs(2), async {
            while device.link().is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(dropped.is_ok());
        monitor.abort();
    }

    #[test]
    fn merge_is_recursive_for_objects_only() {
        let mut config = json!({"wifi": {"ssid": "a", "mode": "sta"}, "tags": [1, 2]});
        merge_json(&mut config, &json!({"wifi": {"ssid": "b"}, "tags": [3]}));
        assert_eq!(config, json!({"wifi": {"ssid": "b", "mode": "sta"}, "tags": [3]}));
    }

    #[test]
    fn array_update_applies_each_patch_in_order() {
        let device = HostDevice::new("pier", "10.0.0.2", json!({"a": 1}));
        let merged = device.apply_update(&json!([{"a": 2}, {"b": true}, {"a": 3}]));
        assert_eq!(merged, json!({"a": 3, "b": true}));
    }

    #[test]
    fn secrets_are_masked_at_any_depth() {
        let config = json!({
            "auth": {"token": "abc"},
            "cloudTunnel": {"authToken": "xyz", "baseUrl": "wss://cloud"},
            "wifi": {"password": ""}
        });
        let redacted = redact_secrets(&config);
        assert_eq!(redacted["auth"]["token"], REDACTED);
        assert_eq!(redacted["cloudTunnel"]["authToken"], REDACTED);
        assert_eq!(redacted["cloudTunnel"]["baseUrl"], "wss://cloud");
        assert_eq!(redacted["wifi"]["password"], "");
    }

    #[test]
    fn queue_reports_full() {
        let (queue, mut rx) = ConfigQueue::new(1);
        assert!(queue.queue_config_update(json!({"a": 1})));
        assert!(!queue.queue_config_update(json!({"a": 2})));
        assert_eq!(rx.try_recv().unwrap(), json!({"a": 1}));
    }
}
