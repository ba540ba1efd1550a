//! Cloud tunnel: a device-initiated connection to the broker that stands in
//! for a LAN socket.
//!
//! Locking discipline:
//! - `transport` (tokio mutex) guards the live [`OutboundTunnelClient`]. Every
//!   holder is time-bounded: senders wait tens of milliseconds at most and
//!   teardown stops the client before releasing, so a sender sees either a
//!   live handle or none.
//! - `control` serialises `configure` and `set_enabled` against each other.
//! - Everything touched from transport callbacks is atomic, a watch channel,
//!   or a short parking_lot critical section.

mod gate;
mod worker;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use beach_pier_core::{
    classify_text, BrokerControl, ConnectionState, Frame, Inbound, Registration, TunnelConfig,
};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{watch, Mutex as AsyncMutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::outbound::{ClientCallbacks, ClientError, OutboundTunnelClient};

pub use gate::{DialGate, DEFAULT_GATE_WAIT};

/// Largest frame carried through the tunnel in either direction.
pub const TUNNEL_BUFFER_SIZE: usize = 160 * 1024;

const SEND_TEXT_LOCK_WAIT: Duration = Duration::from_millis(25);
const SEND_TEXT_WAIT: Duration = Duration::from_millis(200);
const SEND_BINARY_LOCK_WAIT: Duration = Duration::from_millis(5);
const TEARDOWN_LOCK_WAIT: Duration = Duration::from_millis(200);
const WORKER_STOP_WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TunnelError {
    #[error("tunnel is not connected")]
    InvalidState,
    #[error("tunnel send timed out")]
    Timeout,
    #[error("tunnel connection closed")]
    Closed,
    #[error("payload of {len} bytes exceeds the {max} byte tunnel buffer")]
    PayloadTooLarge { len: usize, max: usize },
}

impl From<ClientError> for TunnelError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::NotConnected | ClientError::NotStarted => TunnelError::InvalidState,
            ClientError::Timeout => TunnelError::Timeout,
            ClientError::PayloadTooLarge { len, max } => TunnelError::PayloadTooLarge { len, max },
            ClientError::Closed
            | ClientError::Transport(_)
            | ClientError::Exhausted(_)
            | ClientError::InvalidUri(_)
            | ClientError::Tls(_) => TunnelError::Closed,
        }
    }
}

/// Transport tuning shared by every dial of one tunnel.
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub ca_cert_pem: Option<Vec<u8>>,
    pub buffer_size: usize,
    pub network_timeout: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            ca_cert_pem: None,
            buffer_size: TUNNEL_BUFFER_SIZE,
            network_timeout: crate::outbound::DEFAULT_NETWORK_TIMEOUT,
        }
    }
}

/// Receives application frames relayed by the broker.
pub type MessageSink = Arc<dyn Fn(Frame) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RegistrationRecord {
    ui_ws_url: Option<String>,
    device_ws_url: Option<String>,
    registered_at_ms: Option<u64>,
}

/// Snapshot reported under `cloudTunnel.endpoints` in device info.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TunnelStatus {
    pub uri: String,
    pub started: bool,
    #[serde(rename = "cloudEnabled")]
    pub enabled: bool,
    #[serde(rename = "cloudConnected")]
    pub connected: bool,
    #[serde(rename = "cloudUIConnected")]
    pub ui_connected: bool,
    pub state: ConnectionState,
    pub ui_ws_url: Option<String>,
    pub device_ws_url: Option<String>,
    pub registered_at_ms: Option<u64>,
}

#[derive(Clone)]
pub struct CloudTunnel {
    inner: Arc<TunnelInner>,
}

struct WorkerHandle {
    task: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

pub(crate) struct TunnelInner {
    label: String,
    gate: Arc<DialGate>,
    options: TunnelOptions,
    config: Mutex<TunnelConfig>,
    enabled: AtomicBool,
    state: watch::Sender<ConnectionState>,
    ui_connected: AtomicBool,
    registration: Mutex<RegistrationRecord>,
    transport: AsyncMutex<Option<OutboundTunnelClient>>,
    generation: AtomicU64,
    sink: RwLock<Option<MessageSink>>,
    worker: Mutex<Option<WorkerHandle>>,
    control: AsyncMutex<()>,
}

impl CloudTunnel {
    /// `label` names the local endpoint this tunnel serves, e.g. `/ws/control`.
    pub fn new(label: impl Into<String>, gate: Arc<DialGate>, options: TunnelOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(TunnelInner {
                label: label.into(),
                gate,
                options,
                config: Mutex::new(TunnelConfig::default()),
                enabled: AtomicBool::new(false),
                state,
                ui_connected: AtomicBool::new(false),
                registration: Mutex::new(RegistrationRecord::default()),
                transport: AsyncMutex::new(None),
                generation: AtomicU64::new(0),
                sink: RwLock::new(None),
                worker: Mutex::new(None),
                control: AsyncMutex::new(()),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Stores a new dial snapshot. If anything changed while enabled, the
    /// live connection is torn down and the worker restarted so the next
    /// dial uses the new values. Returns whether the snapshot changed.
    pub async fn configure(
        &self,
        base_url: &str,
        device_id: &str,
        auth_token: &str,
        tunnel_key: &str,
    ) -> bool {
        let _control = self.inner.control.lock().await;
        let changed = {
            let mut current = self.inner.config.lock();
            let next = TunnelConfig {
                base_url: base_url.to_string(),
                device_id: device_id.to_string(),
                auth_token: auth_token.to_string(),
                tunnel_key: tunnel_key.to_string(),
                ..current.clone()
            };
            let changed = current.dial_differs(&next);
            if changed {
                *current = next;
            }
            changed
        };

        if !changed {
            debug!(tunnel = %self.inner.label, "tunnel config unchanged");
            return false;
        }
        info!(
            tunnel = %self.inner.label,
            base_url,
            device_id,
            tunnel_key,
            "tunnel configured"
        );
        if self.is_enabled() {
            self.stop_worker().await;
            self.inner.teardown().await;
            self.spawn_worker();
        }
        true
    }

    /// Replaces the reconnect and keepalive settings used from the next dial.
    pub fn set_timing(&self, auto_reconnect: bool, reconnect_delay: Duration, ping_interval: Duration) {
        let mut config = self.inner.config.lock();
        config.auto_reconnect = auto_reconnect;
        config.reconnect_delay = reconnect_delay;
        config.ping_interval = ping_interval;
    }

    /// `false` stops the worker and the live connection before returning;
    /// `true` starts the worker if it is not already running.
    pub async fn set_enabled(&self, enabled: bool) {
        let _control = self.inner.control.lock().await;
        let was = self.inner.enabled.swap(enabled, Ordering::SeqCst);
        if enabled {
            self.spawn_worker();
            if !was {
                info!(tunnel = %self.inner.label, "tunnel enabled");
            }
        } else {
            self.stop_worker().await;
            self.inner.teardown().await;
            if was {
                info!(tunnel = %self.inner.label, "tunnel disabled");
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn ui_connected(&self) -> bool {
        self.inner.ui_connected.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> TunnelConfig {
        self.inner.config.lock().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Waits up to `within` for the state to reach at least `target`.
    pub async fn wait_for_state(&self, target: ConnectionState, within: Duration) -> bool {
        let mut state = self.subscribe_state();
        timeout(within, state.wait_for(|current| *current >= target))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }

    pub fn set_message_sink(&self, sink: MessageSink) {
        *self.inner.sink.write() = Some(sink);
    }

    pub fn status(&self) -> TunnelStatus {
        let registration = self.inner.registration.lock().clone();
        let started = self
            .inner
            .worker
            .lock()
            .as_ref()
            .is_some_and(|worker| !worker.task.is_finished());
        let state = self.state();
        TunnelStatus {
            uri: self.inner.label.clone(),
            started,
            enabled: self.is_enabled(),
            connected: state.is_connected(),
            ui_connected: self.ui_connected(),
            state,
            ui_ws_url: registration.ui_ws_url,
            device_ws_url: registration.device_ws_url,
            registered_at_ms: registration.registered_at_ms,
        }
    }

    /// Sends a text frame to the broker. Fails fast with `InvalidState` when
    /// not connected and with `Timeout` when the transport is busy.
    pub async fn send_text(&self, text: &str) -> Result<(), TunnelError> {
        self.inner.check_sendable(text.len())?;
        let guard = timeout(SEND_TEXT_LOCK_WAIT, self.inner.transport.lock())
            .await
            .map_err(|_| TunnelError::Timeout)?;
        let client = guard.as_ref().ok_or(TunnelError::InvalidState)?;
        client
            .send_text(text, SEND_TEXT_WAIT)
            .await
            .map_err(TunnelError::from)
    }

    /// Sends a binary frame, dropping it if the transport lock or its queue
    /// is contended. Meant for media where only the newest frame matters.
    pub async fn send_binary(&self, data: Vec<u8>) -> Result<(), TunnelError> {
        self.inner.check_sendable(data.len())?;
        let result = match timeout(SEND_BINARY_LOCK_WAIT, self.inner.transport.lock()).await {
            Ok(guard) => match guard.as_ref() {
                Some(client) => client.try_send_binary(data).map_err(TunnelError::from),
                None => Err(TunnelError::InvalidState),
            },
            Err(_) => Err(TunnelError::Timeout),
        };
        if matches!(result, Err(TunnelError::Timeout)) {
            counter!("beach_pier_tunnel_binary_dropped_total", 1, "tunnel" => self.inner.label.clone());
        }
        result
    }

    fn spawn_worker(&self) {
        let mut slot = self.inner.worker.lock();
        if slot.as_ref().is_some_and(|worker| !worker.task.is_finished()) {
            return;
        }
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(worker::run(Arc::clone(&self.inner), stop_rx));
        *slot = Some(WorkerHandle { task, stop });
    }

    async fn stop_worker(&self) {
        let handle = self.inner.worker.lock().take();
        let Some(WorkerHandle { mut task, stop }) = handle else {
            return;
        };
        stop.send_replace(true);
        if timeout(WORKER_STOP_WAIT, &mut task).await.is_err() {
            warn!(tunnel = %self.inner.label, "tunnel worker did not stop in time; aborting");
            task.abort();
            let _ = task.await;
        }
    }
}

impl TunnelInner {
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        if next == ConnectionState::Disconnected {
            self.ui_connected.store(false, Ordering::SeqCst);
        }
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!(tunnel = %self.label, state = ?next, "tunnel state changed");
        }
    }

    fn check_sendable(&self, len: usize) -> Result<(), TunnelError> {
        if !self.enabled() || !self.state().is_connected() {
            return Err(TunnelError::InvalidState);
        }
        let max = self.options.buffer_size;
        if len > max {
            return Err(TunnelError::PayloadTooLarge { len, max });
        }
        Ok(())
    }

    /// Stops and drops the live transport while holding the transport lock,
    /// then marks the tunnel disconnected.
    async fn teardown(&self) {
        let mut guard = match timeout(TEARDOWN_LOCK_WAIT, self.transport.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                warn!(tunnel = %self.label, "tunnel transport busy; waiting to tear down");
                self.transport.lock().await
            }
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(client) = guard.take() {
            client.disconnect().await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn handle_inbound(&self, payload: &[u8], is_binary: bool) {
        let frame = if is_binary {
            Frame::Binary(payload.to_vec())
        } else {
            let Ok(text) = std::str::from_utf8(payload) else {
                debug!(tunnel = %self.label, "dropping non-utf8 text frame");
                return;
            };
            match classify_text(text) {
                Inbound::Control(control) => {
                    self.apply_control(control);
                    return;
                }
                Inbound::Payload => Frame::Text(text.to_owned()),
            }
        };

        if self.state() != ConnectionState::Registered {
            counter!("beach_pier_tunnel_unregistered_frames_total", 1, "tunnel" => self.label.clone());
            debug!(tunnel = %self.label, "payload before registration dropped");
            return;
        }
        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink(frame);
        }
    }

    fn apply_control(&self, control: BrokerControl) {
        match control {
            BrokerControl::Registered(Registration {
                ui_ws_url,
                device_ws_url,
            }) => {
                *self.registration.lock() = RegistrationRecord {
                    ui_ws_url: ui_ws_url.clone(),
                    device_ws_url,
                    registered_at_ms: Some(now_millis()),
                };
                self.set_state(ConnectionState::Registered);
                counter!("beach_pier_tunnel_registrations_total", 1, "tunnel" => self.label.clone());
                info!(tunnel = %self.label, ui_ws_url = ?ui_ws_url, "tunnel registered with broker");
            }
            BrokerControl::UiConnected => {
                self.ui_connected.store(true, Ordering::SeqCst);
                info!(tunnel = %self.label, "remote ui connected");
            }
            BrokerControl::UiDisconnected => {
                self.ui_connected.store(false, Ordering::SeqCst);
                info!(tunnel = %self.label, "remote ui disconnected");
            }
        }
    }
}

/// Callbacks for one transport generation. Events from a transport that has
/// since been replaced are ignored.
fn transport_callbacks(inner: &Arc<TunnelInner>, generation: u64) -> ClientCallbacks {
    let weak = Arc::downgrade(inner);
    let on_connect = weak.clone();
    let on_disconnect = weak.clone();
    let on_message = weak.clone();
    let on_error = weak;
    ClientCallbacks::default()
        .on_connect(move || {
            if let Some(inner) = current(&on_connect, generation) {
                inner.set_state(ConnectionState::Connected);
            }
        })
        .on_disconnect(move || {
            if let Some(inner) = current(&on_disconnect, generation) {
                inner.set_state(ConnectionState::Disconnected);
            }
        })
        .on_message(move |payload, is_binary| {
            if let Some(inner) = current(&on_message, generation) {
                inner.handle_inbound(payload, is_binary);
            }
        })
        .on_error(move |err| {
            if let Some(inner) = current(&on_error, generation) {
                debug!(tunnel = %inner.label, error = %err, "tunnel transport error");
            }
        })
}

fn current(weak: &Weak<TunnelInner>, generation: u64) -> Option<Arc<TunnelInner>> {
    weak.upgrade()
        .filter(|inner| inner.generation.load(Ordering::SeqCst) == generation)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
