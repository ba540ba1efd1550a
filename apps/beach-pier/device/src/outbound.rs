//! Managed outbound WebSocket connection.
//!
//! [`OutboundTunnelClient`] owns a supervisor task that dials, runs the
//! session (reader, writer and keepalive in one `select!` loop), and redials
//! with backoff when auto-reconnect is on. Events are delivered through
//! plain closures invoked on the supervisor task; they must return quickly.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use beach_pier_core::{Backoff, BackoffPolicy};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval_at, sleep, timeout, Interval, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async_tls_with_config,
    tungstenite::{
        client::IntoClientRequest,
        handshake::client::Request,
        http::{header::AUTHORIZATION, HeaderValue},
        protocol::WebSocketConfig,
        Message,
    },
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;

const OUTBOUND_QUEUE_DEPTH: usize = 32;
const STOP_WAIT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("invalid websocket uri: {0}")]
    InvalidUri(String),
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error("client has not been configured")]
    NotStarted,
    #[error("not connected")]
    NotConnected,
    #[error("timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("payload of {len} bytes exceeds the {max} byte buffer")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("gave up after {0} reconnect attempts")]
    Exhausted(u32),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub uri: String,
    pub bearer_token: Option<String>,
    /// PEM bundle to pin. When set, the platform trust store is not consulted.
    pub ca_cert_pem: Option<Vec<u8>>,
    /// Largest frame sent or accepted.
    pub buffer_size: usize,
    /// Zero disables keepalive pings.
    pub ping_interval: Duration,
    pub network_timeout: Duration,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: Option<u32>,
}

impl ClientConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            bearer_token: None,
            ca_cert_pem: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            ping_interval: DEFAULT_PING_INTERVAL,
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
            auto_reconnect: true,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: None,
        }
    }
}

type EventCallback = Arc<dyn Fn() + Send + Sync>;
type MessageCallback = Arc<dyn Fn(&[u8], bool) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// Event hooks. Each runs on the client's network task and must not block.
#[derive(Clone, Default)]
pub struct ClientCallbacks {
    pub(crate) on_connect: Option<EventCallback>,
    pub(crate) on_disconnect: Option<EventCallback>,
    pub(crate) on_message: Option<MessageCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
}

impl ClientCallbacks {
    pub fn on_connect(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    pub fn on_disconnect(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(callback));
        self
    }

    /// Receives the payload and whether it arrived as a binary frame.
    pub fn on_message(mut self, callback: impl Fn(&[u8], bool) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&ClientError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

#[derive(Clone)]
pub struct OutboundTunnelClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    callbacks: ClientCallbacks,
    config: Mutex<Option<ClientConfig>>,
    connected: AtomicBool,
    auto_reconnect: AtomicBool,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
}

impl OutboundTunnelClient {
    pub fn new(callbacks: ClientCallbacks) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                callbacks,
                config: Mutex::new(None),
                connected: AtomicBool::new(false),
                auto_reconnect: AtomicBool::new(false),
                outbound: Mutex::new(None),
                supervisor: Mutex::new(None),
                stop,
            }),
        }
    }

    /// Validates and stores `config`, then starts connecting.
    pub fn begin(&self, config: ClientConfig) -> Result<(), ClientError> {
        build_request(&config)?;
        tls_connector(&config)?;
        self.inner
            .auto_reconnect
            .store(config.auto_reconnect, Ordering::SeqCst);
        *self.inner.config.lock() = Some(config);
        self.connect()
    }

    /// Starts the network task unless it is already running. Connection
    /// progress is reported through the callbacks.
    pub fn connect(&self) -> Result<(), ClientError> {
        if self.is_connected() {
            return Ok(());
        }
        let mut supervisor = self.inner.supervisor.lock();
        if supervisor.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }
        if self.inner.config.lock().is_none() {
            return Err(ClientError::NotStarted);
        }
        self.inner.stop.send_replace(false);
        let stop = self.inner.stop.subscribe();
        *supervisor = Some(tokio::spawn(supervise(Arc::clone(&self.inner), stop)));
        Ok(())
    }

    /// Turns off auto-reconnect, closes the session and waits for the network
    /// task to finish. No callback fires after this returns.
    pub async fn disconnect(&self) {
        self.inner.auto_reconnect.store(false, Ordering::SeqCst);
        self.inner.stop.send_replace(true);
        let task = self.inner.supervisor.lock().take();
        if let Some(mut task) = task {
            if timeout(STOP_WAIT, &mut task).await.is_err() {
                warn!("outbound client did not stop in time; aborting");
                task.abort();
                let _ = task.await;
            }
        }
        self.inner.outbound.lock().take();
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn buffer_size(&self) -> usize {
        self.inner
            .config
            .lock()
            .as_ref()
            .map(|config| config.buffer_size)
            .unwrap_or(DEFAULT_BUFFER_SIZE)
    }

    /// Queues a text frame, waiting at most `wait` for room.
    pub async fn send_text(&self, text: &str, wait: Duration) -> Result<(), ClientError> {
        let sender = self.sender(text.len())?;
        queue_with_timeout(&sender, Message::Text(text.to_owned()), wait).await
    }

    /// Queues a binary frame only if there is room right now; a full queue
    /// reports `Timeout` and the frame is dropped.
    pub fn try_send_binary(&self, data: Vec<u8>) -> Result<(), ClientError> {
        let sender = self.sender(data.len())?;
        sender.try_send(Message::Binary(data)).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ClientError::Timeout,
            mpsc::error::TrySendError::Closed(_) => ClientError::Closed,
        })
    }

    /// A client that reports connected and writes into `queue`, with no
    /// network task behind it.
    #[cfg(test)]
    pub(crate) fn with_queue(queue: mpsc::Sender<Message>) -> Self {
        let client = Self::new(ClientCallbacks::default());
        client.inner.connected.store(true, Ordering::SeqCst);
        *client.inner.outbound.lock() = Some(queue);
        client
    }

    fn sender(&self, len: usize) -> Result<mpsc::Sender<Message>, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let max = self.buffer_size();
        if len > max {
            return Err(ClientError::PayloadTooLarge { len, max });
        }
        self.inner
            .outbound
            .lock()
            .clone()
            .ok_or(ClientError::NotConnected)
    }
}

impl ClientInner {
    fn emit_connect(&self) {
        if let Some(callback) = &self.callbacks.on_connect {
            callback();
        }
    }

    fn emit_disconnect(&self) {
        if let Some(callback) = &self.callbacks.on_disconnect {
            callback();
        }
    }

    fn emit_message(&self, payload: &[u8], is_binary: bool) {
        if let Some(callback) = &self.callbacks.on_message {
            callback(payload, is_binary);
        }
    }

    fn emit_error(&self, error: &ClientError) {
        if let Some(callback) = &self.callbacks.on_error {
            callback(error);
        }
    }

    async fn run_session(
        &self,
        stream: WsStream,
        config: &ClientConfig,
        stop: &mut watch::Receiver<bool>,
    ) {
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_DEPTH);
        *self.outbound.lock() = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        self.emit_connect();

        let mut keepalive = keepalive(config.ping_interval);
        loop {
            tokio::select! {
                _ = stop_requested(stop) => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                Some(message) = rx.recv() => {
                    if let Err(err) = sink.send(message).await {
                        self.emit_error(&ClientError::Transport(err.to_string()));
                        break;
                    }
                }
                _ = next_tick(&mut keepalive) => {
                    if let Err(err) = sink.send(Message::Ping(Vec::new())).await {
                        self.emit_error(&ClientError::Transport(err.to_string()));
                        break;
                    }
                }
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.emit_message(text.as_bytes(), false),
                    Some(Ok(Message::Binary(bytes))) => self.emit_message(&bytes, true),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "peer closed outbound websocket");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        self.emit_error(&ClientError::Transport(err.to_string()));
                        break;
                    }
                    None => break,
                }
            }
        }

        self.outbound.lock().take();
        self.connected.store(false, Ordering::SeqCst);
        self.emit_disconnect();
    }
}

async fn supervise(inner: Arc<ClientInner>, mut stop: watch::Receiver<bool>) {
    let Some(config) = inner.config.lock().clone() else {
        return;
    };
    let mut backoff = Backoff::new(BackoffPolicy::outbound(
        config.reconnect_delay,
        config.max_reconnect_attempts,
    ));

    loop {
        let dialed = tokio::select! {
            _ = stop_requested(&mut stop) => break,
            result = dial(&config) => result,
        };
        let held = match dialed {
            Ok(stream) => {
                info!(uri = %redact(&config.uri), "outbound websocket connected");
                let started = Instant::now();
                inner.run_session(stream, &config, &mut stop).await;
                started.elapsed()
            }
            Err(err) => {
                debug!(uri = %redact(&config.uri), error = %err, "outbound dial failed");
                inner.emit_error(&err);
                Duration::ZERO
            }
        };

        if *stop.borrow() || !inner.auto_reconnect.load(Ordering::SeqCst) {
            break;
        }
        match backoff.on_session_end(held) {
            Some(delay) => {
                info!(
                    attempt = backoff.failures(),
                    delay_ms = delay.as_millis() as u64,
                    "outbound websocket reconnect scheduled"
                );
                tokio::select! {
                    _ = stop_requested(&mut stop) => break,
                    _ = sleep(delay) => {}
                }
            }
            None => {
                inner.auto_reconnect.store(false, Ordering::SeqCst);
                let err = ClientError::Exhausted(backoff.failures());
                warn!(error = %err, "outbound websocket giving up");
                inner.emit_error(&err);
                break;
            }
        }
    }
}

async fn dial(config: &ClientConfig) -> Result<WsStream, ClientError> {
    let request = build_request(config)?;
    let connector = tls_connector(config)?;
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.buffer_size);
    ws_config.max_frame_size = Some(config.buffer_size);

    let connecting = connect_async_tls_with_config(request, Some(ws_config), true, connector);
    let (stream, _response) = timeout(config.network_timeout, connecting)
        .await
        .map_err(|_| ClientError::Timeout)?
        .map_err(|err| ClientError::Transport(err.to_string()))?;
    Ok(stream)
}

fn build_request(config: &ClientConfig) -> Result<Request, ClientError> {
    let mut request = config
        .uri
        .as_str()
        .into_client_request()
        .map_err(|err| ClientError::InvalidUri(err.to_string()))?;
    if let Some(token) = config.bearer_token.as_deref().filter(|token| !token.is_empty()) {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| ClientError::InvalidUri(err.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

fn tls_connector(config: &ClientConfig) -> Result<Option<Connector>, ClientError> {
    if !config.uri.starts_with("wss://") {
        return Ok(Some(Connector::Plain));
    }
    let mut builder = native_tls::TlsConnector::builder();
    if let Some(pem) = &config.ca_cert_pem {
        let certificate =
            native_tls::Certificate::from_pem(pem).map_err(|err| ClientError::Tls(err.to_string()))?;
        builder.add_root_certificate(certificate);
        builder.disable_built_in_roots(true);
    }
    let connector = builder
        .build()
        .map_err(|err| ClientError::Tls(err.to_string()))?;
    Ok(Some(Connector::NativeTls(connector)))
}

async fn queue_with_timeout(
    sender: &mpsc::Sender<Message>,
    message: Message,
    wait: Duration,
) -> Result<(), ClientError> {
    sender
        .send_timeout(message, wait)
        .await
        .map_err(|err| match err {
            mpsc::error::SendTimeoutError::Timeout(_) => ClientError::Timeout,
            mpsc::error::SendTimeoutError::Closed(_) => ClientError::Closed,
        })
}

fn keepalive(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Resolves once a stop has been requested or the stop sender is gone.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Strips the query string, which may carry credentials, for logging.
pub(crate) fn redact(uri: &str) -> &str {
    uri.split_once('?').map(|(head, _)| head).unwrap_or(uri)
}
