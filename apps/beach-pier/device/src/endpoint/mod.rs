//! Local WebSocket relay endpoints.
//!
//! A [`RelayEndpoint`] owns one path on the [`LocalServer`]. LAN sockets are
//! tracked in a fixed-capacity table; frames from those sockets, and from an
//! attached [`CloudTunnel`] under [`ClientId::TUNNEL`], are funnelled through a
//! single dispatcher task into the endpoint's [`FrameHandler`].

mod server;
mod table;

use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Weak,
    },
};

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message};
use axum::http::{header, HeaderMap};
use beach_pier_core::{ClientId, Frame};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use percent_encoding::percent_decode_str;
use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch,
};
use tracing::{debug, info, warn};

use crate::tunnel::{CloudTunnel, TunnelError};

pub use server::LocalServer;
pub use table::{Topic, TopicSet};

use table::ClientTable;

const EVENT_QUEUE_DEPTH: usize = 64;
pub(crate) const CLIENT_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("path {0} already has an endpoint")]
    PathInUse(String),
    #[error("local server is not accepting new endpoints")]
    ServerUnavailable,
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("client {0} is not connected")]
    UnknownClient(ClientId),
    #[error("client {0} went away")]
    ClientGone(ClientId),
    #[error("client {0} is not keeping up; frame dropped")]
    Backpressure(ClientId),
    #[error("no cloud tunnel is attached")]
    TunnelNotAttached,
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

/// Size and population limits for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointLimits {
    /// Hard cap on tracked LAN clients. A value of 1 selects single-client
    /// mode, where a new connection replaces the existing one.
    pub max_clients: usize,
    /// Largest inbound data frame accepted; 0 accepts none.
    pub max_message_len: usize,
    /// Largest outbound frame accepted by `send_to`/`broadcast`.
    pub max_broadcast_len: usize,
}

impl EndpointLimits {
    pub fn single_client(&self) -> bool {
        self.max_clients <= 1
    }
}

/// Everything an authorization predicate can see about an upgrade request.
pub struct UpgradeRequest<'a> {
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
}

impl UpgradeRequest<'_> {
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then(|| {
                let value = value.replace('+', " ");
                percent_decode_str(&value).decode_utf8_lossy().into_owned()
            })
        })
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get(header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
            .map(str::trim)
    }
}

pub type AuthCheck = Arc<dyn Fn(&UpgradeRequest<'_>) -> bool + Send + Sync>;

/// Accepts an upgrade carrying `expected` either as `Authorization: Bearer`
/// or as a `?token=` query parameter. Browsers cannot set headers on
/// WebSocket upgrades, hence the query fallback.
pub fn token_auth(expected: impl Into<String>) -> AuthCheck {
    let expected = expected.into();
    Arc::new(move |request: &UpgradeRequest<'_>| {
        if expected.is_empty() {
            return false;
        }
        if request.bearer_token() == Some(expected.as_str()) {
            return true;
        }
        request.query_param("token").as_deref() == Some(expected.as_str())
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    Connected(ClientId),
    Disconnected(ClientId),
    Frame(ClientId, Frame),
}

/// Application side of an endpoint. Calls arrive one at a time from the
/// endpoint's dispatcher task, in the order the events were produced.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn on_connect(&self, _endpoint: &RelayEndpoint, _client: ClientId) {}

    async fn on_disconnect(&self, _endpoint: &RelayEndpoint, _client: ClientId) {}

    async fn on_frame(&self, endpoint: &RelayEndpoint, client: ClientId, frame: Frame);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    pub removed: usize,
}

#[derive(Clone)]
pub struct RelayEndpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    path: String,
    limits: EndpointLimits,
    auth: Option<AuthCheck>,
    clients: Mutex<ClientTable>,
    next_id: AtomicU32,
    events: mpsc::Sender<EndpointEvent>,
    tunnel: RwLock<Option<CloudTunnel>>,
    tunnel_topics: Mutex<TopicSet>,
}

impl RelayEndpoint {
    /// Builds an endpoint and spawns its dispatcher. Must be called from
    /// within a Tokio runtime; use [`LocalServer::begin`] to make it
    /// reachable over HTTP.
    pub(crate) fn new(
        path: String,
        limits: EndpointLimits,
        auth: Option<AuthCheck>,
        handler: Arc<dyn FrameHandler>,
    ) -> Self {
        let (events, receiver) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let inner = Arc::new(EndpointInner {
            clients: Mutex::new(ClientTable::with_capacity(limits.max_clients)),
            path,
            limits,
            auth,
            next_id: AtomicU32::new(1),
            events,
            tunnel: RwLock::new(None),
            tunnel_topics: Mutex::new(TopicSet::default()),
        });
        tokio::spawn(dispatch_events(Arc::downgrade(&inner), receiver, handler));
        Self { inner }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn limits(&self) -> EndpointLimits {
        self.inner.limits
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.inner.clients.lock().iter().map(|slot| slot.id).collect()
    }

    pub(crate) fn authorize(&self, request: &UpgradeRequest<'_>) -> bool {
        match &self.inner.auth {
            Some(check) => check(request),
            None => true,
        }
    }

    /// Tracks a freshly upgraded socket. Over capacity, the oldest client is
    /// dropped from the table immediately, sent a close frame when its queue
    /// has room, and shut out through its eviction signal either way.
    pub(crate) fn accept(&self, sender: mpsc::Sender<Message>) -> ClientId {
        self.admit(sender).0
    }

    /// [`accept`](Self::accept), also returning the signal the connection
    /// task watches to learn it has been evicted or shut down.
    pub(crate) fn admit(&self, sender: mpsc::Sender<Message>) -> (ClientId, watch::Receiver<bool>) {
        let id = self.allocate_id();
        let (evicted, signal) = {
            let mut clients = self.inner.clients.lock();
            let evicted = clients.insert(id, sender);
            let signal = clients
                .get(id)
                .map(|slot| slot.subscribe_eviction())
                .unwrap_or_else(|| watch::channel(true).1);
            (evicted, signal)
        };

        if let Some(evicted) = evicted {
            let reason = if self.inner.limits.single_client() {
                "replaced by a newer client"
            } else {
                "evicted: too many clients"
            };
            let _ = evicted.sender.try_send(close_message(close_code::AWAY, reason));
            evicted.shut_out();
            counter!("beach_pier_clients_evicted_total", 1, "path" => self.inner.path.clone());
            info!(path = %self.inner.path, client = %evicted.id, replacement = %id, "client evicted");
            self.notify(EndpointEvent::Disconnected(evicted.id));
        }

        counter!("beach_pier_clients_connected_total", 1, "path" => self.inner.path.clone());
        self.record_population();
        self.notify(EndpointEvent::Connected(id));
        (id, signal)
    }

    /// Removes a client and emits its disconnect event. Returns false when the
    /// client was already gone, so the event fires at most once per client.
    pub(crate) fn release(&self, client: ClientId) -> bool {
        let removed = self.inner.clients.lock().remove(client).is_some();
        if removed {
            self.record_population();
            self.notify(EndpointEvent::Disconnected(client));
        }
        removed
    }

    /// Queues an inbound frame for the handler. Frames from a LAN client that
    /// is no longer tracked are discarded.
    pub(crate) async fn deliver(&self, client: ClientId, frame: Frame) {
        if !client.is_tunnel() && self.inner.clients.lock().get(client).is_none() {
            debug!(path = %self.inner.path, client = %client, "frame from untracked client discarded");
            return;
        }
        if self
            .inner
            .events
            .send(EndpointEvent::Frame(client, frame))
            .await
            .is_err()
        {
            debug!(path = %self.inner.path, client = %client, "dispatcher gone; frame discarded");
        }
    }

    /// Sends one frame to one client. [`ClientId::TUNNEL`] routes through the
    /// attached cloud tunnel.
    pub async fn send_to(&self, client: ClientId, frame: Frame) -> Result<(), EndpointError> {
        self.check_outbound_len(&frame)?;

        if client.is_tunnel() {
            let tunnel = self.tunnel().ok_or(EndpointError::TunnelNotAttached)?;
            return match frame {
                Frame::Text(text) => tunnel.send_text(&text).await.map_err(Into::into),
                Frame::Binary(bytes) => tunnel.send_binary(bytes).await.map_err(Into::into),
            };
        }

        let sender = self
            .inner
            .clients
            .lock()
            .get(client)
            .map(|slot| slot.sender.clone())
            .ok_or(EndpointError::UnknownClient(client))?;

        match sender.try_send(to_message(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                counter!("beach_pier_send_dropped_total", 1, "path" => self.inner.path.clone());
                Err(EndpointError::Backpressure(client))
            }
            Err(TrySendError::Closed(_)) => {
                counter!("beach_pier_send_failures_total", 1, "path" => self.inner.path.clone());
                self.release(client);
                Err(EndpointError::ClientGone(client))
            }
        }
    }

    /// Sends to every LAN client. Clients whose socket is gone are removed;
    /// a slow client only loses this frame.
    pub fn broadcast(&self, frame: Frame) -> Result<BroadcastReport, EndpointError> {
        self.check_outbound_len(&frame)?;
        let targets: Vec<_> = self
            .inner
            .clients
            .lock()
            .iter()
            .map(|slot| (slot.id, slot.sender.clone()))
            .collect();
        Ok(self.fan_out(targets, &frame))
    }

    /// [`broadcast`](Self::broadcast) plus a copy to the attached tunnel,
    /// if it is connected. Binary copies use the tunnel's drop-on-contention
    /// path.
    pub async fn publish(&self, frame: Frame) -> Result<BroadcastReport, EndpointError> {
        let mut report = self.broadcast(frame.clone())?;
        if let Some(tunnel) = self.tunnel().filter(|tunnel| tunnel.is_connected()) {
            match self.forward_to_tunnel(&tunnel, frame).await {
                true => report.delivered += 1,
                false => report.dropped += 1,
            }
        }
        Ok(report)
    }

    /// Sends a binary frame to every client subscribed to `topic`, including
    /// the tunnel. One-shot snapshot subscriptions are cleared as they are
    /// served.
    pub async fn publish_topic(
        &self,
        topic: Topic,
        bytes: Vec<u8>,
    ) -> Result<BroadcastReport, EndpointError> {
        let frame = Frame::Binary(bytes);
        self.check_outbound_len(&frame)?;

        let targets: Vec<_> = {
            let mut clients = self.inner.clients.lock();
            clients
                .iter_mut()
                .filter_map(|slot| {
                    take_topic(&mut slot.topics, topic).then(|| (slot.id, slot.sender.clone()))
                })
                .collect()
        };
        let mut report = self.fan_out(targets, &frame);

        let tunnel_wants = {
            let mut topics = self.inner.tunnel_topics.lock();
            take_topic(&mut *topics, topic)
        };
        if tunnel_wants {
            if let Some(tunnel) = self.tunnel().filter(|tunnel| tunnel.is_connected()) {
                match self.forward_to_tunnel(&tunnel, frame).await {
                    true => report.delivered += 1,
                    false => report.dropped += 1,
                }
            }
        }
        Ok(report)
    }

    /// Subscribes or unsubscribes a client. Returns false for unknown clients.
    pub fn set_topic(&self, client: ClientId, topic: Topic, enabled: bool) -> bool {
        let apply = |topics: &mut TopicSet| {
            if enabled {
                topics.insert(topic)
            } else {
                topics.remove(topic)
            }
        };
        if client.is_tunnel() {
            if self.tunnel().is_none() {
                return false;
            }
            let mut topics = self.inner.tunnel_topics.lock();
            apply(&mut *topics);
            return true;
        }
        match self.inner.clients.lock().get_mut(client) {
            Some(slot) => {
                apply(&mut slot.topics);
                true
            }
            None => false,
        }
    }

    pub fn has_topic(&self, client: ClientId, topic: Topic) -> bool {
        if client.is_tunnel() {
            return self.inner.tunnel_topics.lock().contains(topic);
        }
        self.inner
            .clients
            .lock()
            .get(client)
            .map(|slot| slot.topics.contains(topic))
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .clients
            .lock()
            .iter()
            .filter(|slot| slot.topics.contains(topic))
            .count()
    }

    /// Routes the tunnel's application frames into this endpoint's handler
    /// as [`ClientId::TUNNEL`].
    pub fn attach_tunnel(&self, tunnel: CloudTunnel) {
        let events = self.inner.events.clone();
        let path = self.inner.path.clone();
        tunnel.set_message_sink(Arc::new(move |frame: Frame| {
            if let Err(err) = events.try_send(EndpointEvent::Frame(ClientId::TUNNEL, frame)) {
                counter!("beach_pier_tunnel_frames_dropped_total", 1, "path" => path.clone());
                debug!(path = %path, error = %err, "tunnel frame dropped; dispatcher busy");
            }
        }));
        *self.inner.tunnel.write() = Some(tunnel);
    }

    pub fn tunnel(&self) -> Option<CloudTunnel> {
        self.inner.tunnel.read().clone()
    }

    /// Closes every tracked client and empties the table. Each connection is
    /// shut out even when its queue is too full to take the close frame.
    pub fn close_all(&self) -> usize {
        let drained = self.inner.clients.lock().drain();
        let count = drained.len();
        for slot in drained {
            let _ = slot
                .sender
                .try_send(close_message(close_code::NORMAL, "endpoint shutting down"));
            slot.shut_out();
            self.notify(EndpointEvent::Disconnected(slot.id));
        }
        *self.inner.tunnel_topics.lock() = TopicSet::default();
        self.record_population();
        if count > 0 {
            info!(path = %self.inner.path, clients = count, "closed all clients");
        }
        count
    }

    fn fan_out(&self, targets: Vec<(ClientId, mpsc::Sender<Message>)>, frame: &Frame) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for (id, sender) in targets {
            match sender.try_send(to_message(frame.clone())) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    counter!("beach_pier_broadcast_dropped_total", 1, "path" => self.inner.path.clone());
                }
                Err(TrySendError::Closed(_)) => {
                    if self.release(id) {
                        report.removed += 1;
                        counter!("beach_pier_send_failures_total", 1, "path" => self.inner.path.clone());
                        warn!(path = %self.inner.path, client = %id, "removed client after failed send");
                    }
                }
            }
        }
        report
    }

    async fn forward_to_tunnel(&self, tunnel: &CloudTunnel, frame: Frame) -> bool {
        let result = match frame {
            Frame::Text(text) => tunnel.send_text(&text).await,
            Frame::Binary(bytes) => tunnel.send_binary(bytes).await,
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                debug!(path = %self.inner.path, error = %err, "tunnel copy not sent");
                false
            }
        }
    }

    fn check_outbound_len(&self, frame: &Frame) -> Result<(), EndpointError> {
        let max = self.inner.limits.max_broadcast_len;
        if frame.len() > max {
            counter!("beach_pier_oversize_outbound_total", 1, "path" => self.inner.path.clone());
            return Err(EndpointError::PayloadTooLarge {
                len: frame.len(),
                max,
            });
        }
        Ok(())
    }

    fn allocate_id(&self) -> ClientId {
        loop {
            let id = ClientId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
            if id.0 != 0 && !id.is_tunnel() {
                return id;
            }
        }
    }

    /// Queues an event without waiting. Handlers may call back into the
    /// endpoint from the dispatcher task, so a full queue hands the event to
    /// a short-lived task instead of blocking.
    fn notify(&self, event: EndpointEvent) {
        if let Err(TrySendError::Full(event)) = self.inner.events.try_send(event) {
            let events = self.inner.events.clone();
            tokio::spawn(async move {
                let _ = events.send(event).await;
            });
        }
    }

    fn record_population(&self) {
        gauge!(
            "beach_pier_clients_active",
            self.client_count() as f64,
            "path" => self.inner.path.clone()
        );
    }
}

fn take_topic(topics: &mut TopicSet, topic: Topic) -> bool {
    match topic {
        Topic::Camera => {
            let wanted =
                topics.contains(Topic::Camera) || topics.contains(Topic::CameraSnapshot);
            topics.remove(Topic::CameraSnapshot);
            wanted
        }
        Topic::CameraSnapshot => {
            let wanted = topics.contains(Topic::CameraSnapshot);
            topics.remove(Topic::CameraSnapshot);
            wanted
        }
    }
}

pub(crate) fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(bytes) => Message::Binary(bytes),
    }
}

pub(crate) fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }))
}

async fn dispatch_events(
    endpoint: Weak<EndpointInner>,
    mut events: mpsc::Receiver<EndpointEvent>,
    handler: Arc<dyn FrameHandler>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = endpoint.upgrade() else {
            break;
        };
        let endpoint = RelayEndpoint { inner };
        match event {
            EndpointEvent::Connected(client) => handler.on_connect(&endpoint, client).await,
            EndpointEvent::Disconnected(client) => handler.on_disconnect(&endpoint, client).await,
            EndpointEvent::Frame(client, frame) => handler.on_frame(&endpoint, client, frame).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Recorder {
        events: mpsc::UnboundedSender<EndpointEvent>,
    }

    #[async_trait]
    impl FrameHandler for Recorder {
        async fn on_connect(&self, _endpoint: &RelayEndpoint, client: ClientId) {
            let _ = self.events.send(EndpointEvent::Connected(client));
        }

        async fn on_disconnect(&self, _endpoint: &RelayEndpoint, client: ClientId) {
            let _ = self.events.send(EndpointEvent::Disconnected(client));
        }

        async fn on_frame(&self, _endpoint: &RelayEndpoint, client: ClientId, frame: Frame) {
            let _ = self.events.send(EndpointEvent::Frame(client, frame));
        }
    }

    fn endpoint(max_clients: usize) -> (RelayEndpoint, mpsc::UnboundedReceiver<EndpointEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let limits = EndpointLimits {
            max_clients,
            max_message_len: 64,
            max_broadcast_len: 32,
        };
        let endpoint = RelayEndpoint::new(
            "/ws/test".into(),
            limits,
            None,
            Arc::new(Recorder { events: tx }),
        );
        (endpoint, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<EndpointEvent>) -> EndpointEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event in time")
            .expect("dispatcher alive")
    }

    #[tokio::test]
    async fn broadcast_skips_dead_client_and_removes_it_once() {
        let (endpoint, mut events) = endpoint(4);
        let mut receivers = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..4 {
            let (tx, rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
            ids.push(endpoint.accept(tx));
            receivers.push(rx);
        }
        for _ in 0..4 {
            assert!(matches!(next_event(&mut events).await, EndpointEvent::Connected(_)));
        }

        let dead = receivers.remove(1);
        drop(dead);

        let report = endpoint.broadcast(Frame::Text("hi".into())).unwrap();
        assert_eq!(report.delivered, 3);
        assert_eq!(report.removed, 1);
        for rx in receivers.iter_mut() {
            assert_eq!(rx.try_recv().unwrap(), Message::Text("hi".into()));
        }
        assert_eq!(endpoint.client_count(), 3);
        assert_eq!(next_event(&mut events).await, EndpointEvent::Disconnected(ids[1]));

        let again = endpoint.broadcast(Frame::Text("again".into())).unwrap();
        assert_eq!(again.removed, 0);
        assert!(!endpoint.release(ids[1]));
        assert!(timeout(Duration::from_millis(50), events.recv()).await.is_err());
    }

    #[tokio::test]
    async fn oversize_outbound_is_rejected_before_sending() {
        let (endpoint, _events) = endpoint(2);
        let (tx, mut rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let id = endpoint.accept(tx);

        let err = endpoint
            .send_to(id, Frame::Binary(vec![0; 33]))
            .await
            .unwrap_err();
        assert!(matches!(err, EndpointError::PayloadTooLarge { len: 33, max: 32 }));
        assert!(matches!(
            endpoint.broadcast(Frame::Binary(vec![0; 40])),
            Err(EndpointError::PayloadTooLarge { .. })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn single_client_mode_replaces_previous_client() {
        let (endpoint, mut events) = endpoint(1);
        let (tx_a, mut rx_a) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let a = endpoint.accept(tx_a);
        let (tx_b, _rx_b) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let b = endpoint.accept(tx_b);

        assert_eq!(endpoint.client_ids(), vec![b]);
        assert!(matches!(rx_a.try_recv(), Ok(Message::Close(Some(_)))));
        assert_eq!(next_event(&mut events).await, EndpointEvent::Connected(a));
        assert_eq!(next_event(&mut events).await, EndpointEvent::Disconnected(a));
        assert_eq!(next_event(&mut events).await, EndpointEvent::Connected(b));
    }

    #[tokio::test]
    async fn eviction_shuts_out_a_client_with_a_full_queue() {
        let (endpoint, mut events) = endpoint(1);
        let (tx_a, mut rx_a) = mpsc::channel(1);
        let (a, mut signal_a) = endpoint.admit(tx_a);
        let report = endpoint.broadcast(Frame::Text("backlog".into())).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(endpoint.broadcast(Frame::Text("more".into())).unwrap().dropped, 1);
        assert!(!*signal_a.borrow());

        let (tx_b, _rx_b) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let b = endpoint.accept(tx_b);

        timeout(Duration::from_secs(1), signal_a.wait_for(|shut_out| *shut_out))
            .await
            .expect("shut out in time")
            .expect("signal still open");
        assert_eq!(rx_a.try_recv().unwrap(), Message::Text("backlog".into()));
        assert!(rx_a.try_recv().is_err());

        endpoint.deliver(a, Frame::Text("late".into())).await;
        assert_eq!(next_event(&mut events).await, EndpointEvent::Connected(a));
        assert_eq!(next_event(&mut events).await, EndpointEvent::Disconnected(a));
        assert_eq!(next_event(&mut events).await, EndpointEvent::Connected(b));
        assert!(timeout(Duration::from_millis(50), events.recv()).await.is_err());
        assert_eq!(endpoint.client_ids(), vec![b]);
    }

    #[tokio::test]
    async fn send_to_unknown_or_full_client_reports_error() {
        let (endpoint, _events) = endpoint(2);
        assert!(matches!(
            endpoint.send_to(ClientId(99), Frame::Text("x".into())).await,
            Err(EndpointError::UnknownClient(ClientId(99)))
        ));

        let (tx, _rx) = mpsc::channel(1);
        let id = endpoint.accept(tx);
        endpoint.send_to(id, Frame::Text("1".into())).await.unwrap();
        assert!(matches!(
            endpoint.send_to(id, Frame::Text("2".into())).await,
            Err(EndpointError::Backpressure(_))
        ));
        assert_eq!(endpoint.client_count(), 1);
    }

    #[tokio::test]
    async fn tunnel_target_requires_attached_tunnel() {
        let (endpoint, _events) = endpoint(2);
        assert!(matches!(
            endpoint.send_to(ClientId::TUNNEL, Frame::Text("x".into())).await,
            Err(EndpointError::TunnelNotAttached)
        ));
        assert!(!endpoint.set_topic(ClientId::TUNNEL, Topic::Camera, true));
    }

    #[tokio::test]
    async fn snapshot_subscription_is_served_once() {
        let (endpoint, _events) = endpoint(3);
        let (tx_live, mut live) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let (tx_once, mut once) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let (tx_idle, mut idle) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let live_id = endpoint.accept(tx_live);
        let once_id = endpoint.accept(tx_once);
        endpoint.accept(tx_idle);
        assert!(endpoint.set_topic(live_id, Topic::Camera, true));
        assert!(endpoint.set_topic(once_id, Topic::CameraSnapshot, true));

        let first = endpoint.publish_topic(Topic::Camera, vec![1, 2]).await.unwrap();
        assert_eq!(first.delivered, 2);
        let second = endpoint.publish_topic(Topic::Camera, vec![3]).await.unwrap();
        assert_eq!(second.delivered, 1);

        assert_eq!(live.try_recv().unwrap(), Message::Binary(vec![1, 2]));
        assert_eq!(live.try_recv().unwrap(), Message::Binary(vec![3]));
        assert_eq!(once.try_recv().unwrap(), Message::Binary(vec![1, 2]));
        assert!(once.try_recv().is_err());
        assert!(idle.try_recv().is_err());
        assert!(!endpoint.has_topic(once_id, Topic::CameraSnapshot));
    }

    #[tokio::test]
    async fn close_all_sends_close_and_empties_table() {
        let (endpoint, _events) = endpoint(2);
        let (tx, mut rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        endpoint.accept(tx);
        assert_eq!(endpoint.close_all(), 1);
        assert_eq!(endpoint.client_count(), 0);
        assert!(matches!(rx.try_recv(), Ok(Message::Close(Some(frame))) if frame.code == close_code::NORMAL));
    }

    #[tokio::test]
    async fn close_all_shuts_out_clients_that_cannot_take_a_close() {
        let (endpoint, _events) = endpoint(2);
        let (tx, mut rx) = mpsc::channel(1);
        let (_, signal) = endpoint.admit(tx);
        endpoint.broadcast(Frame::Text("backlog".into())).unwrap();

        assert_eq!(endpoint.close_all(), 1);
        assert!(*signal.borrow());
        assert_eq!(rx.try_recv().unwrap(), Message::Text("backlog".into()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn token_auth_accepts_header_or_query() {
        let check = token_auth("s3cret");
        let mut headers = HeaderMap::new();
        let bare = UpgradeRequest {
            path: "/ws/control",
            query: None,
            headers: &headers,
        };
        assert!(!check(&bare));

        let query = UpgradeRequest {
            path: "/ws/control",
            query: Some("a=1&token=s3cret"),
            headers: &headers,
        };
        assert!(check(&query));

        headers.insert(header::AUTHORIZATION, "Bearer s3cret".parse().unwrap());
        let bearer = UpgradeRequest {
            path: "/ws/control",
            query: Some("token=wrong"),
            headers: &headers,
        };
        assert!(check(&bearer));
    }

    #[test]
    fn query_param_is_percent_decoded() {
        let headers = HeaderMap::new();
        let request = UpgradeRequest {
            path: "/ws",
            query: Some("token=a%20b%26c&x"),
            headers: &headers,
        };
        assert_eq!(request.query_param("token").as_deref(), Some("a b&c"));
        assert_eq!(request.query_param("x").as_deref(), Some(""));
        assert_eq!(request.query_param("missing"), None);
    }
}
