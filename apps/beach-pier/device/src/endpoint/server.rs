use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{close_code, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use beach_pier_core::Frame;
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::{
    sync::{mpsc, watch},
    time::timeout,
};
use tracing::{debug, info, warn};

use super::{
    close_message, AuthCheck, EndpointError, EndpointLimits, FrameHandler, RelayEndpoint,
    UpgradeRequest, CLIENT_QUEUE_DEPTH,
};

/// Frames above this size are refused by the WebSocket codec itself, before
/// the per-endpoint check runs.
const CODEC_CEILING_FLOOR: usize = 64 * 1024;
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// Path table for the device's local HTTP server. Endpoints register at
/// runtime; [`LocalServer::router`] serves them all from one fallback route.
#[derive(Clone, Default)]
pub struct LocalServer {
    inner: Arc<ServerInner>,
}

#[derive(Default)]
struct ServerInner {
    endpoints: DashMap<String, RelayEndpoint>,
    stopped: AtomicBool,
}

impl LocalServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `path` and returns its endpoint. Fails if the path is
    /// taken or the server has been shut down.
    pub fn begin(
        &self,
        path: &str,
        limits: EndpointLimits,
        auth: Option<AuthCheck>,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<RelayEndpoint, EndpointError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(EndpointError::ServerUnavailable);
        }
        match self.inner.endpoints.entry(path.to_string()) {
            Entry::Occupied(_) => Err(EndpointError::PathInUse(path.to_string())),
            Entry::Vacant(slot) => {
                let endpoint = RelayEndpoint::new(path.to_string(), limits, auth, handler);
                slot.insert(endpoint.clone());
                info!(
                    path,
                    max_clients = limits.max_clients,
                    max_message_len = limits.max_message_len,
                    "websocket endpoint registered"
                );
                Ok(endpoint)
            }
        }
    }

    pub fn endpoint(&self, path: &str) -> Option<RelayEndpoint> {
        self.inner.endpoints.get(path).map(|entry| entry.value().clone())
    }

    pub fn endpoints(&self) -> Vec<RelayEndpoint> {
        self.inner
            .endpoints
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .fallback(upgrade_handler)
            .with_state(self.clone())
    }

    /// Refuses further registrations and closes every tracked client.
    pub fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        for endpoint in self.endpoints() {
            endpoint.close_all();
        }
    }
}

async fn upgrade_handler(
    State(server): State<LocalServer>,
    uri: Uri,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let path = uri.path();
    let Some(endpoint) = server.endpoint(path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(ws) = ws else {
        return (StatusCode::UPGRADE_REQUIRED, "websocket upgrade required").into_response();
    };

    let ceiling = endpoint
        .limits()
        .max_message_len
        .saturating_add(1)
        .max(CODEC_CEILING_FLOOR);
    let ws = ws.max_message_size(ceiling).max_frame_size(ceiling);

    let request = UpgradeRequest {
        path,
        query: uri.query(),
        headers: &headers,
    };
    if !endpoint.authorize(&request) {
        counter!("beach_pier_auth_rejected_total", 1, "path" => path.to_string());
        warn!(path, "websocket upgrade rejected by auth check");
        return ws.on_upgrade(reject_unauthorized).into_response();
    }

    ws.on_upgrade(move |socket| serve_client(socket, endpoint))
        .into_response()
}

/// Completes the upgrade only to deliver a policy-violation close, so the
/// peer can tell a refusal from a network failure.
async fn reject_unauthorized(mut socket: WebSocket) {
    if socket
        .send(close_message(close_code::POLICY, "unauthorized"))
        .await
        .is_err()
    {
        return;
    }
    let _ = timeout(CLOSE_LINGER, async {
        while let Some(Ok(message)) = socket.recv().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    })
    .await;
}

async fn serve_client(socket: WebSocket, endpoint: RelayEndpoint) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_QUEUE_DEPTH);
    let control = tx.clone();
    let (client, mut evicted) = endpoint.admit(tx);
    debug!(path = endpoint.path(), client = %client, "client connected");

    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let limit = endpoint.limits().max_message_len;
    loop {
        let message = tokio::select! {
            biased;
            _ = shut_out(&mut evicted) => {
                debug!(path = endpoint.path(), client = %client, "client shut out by endpoint");
                break;
            }
            message = stream.next() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let frame = match message {
            Ok(Message::Text(text)) => Frame::Text(text),
            Ok(Message::Binary(bytes)) => Frame::Binary(bytes),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(path = endpoint.path(), client = %client, error = %err, "receive failed");
                break;
            }
        };
        if frame.is_empty() {
            continue;
        }
        if frame.len() > limit {
            counter!("beach_pier_oversize_inbound_total", 1, "path" => endpoint.path().to_string());
            warn!(
                path = endpoint.path(),
                client = %client,
                len = frame.len(),
                limit,
                "inbound frame too large; closing"
            );
            let _ = control.try_send(close_message(close_code::SIZE, "message too large"));
            break;
        }
        endpoint.deliver(client, frame).await;
    }

    drop(control);
    endpoint.release(client);
    if timeout(CLOSE_LINGER, &mut writer).await.is_err() {
        writer.abort();
    }
    debug!(path = endpoint.path(), client = %client, "client disconnected");
}

/// Resolves once the endpoint has shut this client out, or has dropped its
/// slot altogether.
async fn shut_out(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|shut_out| *shut_out).await;
}
