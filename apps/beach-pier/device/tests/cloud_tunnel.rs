use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, RawQuery, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use beach_pier_core::{ClaimStore, ConnectionState, Frame};
use beach_pier_device::{
    device::{ConfigQueue, HostDevice},
    endpoint::LocalServer,
    relays::{CloudSettings, DeviceRelays, RelayDeps, RelaySettings},
    tunnel::{CloudTunnel, TunnelError, TUNNEL_BUFFER_SIZE},
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{
    net::TcpListener,
    sync::mpsc,
    time::{sleep, timeout},
};

#[derive(Debug)]
enum BrokerEvent {
    Dialed { device: String, query: String },
    Received(Message),
}

#[derive(Clone)]
struct Broker {
    events: mpsc::UnboundedSender<BrokerEvent>,
    script: Arc<Vec<String>>,
}

async fn device_socket(
    State(broker): State<Broker>,
    Path(device): Path<String>,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Response {
    let _ = broker.events.send(BrokerEvent::Dialed {
        device,
        query: query.unwrap_or_default(),
    });
    ws.on_upgrade(move |socket| relay(socket, broker))
}

async fn relay(socket: WebSocket, broker: Broker) {
    let (mut sink, mut stream) = socket.split();
    for line in broker.script.iter() {
        if sink.send(Message::Text(line.clone())).await.is_err() {
            return;
        }
    }
    while let Some(Ok(message)) = stream.next().await {
        if matches!(message, Message::Text(_) | Message::Binary(_)) {
            let _ = broker.events.send(BrokerEvent::Received(message));
        }
    }
}

async fn spawn_broker(script: &[&str]) -> (SocketAddr, mpsc::UnboundedReceiver<BrokerEvent>) {
    let (events, receiver) = mpsc::unbounded_channel();
    let broker = Broker {
        events,
        script: Arc::new(script.iter().map(|line| line.to_string()).collect()),
    };
    let router = Router::new()
        .route("/ws/device/:device", get(device_socket))
        .with_state(broker);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await });
    (addr, receiver)
}

fn start_relays() -> DeviceRelays {
    let (queue, _updates) = ConfigQueue::new(4);
    DeviceRelays::start(
        &LocalServer::new(),
        RelayDeps {
            device: Arc::new(HostDevice::new("pier-it", "127.0.0.1", json!({}))),
            config_sink: Arc::new(queue),
            claims: Arc::new(ClaimStore::default()),
            logs: None,
        },
        RelaySettings::default(),
    )
    .expect("relays start")
}

async fn enable(relays: &DeviceRelays, broker: SocketAddr, token: &str) -> CloudTunnel {
    relays
        .apply_cloud(&CloudSettings {
            enabled: true,
            base_url: format!("http://{broker}"),
            device_id: "pier-it".into(),
            auth_token: token.into(),
            ..CloudSettings::default()
        })
        .await;
    relays.tunnels()[0].clone()
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<BrokerEvent>) -> BrokerEvent {
    timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("broker event in time")
        .expect("broker alive")
}

async fn next_json(events: &mut mpsc::UnboundedReceiver<BrokerEvent>) -> Value {
    loop {
        match next_event(events).await {
            BrokerEvent::Received(Message::Text(text)) => {
                return serde_json::from_str(&text).expect("json")
            }
            BrokerEvent::Received(_) | BrokerEvent::Dialed { .. } => continue,
        }
    }
}

const REGISTERED: &str = r#"{"type":"registered","ui_ws_url":"ws://broker/ui/pier-it","device_ws_url":"ws://broker/device/pier-it"}"#;

#[test_timeout::tokio_timeout_test(30)]
async fn registers_and_answers_commands_through_the_broker() {
    let (broker, mut events) = spawn_broker(&[
        REGISTERED,
        r#"{"type":"ui_connected"}"#,
        r#"{"cmd":"ping"}"#,
        r#"{"cmd":"get_rssi"}"#,
    ])
    .await;
    let relays = start_relays();
    let tunnel = enable(&relays, broker, "tok en").await;

    match next_event(&mut events).await {
        BrokerEvent::Dialed { device, query } => {
            assert_eq!(device, "pier-it");
            assert_eq!(query, "announce=1&tunnel=ws_control&token=tok%20en");
        }
        other => panic!("expected dial, got {other:?}"),
    }

    assert_eq!(
        next_json(&mut events).await,
        json!({"ok": true, "cmd": "ping", "type": "pong"})
    );
    assert_eq!(next_json(&mut events).await["cmd"], "get_rssi");

    assert_eq!(tunnel.state(), ConnectionState::Registered);
    assert!(tunnel.ui_connected());
    let status = tunnel.status();
    assert_eq!(status.ui_ws_url.as_deref(), Some("ws://broker/ui/pier-it"));
    assert!(status.connected);

    relays
        .control
        .publish(Frame::Text(r#"{"type":"note"}"#.into()))
        .await
        .unwrap();
    assert_eq!(next_json(&mut events).await, json!({"type": "note"}));

    assert!(matches!(
        tunnel.send_binary(vec![0; TUNNEL_BUFFER_SIZE + 1]).await,
        Err(TunnelError::PayloadTooLarge { .. })
    ));

    tunnel.set_enabled(false).await;
    assert_eq!(tunnel.state(), ConnectionState::Disconnected);
    assert!(!tunnel.ui_connected());
    assert_eq!(tunnel.send_text("{}").await, Err(TunnelError::InvalidState));
}

#[test_timeout::tokio_timeout_test(30)]
async fn payload_before_registration_never_reaches_the_device() {
    let (broker, mut events) = spawn_broker(&[
        r#"{"cmd":"get_status"}"#,
        REGISTERED,
        r#"{"cmd":"ping"}"#,
    ])
    .await;
    let relays = start_relays();
    let tunnel = enable(&relays, broker, "").await;

    let first = next_json(&mut events).await;
    assert_eq!(first["cmd"], "ping");
    assert!(tunnel.wait_for_state(ConnectionState::Registered, Duration::from_secs(1)).await);
    tunnel.set_enabled(false).await;
}

#[test_timeout::tokio_timeout_test(secs = 60, flavor = "multi_thread")]
async fn sends_racing_reconfiguration_fail_cleanly() {
    let (broker, mut events) = spawn_broker(&[REGISTERED]).await;
    let relays = start_relays();
    let tunnel = enable(&relays, broker, "a").await;
    assert!(tunnel.wait_for_state(ConnectionState::Registered, Duration::from_secs(10)).await);

    let sender = {
        let tunnel = tunnel.clone();
        tokio::spawn(async move {
            let mut outcomes = Vec::new();
            for i in 0..200 {
                outcomes.push(tunnel.send_text(&format!(r#"{{"n":{i}}}"#)).await);
                tokio::task::yield_now().await;
            }
            outcomes
        })
    };
    for round in 0..4 {
        let token = if round % 2 == 0 { "b" } else { "a" };
        assert!(tunnel.configure(&format!("http://{broker}"), "pier-it", token, "ws_control").await);
        sleep(Duration::from_millis(20)).await;
    }

    let outcomes = sender.await.unwrap();
    assert_eq!(outcomes.len(), 200);
    for outcome in outcomes {
        assert!(
            matches!(
                outcome,
                Ok(()) | Err(TunnelError::InvalidState | TunnelError::Timeout | TunnelError::Closed)
            ),
            "unexpected send outcome {outcome:?}"
        );
    }

    assert!(tunnel.wait_for_state(ConnectionState::Registered, Duration::from_secs(15)).await);
    tunnel.set_enabled(false).await;
    assert_eq!(tunnel.state(), ConnectionState::Disconnected);
    while events.try_recv().is_ok() {}
}

#[test_timeout::tokio_timeout_test(30)]
async fn reenabling_redials_the_broker() {
    let (broker, mut events) = spawn_broker(&[REGISTERED]).await;
    let relays = start_relays();
    let tunnel = enable(&relays, broker, "").await;
    assert!(tunnel.wait_for_state(ConnectionState::Registered, Duration::from_secs(10)).await);
    assert!(matches!(next_event(&mut events).await, BrokerEvent::Dialed { .. }));

    tunnel.set_enabled(false).await;
    tunnel.set_enabled(true).await;
    assert!(matches!(next_event(&mut events).await, BrokerEvent::Dialed { .. }));
    assert!(tunnel.wait_for_state(ConnectionState::Registered, Duration::from_secs(10)).await);
    tunnel.set_enabled(false).await;
}
