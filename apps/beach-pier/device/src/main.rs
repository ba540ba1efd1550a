use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use beach_pier_core::ClaimStore;
use beach_pier_device::{
    control::{FileLog, LogSource},
    device::{local_ip, ConfigQueue, HostDevice},
    endpoint::{token_auth, LocalServer},
    media::FrameDirSource,
    relays::{CloudSettings, DeviceRelays, RelayDeps, RelaySettings, RSSI_PERIOD},
    tunnel::TunnelOptions,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};
use tokio::{signal, sync::mpsc};
use tracing::{info, warn};

mod config;
mod telemetry;

use config::{Cli, DeviceConfig};

const CONFIG_QUEUE_DEPTH: usize = 8;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DeviceConfig::try_from(cli)?;
    let telemetry = telemetry::Telemetry::init(config.log_file.as_deref())?;

    info!(
        listen_addr = %config.listen_addr,
        hostname = %config.hostname,
        device_id = %config.device_id,
        local_auth = config.auth_token.is_some(),
        tunnel_all = config.tunnel_all,
        "starting beach-pier"
    );

    run(config, telemetry.metrics_handle()).await
}

struct AppState {
    metrics: PrometheusHandle,
}

async fn run(config: DeviceConfig, metrics: PrometheusHandle) -> Result<()> {
    let ip = if config.listen_addr.ip().is_unspecified() {
        local_ip()
    } else {
        config.listen_addr.ip()
    };
    let device = Arc::new(
        HostDevice::new(config.hostname.clone(), ip.to_string(), config.document.clone())
            .with_wireless_stats(config.wireless_stats.clone()),
    );
    device.set_camera_available(config.camera_frames.is_some());
    let link_monitor = device.spawn_link_monitor(RSSI_PERIOD);

    let (queue, updates) = ConfigQueue::new(CONFIG_QUEUE_DEPTH);
    let logs = config
        .log_file
        .clone()
        .map(|path| Arc::new(FileLog::new(path)) as Arc<dyn LogSource>);

    let server = LocalServer::new();
    let relays = DeviceRelays::start(
        &server,
        RelayDeps {
            device: device.clone(),
            config_sink: Arc::new(queue),
            claims: Arc::new(ClaimStore::default()),
            logs,
        },
        RelaySettings {
            auth: config.auth_token.clone().map(token_auth),
            tunnel_all: config.tunnel_all,
            tunnel_options: TunnelOptions {
                ca_cert_pem: config.ca_cert_pem.clone(),
                ..TunnelOptions::default()
            },
            rssi_period: None,
        },
    )
    .context("failed to start relays")?;

    relays
        .apply_cloud(&CloudSettings::from_config(&config.document, &config.device_id))
        .await;

    let camera_task = config
        .camera_frames
        .clone()
        .map(|dir| FrameDirSource::new(dir, config.camera_fps).spawn(relays.camera_hub()));
    let updates_task = tokio::spawn(apply_config_updates(
        updates,
        device.clone(),
        relays.clone(),
        config.device_id.clone(),
    ));

    let state = Arc::new(AppState { metrics });
    let router = Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(server.router());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("beach-pier listening on {}", config.listen_addr);

    let closing = server.clone();
    let graceful = axum::serve(listener, router).with_graceful_shutdown(async move {
        shutdown_signal().await;
        closing.shutdown();
    });
    graceful.await.context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; stopping relays"
    );
    updates_task.abort();
    link_monitor.abort();
    if let Some(task) = camera_task {
        task.abort();
    }
    relays.shutdown().await;
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

/// Merges queued `set_config` payloads into the device document and
/// re-applies the cloud section to every tunnel.
async fn apply_config_updates(
    mut updates: mpsc::Receiver<Value>,
    device: Arc<HostDevice>,
    relays: DeviceRelays,
    device_id: String,
) {
    while let Some(update) = updates.recv().await {
        let merged = device.apply_update(&update);
        let touches_cloud = match &update {
            Value::Array(patches) => patches.iter().any(|patch| patch.get("cloudTunnel").is_some()),
            patch => patch.get("cloudTunnel").is_some(),
        };
        info!(touches_cloud, "config update applied");
        if touches_cloud {
            relays
                .apply_cloud(&CloudSettings::from_config(&merged, &device_id))
                .await;
        }
    }
    warn!("config update queue closed");
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
