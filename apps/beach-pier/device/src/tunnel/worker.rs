use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use beach_pier_core::{device_dial_url, Backoff, BackoffPolicy, ConnectionState, TunnelConfig};
use metrics::counter;
use tokio::{
    sync::watch,
    time::{interval, sleep, timeout, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use super::{transport_callbacks, TunnelInner};
use crate::outbound::{redact, stop_requested, ClientConfig, OutboundTunnelClient};

const EMPTY_CONFIG_RETRY: Duration = Duration::from_secs(2);
const DIAL_HOLD: Duration = Duration::from_secs(2);
const CONNECT_WAIT: Duration = Duration::from_secs(15);
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Dial loop for one tunnel: dial, hold while connected, tear down, back off.
/// Exits when stopped, disabled, or after one session if auto-reconnect is off.
pub(super) async fn run(inner: Arc<TunnelInner>, mut stop: watch::Receiver<bool>) {
    let mut backoff = Backoff::new(BackoffPolicy::tunnel(inner.config.lock().reconnect_delay));
    info!(tunnel = %inner.label, "tunnel worker started");

    loop {
        if *stop.borrow() || !inner.enabled() {
            break;
        }

        let config = inner.config.lock().clone();
        if backoff.policy().base != config.reconnect_delay {
            backoff = Backoff::new(BackoffPolicy::tunnel(config.reconnect_delay));
        }
        if !config.is_ready() {
            debug!(tunnel = %inner.label, "tunnel config incomplete; waiting");
            if pause(EMPTY_CONFIG_RETRY, &mut stop).await {
                break;
            }
            continue;
        }
        let url = match device_dial_url(&config) {
            Ok(url) => url,
            Err(err) => {
                warn!(tunnel = %inner.label, error = %err, "cannot build dial url");
                if pause(EMPTY_CONFIG_RETRY, &mut stop).await {
                    break;
                }
                continue;
            }
        };

        let connected_at = dial(&inner, &config, &url, &mut stop).await;
        let held = match connected_at {
            Some(since) => {
                hold_while_connected(&inner, &mut stop).await;
                since.elapsed()
            }
            None => Duration::ZERO,
        };
        inner.teardown().await;

        if *stop.borrow() || !config.auto_reconnect {
            break;
        }
        let delay = backoff
            .on_session_end(held)
            .unwrap_or(backoff.policy().ceiling);
        info!(
            tunnel = %inner.label,
            held_ms = held.as_millis() as u64,
            delay_ms = delay.as_millis() as u64,
            attempt = backoff.failures(),
            "tunnel redial scheduled"
        );
        if pause(delay, &mut stop).await {
            break;
        }
    }

    info!(tunnel = %inner.label, "tunnel worker stopped");
}

/// Installs a fresh transport and waits for it to connect. Returns when the
/// connection came up, or `None` if it did not within the connect window.
async fn dial(
    inner: &Arc<TunnelInner>,
    config: &TunnelConfig,
    url: &str,
    stop: &mut watch::Receiver<bool>,
) -> Option<Instant> {
    let permit = tokio::select! {
        _ = stop_requested(stop) => return None,
        permit = inner.gate.acquire() => permit,
    };
    if permit.is_none() {
        warn!(tunnel = %inner.label, "dial gate wait expired; dialing anyway");
    }

    counter!("beach_pier_tunnel_dials_total", 1, "tunnel" => inner.label.clone());
    info!(tunnel = %inner.label, url = %redact(url), "dialing broker");

    let mut client_config = ClientConfig::new(url);
    client_config.auto_reconnect = false;
    client_config.buffer_size = inner.options.buffer_size;
    client_config.ca_cert_pem = inner.options.ca_cert_pem.clone();
    client_config.network_timeout = inner.options.network_timeout;
    client_config.ping_interval = config.ping_interval;
    client_config.reconnect_delay = config.reconnect_delay;

    {
        let mut transport = inner.transport.lock().await;
        let generation = inner
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        let client = OutboundTunnelClient::new(transport_callbacks(inner, generation));
        inner.set_state(ConnectionState::Dialing);
        if let Err(err) = client.begin(client_config) {
            warn!(tunnel = %inner.label, error = %err, "tunnel transport rejected config");
            return None;
        }
        *transport = Some(client);
    }

    let mut state = inner.state.subscribe();
    let mut connected = wait_connected(&mut state, DIAL_HOLD, stop).await;
    drop(permit);
    if !connected {
        connected = wait_connected(&mut state, CONNECT_WAIT - DIAL_HOLD, stop).await;
    }
    if !connected {
        warn!(tunnel = %inner.label, "broker did not accept connection in time");
        return None;
    }
    Some(Instant::now())
}

async fn wait_connected(
    state: &mut watch::Receiver<ConnectionState>,
    within: Duration,
    stop: &mut watch::Receiver<bool>,
) -> bool {
    let waiting = async {
        loop {
            if state.borrow_and_update().is_connected() {
                return true;
            }
            tokio::select! {
                changed = state.changed() => if changed.is_err() {
                    return false;
                },
                _ = stop_requested(stop) => return false,
            }
        }
    };
    timeout(within, waiting).await.unwrap_or(false)
}

async fn hold_while_connected(inner: &TunnelInner, stop: &mut watch::Receiver<bool>) {
    let mut ticker = interval(IDLE_POLL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop_requested(stop) => return,
            _ = ticker.tick() => {
                if !inner.state().is_connected() {
                    debug!(tunnel = %inner.label, "tunnel connection lost");
                    return;
                }
            }
        }
    }
}

/// Sleeps for `delay`; returns true if a stop arrived first.
async fn pause(delay: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = stop_requested(stop) => true,
        _ = sleep(delay) => false,
    }
}
