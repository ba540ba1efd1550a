use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A complete WebSocket data frame as seen by relay handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Frame::Binary(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text),
            Frame::Binary(_) => None,
        }
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Frame::Text(text)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(bytes: Vec<u8>) -> Self {
        Frame::Binary(bytes)
    }
}

/// Identifies a connected relay client.
///
/// LAN sockets get sequential ids starting at 1. [`ClientId::TUNNEL`] is
/// reserved for traffic relayed through the cloud broker so a single handler
/// can serve both kinds of caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl ClientId {
    pub const TUNNEL: ClientId = ClientId(u32::MAX);

    pub fn is_tunnel(self) -> bool {
        self == Self::TUNNEL
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_tunnel() {
            f.write_str("tunnel")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Lifecycle of one cloud tunnel connection attempt.
///
/// Ordering matters: a state compares greater than every state it can follow
/// within a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Dialing,
    Connected,
    Registered,
}

impl ConnectionState {
    /// Transport is up, whether or not the broker has confirmed registration.
    pub fn is_connected(self) -> bool {
        self >= ConnectionState::Connected
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

/// Snapshot of the parameters used for one tunnel dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub base_url: String,
    pub device_id: String,
    pub auth_token: String,
    pub tunnel_key: String,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
}

impl TunnelConfig {
    pub fn new(
        base_url: impl Into<String>,
        device_id: impl Into<String>,
        auth_token: impl Into<String>,
        tunnel_key: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            device_id: device_id.into(),
            auth_token: auth_token.into(),
            tunnel_key: tunnel_key.into(),
            ..Self::default()
        }
    }

    /// A dial needs at least a broker and an identity.
    pub fn is_ready(&self) -> bool {
        !self.base_url.trim().is_empty() && !self.device_id.trim().is_empty()
    }

    /// True when the fields that shape the dial URL differ.
    pub fn dial_differs(&self, other: &TunnelConfig) -> bool {
        self.base_url != other.base_url
            || self.device_id != other.device_id
            || self.auth_token != other.auth_token
            || self.tunnel_key != other.tunnel_key
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            device_id: String::new(),
            auth_token: String::new(),
            tunnel_key: String::new(),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(1),
            ping_interval: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_orders_along_an_attempt() {
        assert!(ConnectionState::Disconnected < ConnectionState::Dialing);
        assert!(ConnectionState::Dialing < ConnectionState::Connected);
        assert!(ConnectionState::Connected < ConnectionState::Registered);
        assert!(ConnectionState::Registered.is_connected());
        assert!(!ConnectionState::Dialing.is_connected());
    }

    #[test]
    fn tunnel_config_readiness_requires_base_and_device() {
        assert!(!TunnelConfig::default().is_ready());
        assert!(!TunnelConfig::new("wss://x.io", " ", "", "").is_ready());
        assert!(TunnelConfig::new("wss://x.io", "dev1", "", "").is_ready());
    }

    #[test]
    fn dial_differs_ignores_timing_fields() {
        let a = TunnelConfig::new("wss://x.io", "dev1", "tok", "ws_control");
        let mut b = a.clone();
        b.reconnect_delay = Duration::from_secs(9);
        assert!(!a.dial_differs(&b));
        b.auth_token = "other".into();
        assert!(a.dial_differs(&b));
    }
}
