use serde::Deserialize;
use serde_json::Value;

/// Details the broker hands back once it recognises a device connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
    pub ui_ws_url: Option<String>,
    pub device_ws_url: Option<String>,
}

/// Broker-to-device control frames. These share the text channel with
/// application payloads and are consumed by the tunnel itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerControl {
    Registered(Registration),
    UiConnected,
    UiDisconnected,
}

/// Result of inspecting an inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Control(BrokerControl),
    Payload,
}

/// Only `type` decides the frame kind; URL fields of the wrong shape are
/// ignored rather than turning a control frame into a payload.
#[derive(Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    ui_ws_url: Value,
    #[serde(default)]
    device_ws_url: Value,
}

/// Decides whether a text frame is a broker control message.
///
/// A JSON object whose `type` is `registered`, `ui_connected` or
/// `ui_disconnected` is control, whatever its other fields hold. Anything
/// else, including JSON with an unrelated `type`, is an application payload
/// and must be forwarded as is.
pub fn classify_text(text: &str) -> Inbound {
    if !text.contains("\"type\"") {
        return Inbound::Payload;
    }
    let Ok(frame) = serde_json::from_str::<WireFrame>(text) else {
        return Inbound::Payload;
    };
    match frame.kind.as_str() {
        "registered" => Inbound::Control(BrokerControl::Registered(Registration {
            ui_ws_url: url_field(&frame.ui_ws_url),
            device_ws_url: url_field(&frame.device_ws_url),
        })),
        "ui_connected" => Inbound::Control(BrokerControl::UiConnected),
        "ui_disconnected" => Inbound::Control(BrokerControl::UiDisconnected),
        _ => Inbound::Payload,
    }
}

fn url_field(value: &Value) -> Option<String> {
    value
        .as_str()
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}
