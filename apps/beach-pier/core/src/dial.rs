use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use thiserror::Error;

use crate::TunnelConfig;

/// Everything except RFC 3986 unreserved characters gets escaped.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DialUrlError {
    #[error("broker base url is empty")]
    MissingBaseUrl,
    #[error("device id is empty")]
    MissingDeviceId,
}

/// Percent-encodes a query or path component using the unreserved allowlist.
pub fn encode_component(raw: &str) -> String {
    utf8_percent_encode(raw, COMPONENT).to_string()
}

/// Builds `<base>/ws/device/<id>?announce=1[&tunnel=..][&token=..]`.
///
/// `http(s)://` bases are rewritten to `ws(s)://`; a base without a scheme is
/// assumed to be TLS.
pub fn device_dial_url(config: &TunnelConfig) -> Result<String, DialUrlError> {
    let base = config.base_url.trim().trim_end_matches('/');
    if base.is_empty() {
        return Err(DialUrlError::MissingBaseUrl);
    }
    let device_id = config.device_id.trim();
    if device_id.is_empty() {
        return Err(DialUrlError::MissingDeviceId);
    }

    let mut url = websocket_base(base);
    url.push_str("/ws/device/");
    url.push_str(&encode_component(device_id));
    url.push_str("?announce=1");
    if !config.tunnel_key.is_empty() {
        url.push_str("&tunnel=");
        url.push_str(&encode_component(&config.tunnel_key));
    }
    if !config.auth_token.is_empty() {
        url.push_str("&token=");
        url.push_str(&encode_component(&config.auth_token));
    }
    Ok(url)
}

fn websocket_base(base: &str) -> String {
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("wss://") || base.starts_with("ws://") {
        base.to_string()
    } else {
        format!("wss://{base}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_optional_fields_with_unreserved_allowlist() {
        let config = TunnelConfig::new("https://x.io", "dev1", "tok en", "k&ey");
        let url = device_dial_url(&config).unwrap();
        assert_eq!(
            url,
            "wss://x.io/ws/device/dev1?announce=1&tunnel=k%26ey&token=tok%20en"
        );
    }

    #[test]
    fn omits_empty_optional_fields() {
        let config = TunnelConfig::new("ws://127.0.0.1:9000/", "dev1", "", "");
        assert_eq!(
            device_dial_url(&config).unwrap(),
            "ws://127.0.0.1:9000/ws/device/dev1?announce=1"
        );
    }

    #[test]
    fn leaves_unreserved_characters_alone() {
        assert_eq!(encode_component("aZ09-_.~"), "aZ09-_.~");
        assert_eq!(encode_component("a/b+c=d"), "a%2Fb%2Bc%3Dd");
        assert_eq!(encode_component("é"), "%C3%A9");
    }

    #[test]
    fn rejects_incomplete_config() {
        let missing_base = TunnelConfig::new("", "dev1", "", "");
        assert_eq!(
            device_dial_url(&missing_base),
            Err(DialUrlError::MissingBaseUrl)
        );
        let missing_device = TunnelConfig::new("wss://x.io", "", "", "");
        assert_eq!(
            device_dial_url(&missing_device),
            Err(DialUrlError::MissingDeviceId)
        );
    }

    #[test]
    fn bare_host_defaults_to_tls() {
        let config = TunnelConfig::new("tnl.example.io", "dev1", "", "ws_control");
        assert_eq!(
            device_dial_url(&config).unwrap(),
            "wss://tnl.example.io/ws/device/dev1?announce=1&tunnel=ws_control"
        );
    }
}
