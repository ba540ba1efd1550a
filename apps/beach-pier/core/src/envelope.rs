use serde::Serialize;
use serde_json::{Map, Value};

/// Builder for `{"ok":..,"cmd":..,...}` control replies.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlResponse {
    body: Map<String, Value>,
}

impl ControlResponse {
    pub fn ok(cmd: &str) -> Self {
        let mut body = Map::new();
        body.insert("ok".into(), Value::Bool(true));
        body.insert("cmd".into(), Value::String(cmd.to_string()));
        Self { body }
    }

    /// Failed reply. `cmd` is omitted when the request never named one.
    pub fn error(cmd: Option<&str>, code: &str) -> Self {
        let mut body = Map::new();
        body.insert("ok".into(), Value::Bool(false));
        if let Some(cmd) = cmd.filter(|cmd| !cmd.is_empty()) {
            body.insert("cmd".into(), Value::String(cmd.to_string()));
        }
        body.insert("error".into(), Value::String(code.to_string()));
        Self { body }
    }

    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.body.insert(key.to_string(), value);
        self
    }

    pub fn detail(self, detail: impl Into<String>) -> Self {
        self.with("detail", detail.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.body.get("ok"), Some(Value::Bool(true)))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.body.clone()).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ok_reply_carries_cmd_and_fields() {
        let reply = ControlResponse::ok("ping").with("type", "pong");
        assert!(reply.is_ok());
        assert_eq!(
            reply.into_value(),
            json!({"ok": true, "cmd": "ping", "type": "pong"})
        );
    }

    #[test]
    fn error_reply_without_cmd() {
        let reply = ControlResponse::error(None, "bad_json").detail("EOF while parsing");
        assert_eq!(
            reply.into_value(),
            json!({"ok": false, "error": "bad_json", "detail": "EOF while parsing"})
        );
    }

    #[test]
    fn later_fields_overwrite_earlier_ones() {
        let reply = ControlResponse::ok("x").with("n", 1).with("n", 2);
        assert_eq!(reply.get("n"), Some(&json!(2)));
    }
}
