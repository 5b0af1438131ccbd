//! JSON payloads carried inside `Command` envelopes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Command sent by a client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCommand {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl ServerCommand {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.to_string(), value.into());
        self
    }

    pub fn to_json_string(&self) -> String {
        // Serializing a struct of strings and JSON values cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Kind of a server-generated reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyKind {
    Login,
    Message,
    Alert,
    Error,
    Result,
    Log,
    SessionConf,
    SizeLimitWarning,
    Status,
    Reset,
    Catchup,
    ResetRequest,
}

/// Reply sent by the server. Kind-specific fields are flattened next to
/// `type` and `message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerReply {
    #[serde(rename = "type")]
    pub kind: ReplyKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ServerReply {
    pub fn new(kind: ReplyKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            fields: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ReplyKind::Error, message)
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_json_shape() {
        let reply = ServerReply::new(ReplyKind::ResetRequest, "")
            .with("maxSize", 1000)
            .with("query", true);
        let json: Value = serde_json::from_str(&reply.to_json_string()).unwrap();

        assert_eq!(json["type"], "resetrequest");
        assert_eq!(json["maxSize"], 1000);
        assert_eq!(json["query"], true);
        assert!(json.get("message").is_none());
    }

    #[test]
    fn test_command_defaults() {
        let cmd: ServerCommand = serde_json::from_str(r#"{"cmd":"init-complete"}"#).unwrap();
        assert_eq!(cmd.cmd, "init-complete");
        assert!(cmd.args.is_empty());
        assert!(cmd.kwargs.is_empty());
    }
}
