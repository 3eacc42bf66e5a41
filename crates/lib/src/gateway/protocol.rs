//! Gateway WebSocket frame types and close codes.
//!
//! The protocol is intentionally strict: one inbound frame type
//! (`message`), no partial or streaming frames. Every outbound frame
//! carries an RFC 3339 UTC timestamp.

use serde::{Deserialize, Serialize};

/// Generic auth/protocol error close code.
pub const CLOSE_AUTH_ERROR: u16 = 4001;
/// Rate limit exceeded close code.
pub const CLOSE_RATE_LIMITED: u16 = 4002;

/// Inbound frame: `{type: "message", content, id?}`. Any other `type` is a
/// protocol violation.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

/// `{type: "user_info"}`, sent once after bind.
#[derive(Debug, Clone, Serialize)]
pub struct UserInfoFrame {
    #[serde(rename = "type")]
    pub typ: &'static str,
    pub username: String,
    pub timestamp: String,
}

impl UserInfoFrame {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            typ: "user_info",
            username: username.into(),
            timestamp: now_timestamp(),
        }
    }
}

/// `{type: "message"}`, replies and externally pushed messages.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFrame {
    #[serde(rename = "type")]
    pub typ: &'static str,
    pub id: String,
    pub content: String,
    pub is_user: bool,
    pub timestamp: String,
}

impl MessageFrame {
    pub fn new(id: impl Into<String>, content: impl Into<String>, is_user: bool) -> Self {
        Self {
            typ: "message",
            id: id.into(),
            content: content.into(),
            is_user,
            timestamp: now_timestamp(),
        }
    }
}

/// `{type: "token_refresh_required"}`, an advisory; non-terminal.
#[derive(Debug, Clone, Serialize)]
pub struct TokenRefreshFrame {
    #[serde(rename = "type")]
    pub typ: &'static str,
    pub message: &'static str,
    pub timestamp: String,
}

impl TokenRefreshFrame {
    pub fn new() -> Self {
        Self {
            typ: "token_refresh_required",
            message: "Your session is about to expire. Please refresh your token.",
            timestamp: now_timestamp(),
        }
    }
}

impl Default for TokenRefreshFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// `{type: "error"}`, sent immediately before close whenever possible.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    pub typ: &'static str,
    pub code: u16,
    pub message: String,
    pub timestamp: String,
}

impl ErrorFrame {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            typ: "error",
            code,
            message: message.into(),
            timestamp: now_timestamp(),
        }
    }
}

fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_frame_parses_with_optional_fields() {
        let f: InboundFrame =
            serde_json::from_str(r#"{"type":"message","content":"hello"}"#).unwrap();
        assert_eq!(f.typ, "message");
        assert_eq!(f.content.as_deref(), Some("hello"));
        assert!(f.id.is_none());
    }

    #[test]
    fn inbound_frame_requires_type() {
        assert!(serde_json::from_str::<InboundFrame>(r#"{"content":"x"}"#).is_err());
    }

    #[test]
    fn message_frame_wire_shape() {
        let v = serde_json::to_value(MessageFrame::new("m1", "hi", false)).unwrap();
        assert_eq!(v["type"], "message");
        assert_eq!(v["isUser"], false);
        assert!(v["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn error_frame_wire_shape() {
        let v = serde_json::to_value(ErrorFrame::new(CLOSE_AUTH_ERROR, "nope")).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["code"], 4001);
        assert_eq!(v["message"], "nope");
    }

    #[test]
    fn user_info_frame_wire_shape() {
        let v = serde_json::to_value(UserInfoFrame::new("ada")).unwrap();
        assert_eq!(v["type"], "user_info");
        assert_eq!(v["username"], "ada");
    }
}
