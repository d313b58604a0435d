//! Payload types shared by the wire protocol and the event stream.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

/// File attached to user input (base64 encoded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub data: String,
}

impl Attachment {
    /// Create an attachment from raw bytes.
    #[must_use]
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, data: &[u8]) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: BASE64.encode(data),
        }
    }

    /// Decode attachment data from base64.
    #[must_use]
    pub fn decode(&self) -> Option<Vec<u8>> {
        BASE64.decode(&self.data).ok()
    }
}

/// Answer to a tool permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionChoice {
    /// Allow this invocation.
    Allow,
    /// Allow this tool for the rest of the session.
    AllowAlways,
    /// Deny this invocation.
    Deny,
}

/// Agent permission mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
}

/// One question inside a question request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub multi_select: bool,
}

/// Summary of a server-side session, from a session list subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

/// Machine-readable error code carried by server error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ConnectionReplaced,
    AgentNotFound,
    SessionNotFound,
    SessionInvalid,
    RateLimited,
    MaxAgentsReached,
    QueueFull,
    CursorInvalid,
    #[serde(other)]
    Unknown,
}

/// Recovery class of an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Session or agent is gone; start fresh.
    SessionValidity,
    /// Server is at capacity or throttling.
    Capacity,
    /// Another client took over this session.
    Superseded,
    /// Replay cursor no longer known to the server.
    CursorStale,
    /// Anything else.
    Other,
}

impl ErrorCode {
    #[must_use]
    pub const fn class(self) -> ErrorClass {
        match self {
            Self::AgentNotFound | Self::SessionNotFound | Self::SessionInvalid => {
                ErrorClass::SessionValidity
            }
            Self::RateLimited | Self::MaxAgentsReached | Self::QueueFull => ErrorClass::Capacity,
            Self::ConnectionReplaced => ErrorClass::Superseded,
            Self::CursorInvalid => ErrorClass::CursorStale,
            Self::Unknown => ErrorClass::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_roundtrip() {
        let original = b"\x89PNG fake";
        let attachment = Attachment::from_bytes("shot.png", "image/png", original);
        assert_eq!(attachment.decode().unwrap(), original);
    }

    #[test]
    fn test_unknown_error_code() {
        let code: ErrorCode = serde_json::from_str("\"teapot\"").unwrap();
        assert_eq!(code, ErrorCode::Unknown);
        assert_eq!(code.class(), ErrorClass::Other);
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            ErrorCode::SessionNotFound.class(),
            ErrorClass::SessionValidity
        );
        assert_eq!(ErrorCode::QueueFull.class(), ErrorClass::Capacity);
        assert_eq!(
            ErrorCode::ConnectionReplaced.class(),
            ErrorClass::Superseded
        );
    }
}
