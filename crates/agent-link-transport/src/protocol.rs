//! Wire protocol for client-server communication.
//!
//! Frames are JSON objects with a `type` discriminator. Inbound frames that
//! carry an `id` are stream messages subject to deduplication; all others are
//! control messages.

use std::collections::BTreeMap;

use agent_link_core::{
    AgentState, Attachment, ErrorCode, MessageId, PermissionChoice, PermissionMode, Question,
    SessionSummary,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Highest protocol version this client understands.
pub const SUPPORTED_PROTOCOL_VERSION: u32 = 2;

/// Codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Frame is not a JSON object")]
    NotObject,
    #[error("Frame has no type discriminator")]
    MissingType,
}

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake. Sent first on every connection.
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        helper: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_message_id: Option<MessageId>,
    },
    /// User input.
    Input {
        client_message_id: String,
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<PermissionMode>,
    },
    /// Interrupt the current turn.
    Interrupt,
    /// Stop the agent.
    Stop,
    /// Answer a permission request.
    PermissionResponse {
        request_id: String,
        choice: PermissionChoice,
    },
    /// Answer a question request (question id -> answer).
    QuestionResponse {
        request_id: String,
        answers: BTreeMap<String, String>,
    },
    /// Switch model.
    SetModel { model: String },
    /// Switch permission mode.
    SetPermissionMode { mode: PermissionMode },
    /// Retry the turn that produced a message.
    Retry { message_id: MessageId },
    /// Ping for keepalive.
    Ping,
    /// Subscribe to the server's session list.
    SubscribeSessions,
}

impl ClientMessage {
    /// Create an input message with a fresh client message id.
    #[must_use]
    pub fn input(
        text: impl Into<String>,
        attachments: Vec<Attachment>,
        mode: Option<PermissionMode>,
    ) -> Self {
        Self::Input {
            client_message_id: Uuid::new_v4().to_string(),
            text: text.into(),
            attachments,
            mode,
        }
    }

    /// Wire name of the message type.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Input { .. } => "input",
            Self::Interrupt => "interrupt",
            Self::Stop => "stop",
            Self::PermissionResponse { .. } => "permission_response",
            Self::QuestionResponse { .. } => "question_response",
            Self::SetModel { .. } => "set_model",
            Self::SetPermissionMode { .. } => "set_permission_mode",
            Self::Retry { .. } => "retry",
            Self::Ping => "ping",
            Self::SubscribeSessions => "subscribe_sessions",
        }
    }
}

/// Control message from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Handshake acknowledged.
    Connected {
        agent_id: String,
        session_id: String,
        #[serde(default)]
        model: Option<String>,
        protocol_version: u32,
    },
    /// Error report.
    Error {
        code: ErrorCode,
        #[serde(default)]
        message: String,
        #[serde(default)]
        retry_after_ms: Option<u64>,
    },
    /// Pong response.
    Pong,
    /// Batch of past stream messages (raw, decoded one by one).
    History {
        messages: Vec<Value>,
        #[serde(default)]
        has_more: bool,
    },
    /// Session list.
    Sessions { sessions: Vec<SessionSummary> },
}

/// Stream message from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub id: MessageId,
    /// Set by the server when re-sending from a resume cursor.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replay: bool,
    #[serde(flatten)]
    pub body: StreamBody,
}

/// Content of a stream message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamBody {
    TextDelta {
        text: String,
    },
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolStart {
        tool_use_id: String,
        tool_name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        output: String,
        #[serde(default)]
        is_error: bool,
    },
    Progress {
        message: String,
        #[serde(default)]
        percent: Option<f32>,
    },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        #[serde(default)]
        cost_usd: Option<f64>,
    },
    AgentState {
        state: AgentState,
        #[serde(default)]
        tool_name: Option<String>,
    },
    PermissionRequest {
        request_id: String,
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        description: Option<String>,
    },
    QuestionRequest {
        request_id: String,
        questions: Vec<Question>,
    },
    SubagentStart {
        subagent_id: String,
        #[serde(default)]
        description: String,
    },
    SubagentComplete {
        subagent_id: String,
        #[serde(default)]
        summary: Option<String>,
    },
    SessionEvent {
        name: String,
        #[serde(default)]
        data: Value,
    },
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Control(ControlMessage),
    Stream(StreamMessage),
}

impl ServerMessage {
    /// Decode an already-parsed frame.
    ///
    /// # Errors
    /// Returns error if the value is not a known message.
    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        let object = value.as_object().ok_or(CodecError::NotObject)?;
        if !object.get("type").is_some_and(Value::is_string) {
            return Err(CodecError::MissingType);
        }
        if object.contains_key("id") {
            Ok(Self::Stream(serde_json::from_value(value)?))
        } else {
            Ok(Self::Control(serde_json::from_value(value)?))
        }
    }

    /// Encode back to a frame (used by test servers and tooling).
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_frame(&self) -> Result<String, CodecError> {
        let text = match self {
            Self::Control(m) => serde_json::to_string(m)?,
            Self::Stream(m) => serde_json::to_string(m)?,
        };
        Ok(text)
    }
}

/// Encode a client command into a text frame.
///
/// # Errors
/// Returns error if serialization fails, which does not happen for values
/// built through the public constructors.
pub fn encode(message: &ClientMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a text frame.
///
/// # Errors
/// Returns error on malformed JSON or unknown message types.
pub fn decode(frame: &str) -> Result<ServerMessage, CodecError> {
    let value: Value = serde_json::from_str(frame)?;
    ServerMessage::from_value(value)
}

/// Decode the entries of a history batch, dropping malformed ones.
#[must_use]
pub fn decode_history(messages: Vec<Value>) -> Vec<StreamMessage> {
    messages
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<StreamMessage>(value) {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!("Dropping malformed history entry: {e}");
                None
            }
        })
        .collect()
}
