//! The ordered event stream delivered to consumers.

use serde::Serialize;
use serde_json::Value;

use crate::{
    ConnectionStatus, MessageId,
    agent_state::StateChange,
    payload::{ErrorCode, Question, SessionSummary},
};

/// Event emitted by the session engine.
///
/// Stream variants carry the id of the server message they were built from.
/// Each id produces at most one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Partial assistant text.
    TextDelta { id: MessageId, text: String },
    /// Final assistant text for a turn.
    Text { id: MessageId, text: String },
    /// Model reasoning.
    Thinking { id: MessageId, text: String },
    /// Tool invocation started.
    ToolStart {
        id: MessageId,
        tool_use_id: String,
        tool_name: String,
        input: Value,
    },
    /// Tool invocation finished.
    ToolResult {
        id: MessageId,
        tool_use_id: String,
        output: String,
        is_error: bool,
    },
    /// Free-form progress report.
    Progress {
        id: MessageId,
        message: String,
        percent: Option<f32>,
    },
    /// Token usage for the turn so far.
    Usage {
        id: MessageId,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: Option<f64>,
    },
    /// Agent state transition (already reduced).
    StateChanged { id: MessageId, change: StateChange },
    /// Agent asks permission to run a tool.
    PermissionRequest {
        id: MessageId,
        request_id: String,
        tool_name: String,
        input: Value,
        description: Option<String>,
    },
    /// Agent asks the user questions.
    QuestionRequest {
        id: MessageId,
        request_id: String,
        questions: Vec<Question>,
    },
    SubagentStart {
        id: MessageId,
        subagent_id: String,
        description: String,
    },
    SubagentComplete {
        id: MessageId,
        subagent_id: String,
        summary: Option<String>,
    },
    /// Session-level notification (rename, compaction, ...).
    SessionEvent {
        id: MessageId,
        name: String,
        data: Value,
    },
    /// Accepted events of one history frame, in order.
    HistoryBatch {
        events: Vec<StreamEvent>,
        has_more: bool,
    },
    /// Sessions known to the server.
    SessionList { sessions: Vec<SessionSummary> },

    /// Handshake acknowledged.
    Connected {
        session_id: String,
        agent_id: String,
        model: Option<String>,
        protocol_version: u32,
    },
    /// Connection status transition.
    StatusChanged { status: ConnectionStatus },
    /// A reconnect attempt is scheduled.
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// A reconnect episode ended with an acknowledged connection.
    Reconnected { session_id: String },
    /// Automatic reconnection gave up.
    ReconnectFailed { attempts: u32 },
    /// Another client took over this session.
    ConnectionReplaced,
    /// Host connectivity changed.
    NetworkStatusChanged { available: bool },
    /// The server no longer knows the replay cursor; fetch full history.
    CursorInvalid {
        session_id: Option<String>,
        cursor: Option<MessageId>,
    },
    /// Session or agent is gone. Local identity has been cleared.
    ConnectionError { code: ErrorCode, message: String },
    /// Server is throttling or full.
    CapacityError {
        code: ErrorCode,
        message: String,
        retry_after_ms: Option<u64>,
    },
    /// Any other server error.
    Error { code: ErrorCode, message: String },
}

impl StreamEvent {
    /// Id of the server message this event came from.
    #[must_use]
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::TextDelta { id, .. }
            | Self::Text { id, .. }
            | Self::Thinking { id, .. }
            | Self::ToolStart { id, .. }
            | Self::ToolResult { id, .. }
            | Self::Progress { id, .. }
            | Self::Usage { id, .. }
            | Self::StateChanged { id, .. }
            | Self::PermissionRequest { id, .. }
            | Self::QuestionRequest { id, .. }
            | Self::SubagentStart { id, .. }
            | Self::SubagentComplete { id, .. }
            | Self::SessionEvent { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Connection lifecycle notifications.
    #[must_use]
    pub const fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::Connected { .. }
                | Self::StatusChanged { .. }
                | Self::Reconnecting { .. }
                | Self::Reconnected { .. }
                | Self::ReconnectFailed { .. }
                | Self::ConnectionReplaced
                | Self::NetworkStatusChanged { .. }
        )
    }
}
