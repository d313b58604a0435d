//! Per-session state guarded by the engine lock.

use std::collections::HashSet;

use agent_link_core::{
    AgentStateTracker, ConnectionStatus, DedupWindow, EngineConfig, MessageId, SessionIdentity,
    StreamEvent,
};
use agent_link_transport::{ClientMessage, StreamBody, StreamMessage};

use crate::{backoff::Backoff, connection::ConnectionMachine};

/// Result of offering a stream message id to the replay filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Duplicate,
    Accepted { advanced: bool },
}

pub struct EngineState {
    pub machine: ConnectionMachine,
    pub identity: SessionIdentity,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub cursor: Option<MessageId>,
    /// Cursor offered in the current connection's handshake. Anything at or
    /// below it is a replay of what an earlier run already handled.
    pub replay_floor: Option<MessageId>,
    pub dedup: DedupWindow,
    pub agent: AgentStateTracker,
    pub permissions: HashSet<String>,
    pub questions: HashSet<String>,
    pub last_command: Option<ClientMessage>,
}

impl EngineState {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            machine: ConnectionMachine::new(Backoff::new(config.reconnect.clone())),
            identity: SessionIdentity::default(),
            endpoint: None,
            model: config.default_model.clone(),
            cursor: None,
            replay_floor: None,
            dedup: DedupWindow::new(config.dedup_capacity),
            agent: AgentStateTracker::new(),
            permissions: HashSet::new(),
            questions: HashSet::new(),
            last_command: None,
        }
    }

    /// Forget everything tied to the current session's message history.
    pub fn reset_session_scope(&mut self) {
        self.cursor = None;
        self.replay_floor = None;
        self.dedup.clear();
        self.agent.reset();
        self.permissions.clear();
        self.questions.clear();
        self.last_command = None;
    }

    /// Offer a message id to the replay filter.
    ///
    /// Ids already in the dedup window are dropped, as is anything at or
    /// below the resume cursor of this connection. Frames flagged as replay
    /// are also held to the current cursor. The cursor only ever moves
    /// forward.
    pub fn admit(&mut self, id: &MessageId, replay: bool) -> Admission {
        if self.dedup.contains(id) {
            return Admission::Duplicate;
        }
        if self.replay_floor.as_ref().is_some_and(|floor| id <= floor) {
            return Admission::Duplicate;
        }
        if replay && self.cursor.as_ref().is_some_and(|cursor| id <= cursor) {
            return Admission::Duplicate;
        }
        self.dedup.insert(id.clone());
        let advanced = self.cursor.as_ref().is_none_or(|cursor| id > cursor);
        if advanced {
            self.cursor = Some(id.clone());
        }
        Admission::Accepted { advanced }
    }

    /// Turn an accepted stream message into its event, updating the agent
    /// state reducer and the pending request sets on the way.
    pub fn build_event(&mut self, message: StreamMessage) -> Option<StreamEvent> {
        let StreamMessage { id, body, .. } = message;
        let event = match body {
            StreamBody::TextDelta { text } => StreamEvent::TextDelta { id, text },
            StreamBody::Text { text } => StreamEvent::Text { id, text },
            StreamBody::Thinking { text } => StreamEvent::Thinking { id, text },
            StreamBody::ToolStart {
                tool_use_id,
                tool_name,
                input,
            } => StreamEvent::ToolStart {
                id,
                tool_use_id,
                tool_name,
                input,
            },
            StreamBody::ToolResult {
                tool_use_id,
                output,
                is_error,
            } => StreamEvent::ToolResult {
                id,
                tool_use_id,
                output,
                is_error,
            },
            StreamBody::Progress { message, percent } => StreamEvent::Progress {
                id,
                message,
                percent,
            },
            StreamBody::Usage {
                input_tokens,
                output_tokens,
                cost_usd,
            } => StreamEvent::Usage {
                id,
                input_tokens,
                output_tokens,
                cost_usd,
            },
            StreamBody::AgentState { state, tool_name } => {
                let change = self.agent.apply(state, tool_name)?;
                StreamEvent::StateChanged { id, change }
            }
            StreamBody::PermissionRequest {
                request_id,
                tool_name,
                input,
                description,
            } => {
                self.permissions.insert(request_id.clone());
                StreamEvent::PermissionRequest {
                    id,
                    request_id,
                    tool_name,
                    input,
                    description,
                }
            }
            StreamBody::QuestionRequest {
                request_id,
                questions,
            } => {
                self.questions.insert(request_id.clone());
                StreamEvent::QuestionRequest {
                    id,
                    request_id,
                    questions,
                }
            }
            StreamBody::SubagentStart {
                subagent_id,
                description,
            } => StreamEvent::SubagentStart {
                id,
                subagent_id,
                description,
            },
            StreamBody::SubagentComplete {
                subagent_id,
                summary,
            } => StreamEvent::SubagentComplete {
                id,
                subagent_id,
                summary,
            },
            StreamBody::SessionEvent { name, data } => StreamEvent::SessionEvent { id, name, data },
        };
        Some(event)
    }

    /// Handshake for the next connection. The cursor is only offered when
    /// resuming a known session, and becomes that connection's replay floor.
    pub fn handshake(&mut self, helper: bool) -> ClientMessage {
        let resume = self
            .identity
            .session_id
            .as_ref()
            .and(self.cursor.clone());
        self.replay_floor.clone_from(&resume);
        ClientMessage::Start {
            session_id: self.identity.session_id.clone(),
            model: self.model.clone(),
            helper,
            last_message_id: resume,
        }
    }

    /// Whether an external trigger may start a recovery attempt.
    pub fn can_recover(&self) -> bool {
        matches!(
            self.machine.status(),
            ConnectionStatus::Disconnected | ConnectionStatus::Reconnecting { .. }
        ) && self.identity.session_id.is_some()
            && self.endpoint.is_some()
            && !self.machine.is_manual()
            && self.machine.network_available()
    }
}
