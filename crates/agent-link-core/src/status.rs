//! Connection status and session identity.

use serde::{Deserialize, Serialize};

/// Connection status.
///
/// Only the connection state machine moves between these.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No transport is open.
    #[default]
    Disconnected,
    /// Transport is opening or the handshake is awaiting acknowledgment.
    Connecting,
    /// Server acknowledged the handshake.
    Connected { agent_id: String },
    /// Waiting out a backoff delay before the given attempt.
    Reconnecting { attempt: u32 },
}

impl ConnectionStatus {
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    #[must_use]
    pub const fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

/// Server-assigned identity of the current session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    /// Durable session id. Survives reconnects.
    pub session_id: Option<String>,
    /// Handle to the running agent. Valid only while connected.
    pub agent_id: Option<String>,
    /// Protocol version reported by the server.
    pub protocol_version: Option<u32>,
    /// Model reported by the server.
    pub model: Option<String>,
}

impl SessionIdentity {
    /// Forget the per-connection parts.
    pub fn invalidate_agent(&mut self) {
        self.agent_id = None;
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
