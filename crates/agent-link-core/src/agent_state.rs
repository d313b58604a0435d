//! Agent state reducer.
//!
//! The server reports agent state on every transition, and replays or
//! redundant updates are common. [`AgentStateTracker`] reduces them so that
//! consumers only see actual changes of the (state, tool) pair.

use serde::{Deserialize, Serialize};

/// Agent activity as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Thinking,
    Executing,
    WaitingPermission,
    WaitingQuestion,
    Recovering,
    Stopped,
}

/// A state transition worth reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub previous: Option<AgentState>,
    pub state: AgentState,
    pub tool_name: Option<String>,
}

/// Last known agent state.
#[derive(Debug, Clone, Default)]
pub struct AgentStateTracker {
    last: Option<(AgentState, Option<String>)>,
}

impl AgentStateTracker {
    #[must_use]
    pub const fn new() -> Self {
        Self { last: None }
    }

    /// Apply a reported state.
    ///
    /// Returns `None` when the (state, tool) pair equals the previous one.
    pub fn apply(&mut self, state: AgentState, tool_name: Option<String>) -> Option<StateChange> {
        if let Some((last_state, last_tool)) = &self.last {
            if *last_state == state && *last_tool == tool_name {
                return None;
            }
        }
        let previous = self.last.as_ref().map(|(s, _)| *s);
        self.last = Some((state, tool_name.clone()));
        Some(StateChange {
            previous,
            state,
            tool_name,
        })
    }

    /// Current state, if any has been reported.
    #[must_use]
    pub fn current(&self) -> Option<AgentState> {
        self.last.as_ref().map(|(s, _)| *s)
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
