//! Core abstractions for the agent-link session engine.
//!
//! This crate provides the fundamental building blocks:
//! - `MessageId` / `Epoch` - Message identity and connection generations
//! - `ConnectionStatus` / `SessionIdentity` - Connection and session state
//! - `StreamEvent` - The ordered event stream handed to consumers
//! - `DedupWindow` - Bounded replay filter
//! - `EngineConfig` - Engine configuration
//! - Cursor storage and transport traits

pub mod agent_state;
pub mod config;
pub mod dedup;
pub mod event;
pub mod ids;
pub mod payload;
pub mod status;
pub mod traits;

pub use agent_state::{AgentState, AgentStateTracker, StateChange};
pub use config::{ConfigError, EngineConfig, ReconnectConfig};
pub use dedup::DedupWindow;
pub use event::StreamEvent;
pub use ids::{Epoch, MessageId};
pub use payload::{
    Attachment, ErrorClass, ErrorCode, PermissionChoice, PermissionMode, Question,
    SessionSummary,
};
pub use status::{ConnectionStatus, SessionIdentity};
pub use traits::{
    Connection, Connector, CursorStore, FrameReceiver, FrameSender, StorageError, TransportError,
};
