//! Resilient session engine for remote agent servers.
//!
//! Provides:
//! - `SessionEngine` - Connect, resume and reconnect one agent session
//! - `LifecycleBridge` - Map host lifecycle signals to engine calls
//! - Cursor stores (memory, file)

pub mod backoff;
mod connection;
pub mod engine;
pub mod error;
pub mod lifecycle;
mod state;
pub mod storage;

pub use backoff::Backoff;
pub use engine::{EventStream, SessionEngine};
pub use error::EngineError;
pub use lifecycle::{LifecycleBridge, LifecycleSignal};
