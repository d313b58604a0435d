//! Wire codec and transports for the agent-link session engine.
//!
//! Provides:
//! - Wire protocol (JSON frames with a `type` discriminator)
//! - WebSocket transport (feature: websocket)
//! - In-memory transport with a scriptable server (feature: memory)

pub mod endpoint;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "memory")]
pub mod memory;

pub use endpoint::normalize_endpoint;
pub use protocol::{
    ClientMessage, CodecError, ControlMessage, ServerMessage, StreamBody, StreamMessage, decode,
    encode,
};

#[cfg(feature = "websocket")]
pub use websocket::WsConnector;

#[cfg(feature = "memory")]
pub use memory::{MemoryConnector, MemoryServer, ServerConnection};
