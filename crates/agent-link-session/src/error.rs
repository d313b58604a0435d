//! Session engine errors.

use agent_link_core::{StorageError, TransportError};
use agent_link_transport::CodecError;
use thiserror::Error;

use crate::connection::StartError;

/// Error returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("A connection is already active")]
    AlreadyActive,

    #[error("Network is unavailable")]
    NetworkUnavailable,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Endpoint cannot change while a connection is active")]
    EndpointLocked,

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<TransportError> for EngineError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::InvalidEndpoint(url) => Self::InvalidEndpoint(url),
            other => Self::Transport(other),
        }
    }
}

impl From<StartError> for EngineError {
    fn from(e: StartError) -> Self {
        match e {
            StartError::AlreadyActive => Self::AlreadyActive,
            StartError::NetworkUnavailable => Self::NetworkUnavailable,
        }
    }
}
