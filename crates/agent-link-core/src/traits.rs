//! Core traits for cursor persistence and transport.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::MessageId;

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt cursor record: {0}")]
    Corrupt(String),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Durable per-session replay cursor.
#[async_trait]
pub trait CursorStore: Send + Sync + 'static {
    /// Load the last accepted message id of a session.
    async fn load(&self, session_id: &str) -> Result<Option<MessageId>, StorageError>;

    /// Persist the last accepted message id of a session.
    async fn save(&self, session_id: &str, cursor: &MessageId) -> Result<(), StorageError>;

    /// Forget a session's cursor.
    async fn clear(&self, session_id: &str) -> Result<(), StorageError>;
}

#[async_trait]
impl<T: CursorStore + ?Sized> CursorStore for Arc<T> {
    async fn load(&self, session_id: &str) -> Result<Option<MessageId>, StorageError> {
        (**self).load(session_id).await
    }

    async fn save(&self, session_id: &str, cursor: &MessageId) -> Result<(), StorageError> {
        (**self).save(session_id, cursor).await
    }

    async fn clear(&self, session_id: &str) -> Result<(), StorageError> {
        (**self).clear(session_id).await
    }
}

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Connection closed")]
    Closed,
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// Write half of a duplex text-frame connection.
#[async_trait]
pub trait FrameSender: Send + 'static {
    /// Send one text frame.
    async fn send_text(&mut self, frame: String) -> Result<(), TransportError>;

    /// Close the connection. Best effort.
    async fn close(&mut self);
}

/// Read half of a duplex text-frame connection.
#[async_trait]
pub trait FrameReceiver: Send + 'static {
    /// Next text frame. `Ok(None)` means the peer closed the connection.
    async fn next_frame(&mut self) -> Result<Option<String>, TransportError>;
}

/// An open connection, split into halves.
pub struct Connection {
    pub sender: Box<dyn FrameSender>,
    pub receiver: Box<dyn FrameReceiver>,
}

impl Connection {
    #[must_use]
    pub fn new(sender: impl FrameSender, receiver: impl FrameReceiver) -> Self {
        Self {
            sender: Box::new(sender),
            receiver: Box::new(receiver),
        }
    }
}

/// Opens connections to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new connection.
    async fn open(&self, endpoint: &str) -> Result<Connection, TransportError>;
}
