//! In-process transport with a scriptable server side.
//!
//! [`MemoryConnector`] hands every opened connection to a [`MemoryServer`],
//! which plays the remote end. Used by tests and demos to exercise the
//! engine without a network.

use std::sync::{Arc, Mutex};

use agent_link_core::{Connection, Connector, FrameReceiver, FrameSender, TransportError};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::{ClientMessage, ServerMessage};

enum Incoming {
    Frame(String),
    Error(String),
}

#[derive(Default)]
struct Script {
    refuse_next: usize,
    refuse_all: bool,
    opened: usize,
}

/// Client side: opens connections to the paired [`MemoryServer`].
#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<ServerConnection>,
    script: Arc<Mutex<Script>>,
}

impl MemoryConnector {
    /// Create a connector and its server.
    #[must_use]
    pub fn new() -> (Self, MemoryServer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let script = Arc::new(Mutex::new(Script::default()));
        (
            Self {
                accept_tx,
                script: Arc::clone(&script),
            },
            MemoryServer { accept_rx, script },
        )
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, endpoint: &str) -> Result<Connection, TransportError> {
        {
            let mut script = self
                .script
                .lock()
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
            script.opened += 1;
            if script.refuse_all {
                return Err(TransportError::ConnectFailed("connection refused".into()));
            }
            if script.refuse_next > 0 {
                script.refuse_next -= 1;
                return Err(TransportError::ConnectFailed("connection refused".into()));
            }
        }

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        let server_side = ServerConnection {
            endpoint: endpoint.to_string(),
            from_client: client_rx,
            to_client: Some(server_tx),
        };
        self.accept_tx
            .send(server_side)
            .map_err(|_| TransportError::ConnectFailed("server is gone".into()))?;

        Ok(Connection::new(
            MemorySender {
                tx: Some(client_tx),
            },
            MemoryReceiver { rx: server_rx },
        ))
    }
}

struct MemorySender {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameSender for MemorySender {
    async fn send_text(&mut self, frame: String) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<Incoming>,
}

#[async_trait]
impl FrameReceiver for MemoryReceiver {
    async fn next_frame(&mut self) -> Result<Option<String>, TransportError> {
        match self.rx.recv().await {
            Some(Incoming::Frame(frame)) => Ok(Some(frame)),
            Some(Incoming::Error(e)) => Err(TransportError::ReceiveFailed(e)),
            None => Ok(None),
        }
    }
}

/// Server side of a [`MemoryConnector`].
pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<ServerConnection>,
    script: Arc<Mutex<Script>>,
}

impl MemoryServer {
    /// Wait for the next opened connection.
    pub async fn accept(&mut self) -> Option<ServerConnection> {
        self.accept_rx.recv().await
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next(&self, n: usize) {
        if let Ok(mut script) = self.script.lock() {
            script.refuse_next = n;
        }
    }

    /// Refuse (or stop refusing) every connection attempt.
    pub fn refuse_all(&self, refuse: bool) {
        if let Ok(mut script) = self.script.lock() {
            script.refuse_all = refuse;
        }
    }

    /// Number of connection attempts so far, refused ones included.
    #[must_use]
    pub fn open_attempts(&self) -> usize {
        self.script.lock().map(|s| s.opened).unwrap_or_default()
    }
}

/// The server's end of one connection.
pub struct ServerConnection {
    endpoint: String,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: Option<mpsc::UnboundedSender<Incoming>>,
}

impl ServerConnection {
    /// Endpoint the client asked for.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Next raw frame from the client. `None` once the client closed.
    pub async fn recv_frame(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next decoded client message. `None` once the client closed.
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        loop {
            let frame = self.from_client.recv().await?;
            match serde_json::from_str(&frame) {
                Ok(msg) => return Some(msg),
                Err(e) => tracing::warn!("Memory server got invalid client frame: {e}"),
            }
        }
    }

    /// Send a raw text frame. Returns `false` if the client is gone.
    pub fn send_frame(&self, frame: impl Into<String>) -> bool {
        self.to_client
            .as_ref()
            .is_some_and(|tx| tx.send(Incoming::Frame(frame.into())).is_ok())
    }

    /// Send a JSON frame.
    pub fn send_json(&self, value: &Value) -> bool {
        self.send_frame(value.to_string())
    }

    /// Send a typed server message.
    pub fn send(&self, message: &ServerMessage) -> bool {
        match message.to_frame() {
            Ok(frame) => self.send_frame(frame),
            Err(_) => false,
        }
    }

    /// Fail the client's receive side with a transport error.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if let Some(tx) = self.to_client.take() {
            let _ = tx.send(Incoming::Error(reason.into()));
        }
    }

    /// Close the connection from the server side.
    pub fn close(&mut self) {
        self.to_client = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (connector, mut server) = MemoryConnector::new();
        let mut conn = connector.open("ws://memory").await.unwrap();
        let mut remote = server.accept().await.unwrap();
        assert_eq!(remote.endpoint(), "ws://memory");

        conn.sender
            .send_text(r#"{"type":"ping"}"#.into())
            .await
            .unwrap();
        assert_eq!(remote.recv().await, Some(ClientMessage::Ping));

        assert!(remote.send_json(&json!({"type": "pong"})));
        assert_eq!(
            conn.receiver.next_frame().await.unwrap().as_deref(),
            Some(r#"{"type":"pong"}"#)
        );
    }

    #[tokio::test]
    async fn test_close_and_fail() {
        let (connector, mut server) = MemoryConnector::new();
        let mut conn = connector.open("ws://memory").await.unwrap();
        let mut remote = server.accept().await.unwrap();

        remote.close();
        assert!(conn.receiver.next_frame().await.unwrap().is_none());

        let mut conn = connector.open("ws://memory").await.unwrap();
        let mut remote = server.accept().await.unwrap();
        remote.fail("reset by peer");
        assert!(conn.receiver.next_frame().await.is_err());

        conn.sender.close().await;
        assert!(conn.sender.send_text("x".into()).await.is_err());
        assert!(remote.recv_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_refusals() {
        let (connector, server) = MemoryConnector::new();
        server.refuse_next(2);
        assert!(connector.open("ws://memory").await.is_err());
        assert!(connector.open("ws://memory").await.is_err());
        assert!(connector.open("ws://memory").await.is_ok());
        server.refuse_all(true);
        assert!(connector.open("ws://memory").await.is_err());
        assert_eq!(server.open_attempts(), 4);
    }
}
