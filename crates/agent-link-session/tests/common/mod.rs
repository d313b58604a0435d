//! Shared harness for engine integration tests.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use agent_link_core::{EngineConfig, StreamEvent};
use agent_link_session::{EventStream, SessionEngine, storage::MemoryCursorStore};
use agent_link_transport::{ClientMessage, MemoryConnector, MemoryServer, ServerConnection};
use serde_json::{Value, json};
use tokio_stream::StreamExt;

pub const ENDPOINT: &str = "ws://agents.test/ws";

pub type Engine = SessionEngine<MemoryConnector, Arc<MemoryCursorStore>>;

pub struct Harness {
    pub engine: Engine,
    pub events: EventStream,
    pub server: MemoryServer,
    pub store: Arc<MemoryCursorStore>,
}

pub fn harness() -> Harness {
    harness_with(MemoryCursorStore::new(), EngineConfig::default())
}

pub fn harness_with(store: MemoryCursorStore, config: EngineConfig) -> Harness {
    let (connector, server) = MemoryConnector::new();
    let store = Arc::new(store);
    let (engine, events) = SessionEngine::new(connector, Arc::clone(&store), config);
    Harness {
        engine,
        events,
        server,
        store,
    }
}

/// Next event, failing the test if none arrives.
pub async fn next_event(events: &mut EventStream) -> StreamEvent {
    tokio::time::timeout(Duration::from_secs(120), events.next())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

/// Skip events until one matches.
pub async fn until(
    events: &mut EventStream,
    mut pred: impl FnMut(&StreamEvent) -> bool,
) -> StreamEvent {
    loop {
        let event = next_event(events).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Accept the next connection and return it with its handshake.
pub async fn accept(server: &mut MemoryServer) -> (ServerConnection, ClientMessage) {
    let mut conn = tokio::time::timeout(Duration::from_secs(120), server.accept())
        .await
        .expect("timed out waiting for connection")
        .expect("connector dropped");
    let start = conn.recv().await.expect("no handshake");
    assert!(matches!(start, ClientMessage::Start { .. }), "{start:?}");
    (conn, start)
}

pub fn connected(session_id: &str, agent_id: &str) -> Value {
    json!({
        "type": "connected",
        "agent_id": agent_id,
        "session_id": session_id,
        "model": "sonnet",
        "protocol_version": 2,
    })
}

pub fn text(id: &str) -> Value {
    json!({"type": "text", "id": id, "text": format!("text {id}")})
}

pub fn replayed_text(id: &str) -> Value {
    json!({"type": "text", "id": id, "replay": true, "text": format!("text {id}")})
}

pub fn error(code: &str) -> Value {
    json!({"type": "error", "code": code, "message": format!("{code} happened")})
}

/// Connect, accept and acknowledge. Leaves the event stream positioned
/// after the `Connected` event.
pub async fn connect_and_ack(
    h: &mut Harness,
    session_id: Option<&str>,
    assigned: &str,
) -> ServerConnection {
    h.engine
        .connect(ENDPOINT, session_id.map(String::from), None)
        .await
        .expect("connect failed");
    let (conn, _start) = accept(&mut h.server).await;
    assert!(conn.send_json(&connected(assigned, "agent-1")));
    until(&mut h.events, |e| matches!(e, StreamEvent::Connected { .. })).await;
    conn
}

/// Text ids of stream events.
pub fn text_id(event: &StreamEvent) -> Option<&str> {
    match event {
        StreamEvent::Text { id, .. } => Some(id.as_str()),
        _ => None,
    }
}
