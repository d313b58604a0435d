//! Recovery behaviour per server error class.

mod common;

use std::time::Duration;

use agent_link_core::{
    ConnectionStatus, CursorStore, EngineConfig, ErrorCode, MessageId, StreamEvent,
};
use agent_link_session::storage::MemoryCursorStore;
use agent_link_transport::ClientMessage;
use common::{
    ENDPOINT, accept, connect_and_ack, connected, error, harness, harness_with, next_event, text,
    text_id, until,
};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn test_session_not_found_clears_identity() {
    let store = MemoryCursorStore::new().with_cursor("s1", "m42");
    let mut h = harness_with(store, EngineConfig::default());

    h.engine
        .connect(ENDPOINT, Some("s1".into()), None)
        .await
        .unwrap();
    let (conn, _) = accept(&mut h.server).await;
    assert!(conn.send_json(&error("session_not_found")));

    assert_eq!(
        next_event(&mut h.events).await,
        StreamEvent::StatusChanged {
            status: ConnectionStatus::Connecting
        }
    );
    assert_eq!(
        next_event(&mut h.events).await,
        StreamEvent::StatusChanged {
            status: ConnectionStatus::Disconnected
        }
    );
    assert_eq!(
        next_event(&mut h.events).await,
        StreamEvent::ConnectionError {
            code: ErrorCode::SessionNotFound,
            message: "session_not_found happened".into(),
        }
    );

    assert!(h.engine.session_id().await.is_none());
    assert!(h.engine.cursor().await.is_none());
    assert!(h.store.load("s1").await.unwrap().is_none());

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.server.open_attempts(), 1);
    assert!(!h.engine.reconnect_now().await);

    h.engine.connect(ENDPOINT, None, None).await.unwrap();
    let (_conn, start) = accept(&mut h.server).await;
    assert!(matches!(
        start,
        ClientMessage::Start {
            session_id: None,
            last_message_id: None,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_connection_replaced_suppresses_reconnect() {
    let mut h = harness();
    let conn = connect_and_ack(&mut h, None, "s1").await;
    assert!(conn.send_json(&error("connection_replaced")));

    until(&mut h.events, |e| matches!(e, StreamEvent::ConnectionReplaced)).await;
    assert_eq!(h.engine.status().await, ConnectionStatus::Disconnected);
    assert_eq!(h.engine.session_id().await.as_deref(), Some("s1"));

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.server.open_attempts(), 1);
    assert!(!h.engine.reconnect_now().await);

    h.engine
        .connect(ENDPOINT, Some("s1".into()), None)
        .await
        .unwrap();
    assert_eq!(h.server.open_attempts(), 2);
}

#[tokio::test]
async fn test_cursor_invalid_resets_cursor() {
    let mut h = harness();
    let conn = connect_and_ack(&mut h, None, "s1").await;
    assert!(conn.send_json(&text("m5")));
    until(&mut h.events, |e| text_id(e) == Some("m5")).await;

    assert!(conn.send_json(&error("cursor_invalid")));
    assert_eq!(
        until(&mut h.events, |e| matches!(e, StreamEvent::CursorInvalid { .. })).await,
        StreamEvent::CursorInvalid {
            session_id: Some("s1".into()),
            cursor: Some(MessageId::new("m5")),
        }
    );
    assert!(h.engine.cursor().await.is_none());
    assert!(h.store.load("s1").await.unwrap().is_none());
    assert!(h.engine.status().await.is_connected());

    // Window still drops what was already delivered.
    assert!(conn.send_json(&text("m5")));
    assert!(conn.send_json(&text("m6")));
    assert_eq!(text_id(&next_event(&mut h.events).await), Some("m6"));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_handshake_retries_after_delay() {
    let mut h = harness();
    h.engine.connect(ENDPOINT, None, None).await.unwrap();
    let (conn, _) = accept(&mut h.server).await;
    let refused_at = tokio::time::Instant::now();
    assert!(conn.send_json(&json!({
        "type": "error",
        "code": "rate_limited",
        "message": "slow down",
        "retry_after_ms": 3000,
    })));

    assert_eq!(
        until(&mut h.events, |e| matches!(e, StreamEvent::CapacityError { .. })).await,
        StreamEvent::CapacityError {
            code: ErrorCode::RateLimited,
            message: "slow down".into(),
            retry_after_ms: Some(3000),
        }
    );
    assert_eq!(
        h.engine.status().await,
        ConnectionStatus::Reconnecting { attempt: 1 }
    );
    assert!(h.engine.has_pending_reconnect().await);

    let (conn, _) = accept(&mut h.server).await;
    assert!(refused_at.elapsed() >= Duration::from_secs(3));
    assert_eq!(h.server.open_attempts(), 2);
    assert!(conn.send_json(&connected("s1", "agent-1")));
    until(&mut h.events, |e| matches!(e, StreamEvent::Connected { .. })).await;
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_command_is_resent_once() {
    let mut h = harness();
    let mut conn = connect_and_ack(&mut h, None, "s1").await;

    h.engine.send_input("hello", Vec::new(), None).await.unwrap();
    let first = conn.recv().await.unwrap();
    assert!(matches!(first, ClientMessage::Input { ref text, .. } if text == "hello"));

    assert!(conn.send_json(&json!({
        "type": "error",
        "code": "rate_limited",
        "message": "slow down",
        "retry_after_ms": 500,
    })));
    until(&mut h.events, |e| matches!(e, StreamEvent::CapacityError { .. })).await;

    assert_eq!(conn.recv().await.unwrap(), first);

    assert!(conn.send_json(&json!({
        "type": "error",
        "code": "rate_limited",
        "message": "still slow",
        "retry_after_ms": 500,
    })));
    until(&mut h.events, |e| matches!(e, StreamEvent::CapacityError { .. })).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    h.engine.interrupt().await.unwrap();
    assert_eq!(conn.recv().await.unwrap(), ClientMessage::Interrupt);
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_drops_scheduled_resend() {
    let mut h = harness();
    let mut conn = connect_and_ack(&mut h, None, "s1").await;
    h.engine.send_input("hello", Vec::new(), None).await.unwrap();
    conn.recv().await.unwrap();

    assert!(conn.send_json(&json!({
        "type": "error",
        "code": "rate_limited",
        "message": "slow down",
        "retry_after_ms": 30_000,
    })));
    until(&mut h.events, |e| matches!(e, StreamEvent::CapacityError { .. })).await;

    h.engine.set_low_power(true).await;
    conn.close();
    until(&mut h.events, |e| {
        matches!(
            e,
            StreamEvent::StatusChanged {
                status: ConnectionStatus::Disconnected
            }
        )
    })
    .await;
    assert!(!h.engine.has_pending_reconnect().await);

    h.engine
        .connect(ENDPOINT, Some("s1".into()), None)
        .await
        .unwrap();
    let (mut conn, _) = accept(&mut h.server).await;
    assert!(conn.send_json(&connected("s1", "agent-1")));
    until(&mut h.events, |e| matches!(e, StreamEvent::Connected { .. })).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    h.engine.interrupt().await.unwrap();
    assert_eq!(conn.recv().await.unwrap(), ClientMessage::Interrupt);
}

#[tokio::test(start_paused = true)]
async fn test_max_agents_during_handshake_waits_for_trigger() {
    let mut h = harness();
    h.engine
        .connect(ENDPOINT, Some("s1".into()), None)
        .await
        .unwrap();
    let (conn, _) = accept(&mut h.server).await;
    assert!(conn.send_json(&error("max_agents_reached")));

    until(&mut h.events, |e| matches!(e, StreamEvent::CapacityError { .. })).await;
    assert_eq!(h.engine.status().await, ConnectionStatus::Disconnected);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.server.open_attempts(), 1);

    assert!(h.engine.reconnect_now().await);
    let (conn, _) = accept(&mut h.server).await;
    assert!(conn.send_json(&connected("s1", "agent-1")));
    until(&mut h.events, |e| matches!(e, StreamEvent::Reconnected { .. })).await;
}

#[tokio::test]
async fn test_unknown_error_is_surfaced() {
    let mut h = harness();
    let conn = connect_and_ack(&mut h, None, "s1").await;
    assert!(conn.send_json(&error("disk_on_fire")));
    assert_eq!(
        until(&mut h.events, |e| matches!(e, StreamEvent::Error { .. })).await,
        StreamEvent::Error {
            code: ErrorCode::Unknown,
            message: "disk_on_fire happened".into(),
        }
    );
    assert!(h.engine.status().await.is_connected());
}
