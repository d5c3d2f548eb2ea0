#![allow(clippy::unwrap_used)]
// StreamConnection lifecycle tests against the in-memory connector.
//
// All tests run on a paused clock, so backoff and timeouts resolve
// instantly and elapsed time is deterministic.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::Instant;
use url::Url;

use blocksync_api::stream::{
    ConnectPlan, ConnectionState, Frame, HEARTBEAT_FRAME, InboundEnvelope, MemoryConnector,
    Payload, ReconnectConfig, StreamConfig, StreamConnection, StreamEvent,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn endpoint() -> Url {
    Url::parse("wss://node.test/stream").unwrap()
}

/// Heartbeat and idle detection off.
fn quiet() -> StreamConfig {
    StreamConfig {
        heartbeat_interval: Duration::ZERO,
        idle_timeout: Duration::ZERO,
        ..StreamConfig::default()
    }
}

fn spawn(connector: &MemoryConnector, config: StreamConfig) -> StreamConnection {
    StreamConnection::spawn(endpoint(), config, Arc::new(connector.clone()))
}

fn text(payload: Payload) -> String {
    match payload {
        Payload::Text(text) => text,
        Payload::Binary(bytes) => String::from_utf8(bytes.to_vec()).unwrap(),
    }
}

/// Paused-clock elapsed time, allowing for timer-wheel rounding.
fn assert_elapsed(started: Instant, expected: Duration) {
    let elapsed = started.elapsed();
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(50),
        "expected ~{expected:?}, got {elapsed:?}"
    );
}

async fn wait_open(conn: &StreamConnection) {
    conn.watch_state().wait_for(ConnectionState::is_open).await.unwrap();
}

async fn wait_errored(conn: &StreamConnection) -> String {
    let state = conn
        .watch_state()
        .wait_for(|s| matches!(s, ConnectionState::Errored(_)))
        .await
        .unwrap()
        .clone();
    match state {
        ConnectionState::Errored(reason) => reason,
        other => panic!("expected Errored, got {other:?}"),
    }
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_starts_idle_and_dials_on_connect() {
    let connector = MemoryConnector::new();
    let conn = spawn(&connector, quiet());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert_eq!(connector.attempts(), 0);

    conn.connect();
    wait_open(&conn).await;
    assert_eq!(connector.attempts(), 1);

    // Redundant connect() calls while open do nothing.
    conn.connect();
    conn.connect();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(connector.attempts(), 1);
    assert!(conn.state().is_open());
}

#[tokio::test(start_paused = true)]
async fn test_queued_messages_flush_in_order_before_newer_ones() {
    let connector = MemoryConnector::new();
    let conn = spawn(&connector, quiet());
    conn.connect();

    let first = connector.next_session().await.unwrap();
    wait_open(&conn).await;

    // Drop the transport from the far side; the connection backs off.
    drop(first);
    wait_errored(&conn).await;

    conn.send("A").unwrap();
    conn.send("B").unwrap();
    conn.send("C").unwrap();

    let mut second = connector.next_session().await.unwrap();
    wait_open(&conn).await;
    conn.send("D").unwrap();

    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(text(second.recv().await.unwrap()));
    }
    assert_eq!(received, vec!["A", "B", "C", "D"]);
}

#[tokio::test(start_paused = true)]
async fn test_sends_before_first_connect_are_delivered() {
    let connector = MemoryConnector::new();
    let conn = spawn(&connector, quiet());

    conn.send(&json!({"subscribe": "blocks"})).unwrap();
    conn.connect();

    let mut session = connector.next_session().await.unwrap();
    assert_eq!(
        text(session.recv().await.unwrap()),
        r#"{"subscribe":"blocks"}"#
    );
}

#[tokio::test(start_paused = true)]
async fn test_backoff_doubles_between_attempts() {
    let connector = MemoryConnector::new();
    for _ in 0..3 {
        connector.push_plan(ConnectPlan::Refuse("connection refused".into()));
    }
    let conn = spawn(&connector, quiet());

    let started = Instant::now();
    conn.connect();
    wait_open(&conn).await;

    // Failures at t=0, 1, 3; open at t=7 (1s + 2s + 4s).
    assert_elapsed(started, Duration::from_secs(7));
    assert_eq!(connector.attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_open_resets_attempt_counter() {
    let connector = MemoryConnector::new();
    connector.push_plan(ConnectPlan::Refuse("down".into()));
    connector.push_plan(ConnectPlan::Refuse("down".into()));
    let conn = spawn(&connector, quiet());

    conn.connect();
    let session = connector.next_session().await.unwrap();
    wait_open(&conn).await;

    drop(session);
    wait_errored(&conn).await;
    let lost_at = Instant::now();
    wait_open(&conn).await;

    // Back to the initial delay after a successful open.
    assert_elapsed(lost_at, Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_budget_parks_until_connect() {
    let connector = MemoryConnector::new();
    for _ in 0..3 {
        connector.push_plan(ConnectPlan::Refuse("down".into()));
    }
    let conn = spawn(
        &connector,
        StreamConfig {
            reconnect: ReconnectConfig {
                max_retries: Some(2),
                ..ReconnectConfig::default()
            },
            ..quiet()
        },
    );
    let mut events = conn.subscribe();
    conn.connect();

    let mut disconnects = 0;
    let attempts = loop {
        match events.recv().await.unwrap() {
            StreamEvent::Disconnected { .. } => disconnects += 1,
            StreamEvent::Exhausted { attempts } => break attempts,
            other => panic!("unexpected event {other:?}"),
        }
    };
    assert_eq!(attempts, 2);
    assert_eq!(disconnects, 3);
    assert_eq!(connector.attempts(), 3);

    // Parked: no more dialling on its own.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.attempts(), 3);
    assert!(matches!(conn.state(), ConnectionState::Errored(_)));

    // A fresh connect() restarts the cycle.
    conn.connect();
    wait_open(&conn).await;
    assert_eq!(connector.attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_errors() {
    let connector = MemoryConnector::new();
    connector.push_plan(ConnectPlan::Hang);
    let conn = spawn(&connector, quiet());

    let started = Instant::now();
    conn.connect();
    let reason = wait_errored(&conn).await;

    assert!(reason.contains("no open confirmation"), "{reason}");
    assert_elapsed(started, Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_connect_during_backoff_retries_immediately() {
    let connector = MemoryConnector::new();
    connector.push_plan(ConnectPlan::Refuse("down".into()));
    let conn = spawn(&connector, quiet());

    let started = Instant::now();
    conn.connect();
    wait_errored(&conn).await;
    conn.connect();
    wait_open(&conn).await;

    assert!(started.elapsed() < Duration::from_secs(1));
}

// ── Inbound ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_malformed_payload_is_dropped() {
    let connector = MemoryConnector::new();
    let conn = spawn(&connector, quiet());
    let mut events = conn.subscribe();
    conn.connect();

    let session = connector.next_session().await.unwrap();
    assert!(matches!(events.recv().await.unwrap(), StreamEvent::Opened));

    session.send_text("{not json");
    session.send_json(&json!({"type": "mystery"}));
    session.send_json(&json!({"type": "snapshot", "data": {"height": 5}, "seq": 1}));

    match events.recv().await.unwrap() {
        StreamEvent::Envelope(envelope) => assert_eq!(
            *envelope,
            InboundEnvelope::Snapshot {
                data: json!({"height": 5}),
                seq: 1
            }
        ),
        other => panic!("expected envelope, got {other:?}"),
    }
    assert!(conn.state().is_open());
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_remote_close_triggers_reconnect() {
    let connector = MemoryConnector::new();
    let conn = spawn(&connector, quiet());
    let mut events = conn.subscribe();
    conn.connect();

    let session = connector.next_session().await.unwrap();
    session.send_frame(Frame::Close {
        code: 1001,
        reason: "going away".into(),
    });

    let reason = loop {
        if let StreamEvent::Disconnected { reason } = events.recv().await.unwrap() {
            break reason;
        }
    };
    assert!(reason.contains("1001"), "{reason}");

    let _second = connector.next_session().await.unwrap();
    wait_open(&conn).await;
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_tears_down_session() {
    let connector = MemoryConnector::new();
    let conn = spawn(&connector, quiet());
    conn.connect();

    let session = connector.next_session().await.unwrap();
    wait_open(&conn).await;
    session.fail("connection reset");

    let reason = wait_errored(&conn).await;
    assert!(reason.contains("connection reset"), "{reason}");
    // The old transport is gone before the next one opens.
    tokio::task::yield_now().await;
    assert!(!session.is_open());
}

// ── Heartbeat / idle ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_heartbeat_is_sent_on_interval() {
    let connector = MemoryConnector::new();
    let conn = spawn(
        &connector,
        StreamConfig {
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::ZERO,
            ..StreamConfig::default()
        },
    );
    conn.connect();

    let mut session = connector.next_session().await.unwrap();
    let started = Instant::now();
    assert_eq!(text(session.recv().await.unwrap()), HEARTBEAT_FRAME);
    assert_elapsed(started, Duration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_triggers_reconnect() {
    let connector = MemoryConnector::new();
    let conn = spawn(
        &connector,
        StreamConfig {
            heartbeat_interval: Duration::ZERO,
            idle_timeout: Duration::from_secs(45),
            ..StreamConfig::default()
        },
    );
    conn.connect();

    let session = connector.next_session().await.unwrap();
    wait_open(&conn).await;

    // Traffic at t=30 pushes the deadline to t=75.
    tokio::time::sleep(Duration::from_secs(30)).await;
    session.send_json(&json!({"type": "heartbeat"}));

    let started = Instant::now();
    let reason = wait_errored(&conn).await;
    assert!(reason.contains("no inbound traffic"), "{reason}");
    assert_elapsed(started, Duration::from_secs(45));
}

// ── Close ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_close_cancels_pending_reconnect() {
    let connector = MemoryConnector::new();
    connector.push_plan(ConnectPlan::Refuse("down".into()));
    let conn = spawn(&connector, quiet());

    conn.connect();
    wait_errored(&conn).await;
    conn.close();
    conn.closed().await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts(), 1);
    assert!(conn.state().is_closed());
    assert!(conn.send("late").is_err());
}

#[tokio::test(start_paused = true)]
async fn test_close_while_open_closes_transport() {
    let connector = MemoryConnector::new();
    let conn = spawn(&connector, quiet());
    let mut events = conn.subscribe();
    conn.connect();

    let session = connector.next_session().await.unwrap();
    wait_open(&conn).await;
    conn.close();
    conn.closed().await;

    assert!(!session.is_open());
    let mut saw_closed = false;
    while let Ok(event) = events.try_recv() {
        saw_closed |= matches!(event, StreamEvent::Closed);
    }
    assert!(saw_closed);
}
