//! Reconnection ticket refresh over a logged-in transport

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use rtcsig_session_core::signaling::memory::{memory_connection, MemoryServer};
use rtcsig_session_core::signaling::ticket::encode_json;
use rtcsig_session_core::signaling::{SignalingTransport, TransportEvent, TransportPhase};
use rtcsig_session_core::{SessionError, TransportConfig};
use serde_json::{json, Value};

async fn logged_in(ticket: String) -> (Arc<SignalingTransport>, MemoryServer) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (connection, mut server) = memory_connection();
    let transport = SignalingTransport::new(connection, TransportConfig::default());
    let login = {
        let transport = transport.clone();
        let token = encode_json(&json!({"host": "conference.test"}));
        tokio::spawn(async move { transport.connect(&token).await })
    };
    let frame = server.next_named("login").await.unwrap();
    server.ok(frame.id, json!({"id": "p1", "reconnectionTicket": ticket}));
    tokio_test::assert_ok!(login.await.unwrap());
    (transport, server)
}

#[tokio::test(start_paused = true)]
async fn test_ticket_refreshed_before_expiry() {
    let expiring = encode_json(&json!({"notAfter": Utc::now().timestamp_millis() + 10_000}));
    let (transport, mut server) = logged_in(expiring.clone()).await;
    assert_eq!(transport.ticket().unwrap().raw, expiring);
    let logged_in_at = Instant::now();

    tokio::time::advance(Duration::from_secs(8)).await;
    assert!(server.try_next_frame().is_none());

    let refresh = server.next_named("refreshReconnectionTicket").await.unwrap();
    // one second of margin before notAfter
    let elapsed = logged_in_at.elapsed();
    assert!(elapsed >= Duration::from_secs(8), "refreshed early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(10), "refreshed after expiry: {:?}", elapsed);
    assert_eq!(refresh.payload, Value::Null);
    let renewed = encode_json(&json!({}));
    server.ok(refresh.id, Value::String(renewed.clone()));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let ticket = transport.ticket().unwrap();
    assert_eq!(ticket.raw, renewed);
    assert_eq!(ticket.not_after_ms, None);
    assert_eq!(transport.phase(), TransportPhase::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_failed_refresh_disconnects() {
    let expiring = encode_json(&json!({"notAfter": Utc::now().timestamp_millis() + 5_000}));
    let (transport, mut server) = logged_in(expiring).await;
    let mut events = transport.subscribe();

    let refresh = server.next_named("refreshReconnectionTicket").await.unwrap();
    let queued = transport.emit_request("publish", json!({"n": 1}));
    let publish = server.next_named("publish").await.unwrap();
    assert!(publish.id > refresh.id);
    assert_eq!(transport.pending_requests(), 1);
    server.error(refresh.id, "ticket revoked");

    loop {
        match events.recv().await.unwrap() {
            TransportEvent::ServerDisconnected => break,
            _ => continue,
        }
    }
    assert_eq!(transport.phase(), TransportPhase::Disconnected);
    assert!(transport.ticket().is_none());
    assert!(matches!(queued.wait().await, Err(SessionError::Disconnected { .. })));
    assert_eq!(transport.pending_requests(), 0);
}
