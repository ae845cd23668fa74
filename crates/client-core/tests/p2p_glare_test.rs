//! Two peers publishing to each other at the same moment

use std::sync::Arc;
use std::time::Duration;

use rtcsig_client_core::prelude::*;
use rtcsig_session_core::engine::loopback::LoopbackEngine;
use rtcsig_session_core::sdp::MediaKind;
use rtcsig_session_core::signaling::memory::MemoryHub;

struct Peer {
    client: Arc<P2PClient>,
    engine: Arc<LoopbackEngine>,
}

async fn peer(hub: &Arc<MemoryHub>, engine: LoopbackEngine, id: &str, remote: &str) -> Peer {
    let engine = Arc::new(engine);
    let client = P2PClient::new(P2PClientConfig::default(), hub.channel(), engine.clone())
        .expect("client");
    client.connect(id).await.expect("connect");
    client.add_allowed_remote_id(remote);
    Peer { client, engine }
}

fn stream(id: &str) -> LocalStream {
    LocalStream::new(
        id,
        vec![
            MediaTrack::new(format!("{}-mic", id), MediaKind::Audio),
            MediaTrack::new(format!("{}-cam", id), MediaKind::Video),
        ],
    )
}

#[tokio::test]
async fn test_simultaneous_publish_resolves_glare() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let hub = MemoryHub::new();
    let engine = LoopbackEngine::new();
    let other = engine.sharing_network();
    let alice = peer(&hub, engine, "alice", "bob").await;
    let bob = peer(&hub, other, "bob", "alice").await;

    // Both offers are out before either side sees the other's
    hub.hold("alice");
    hub.hold("bob");
    let alice_publish = {
        let client = alice.client.clone();
        tokio::spawn(async move { client.publish("bob", stream("alice-cam")).await })
    };
    let bob_publish = {
        let client = bob.client.clone();
        tokio::spawn(async move { client.publish("alice", stream("bob-cam")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(hub.count_messages("alice", "bob", "offer") >= 1);
    assert!(hub.count_messages("bob", "alice", "offer") >= 1);

    hub.release("bob");
    hub.release("alice");

    let alice_publication = tokio::time::timeout(Duration::from_secs(5), alice_publish)
        .await
        .expect("alice publish timed out")
        .unwrap()
        .expect("alice publish");
    let bob_publication = tokio::time::timeout(Duration::from_secs(5), bob_publish)
        .await
        .expect("bob publish timed out")
        .unwrap()
        .expect("bob publish");
    assert_eq!(alice_publication.id(), "alice-cam");
    assert_eq!(bob_publication.id(), "bob-cam");

    // The larger id yields: bob drops its first session and answers alice's offer
    let bob_sessions = bob.engine.sessions();
    assert_eq!(bob_sessions.len(), 2);
    assert!(bob_sessions[0].is_closed());
    assert!(!bob_sessions[1].is_closed());
    assert_eq!(alice.engine.sessions().len(), 1);

    assert_eq!(alice.client.remote_ids(), vec!["bob".to_string()]);
    assert_eq!(bob.client.remote_ids(), vec!["alice".to_string()]);
}

#[tokio::test]
async fn test_remote_stop_clears_allowed_remote() {
    let hub = MemoryHub::new();
    let engine = LoopbackEngine::new();
    let other = engine.sharing_network();
    let alice = peer(&hub, engine, "alice", "bob").await;
    let bob = peer(&hub, other, "bob", "alice").await;
    let mut bob_events = bob.client.event_stream();

    alice
        .client
        .publish("bob", stream("alice-cam"))
        .await
        .expect("publish");
    alice.client.stop("bob").await.expect("stop");

    let stopped = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(ClientEvent::SessionStopped { remote_id, .. }) = bob_events.recv().await {
                return remote_id;
            }
        }
    })
    .await
    .expect("stop event");
    assert_eq!(stopped, "alice");
    assert!(bob.client.remote_ids().is_empty());
    assert!(!bob.client.is_allowed("alice"));
}
