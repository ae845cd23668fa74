//! Two P2P channels negotiating through an in-memory relay

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rtcsig_session_core::channel::p2p::P2PChannelContext;
use rtcsig_session_core::engine::loopback::LoopbackEngine;
use rtcsig_session_core::engine::{LocalStream, MediaTrack, RemoteStream};
use rtcsig_session_core::sdp::{MediaKind, VideoCodec};
use rtcsig_session_core::signaling::memory::MemoryHub;
use rtcsig_session_core::signaling::messages::SignalPayload;
use rtcsig_session_core::signaling::{P2PMessage, P2PSignalingChannel, P2PSignalingEvent};
use rtcsig_session_core::{
    ChannelConfig, Executors, P2PChannel, P2PChannelObserver, SessionError, SessionState,
    UserAgentConfig,
};
use tokio::sync::mpsc;

#[derive(Default)]
struct Recorder {
    streams: Mutex<Vec<RemoteStream>>,
    stopped: Mutex<Vec<String>>,
}

impl P2PChannelObserver for Recorder {
    fn on_stopped(&self, remote_id: &str, _instance_id: &str) {
        self.stopped.lock().push(remote_id.to_string());
    }
    fn on_stream_added(&self, stream: RemoteStream) {
        self.streams.lock().push(stream);
    }
    fn on_stream_ended(&self, _remote_id: &str, _stream_id: &str) {}
    fn on_message_received(&self, _remote_id: &str, _message: String) {}
    fn on_error(&self, _remote_id: &str, _error: SessionError) {}
}

struct Side {
    channel: Arc<P2PChannel>,
    inbox: mpsc::UnboundedReceiver<P2PSignalingEvent>,
    recorder: Arc<Recorder>,
    engine: Arc<LoopbackEngine>,
}

async fn side(
    hub: &Arc<MemoryHub>,
    engine: LoopbackEngine,
    local: &str,
    remote: &str,
    config: ChannelConfig,
) -> Side {
    let engine = Arc::new(engine);
    let signaling = hub.channel();
    let (_, inbox) = signaling.connect(local).await.unwrap();
    let recorder = Arc::new(Recorder::default());
    let observer: Arc<dyn P2PChannelObserver> = recorder.clone();
    let context = P2PChannelContext {
        local_id: local.to_string(),
        signaling,
        engine: engine.clone(),
        config,
        user_agent: UserAgentConfig::default(),
        executors: Executors::new(),
        observer: Arc::downgrade(&observer),
    };
    let channel = P2PChannel::create(&context, remote).await.unwrap();
    Side {
        channel,
        inbox,
        recorder,
        engine,
    }
}

async fn pair(config: ChannelConfig) -> (Side, Side, Arc<MemoryHub>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let hub = MemoryHub::new();
    let engine = LoopbackEngine::new();
    let other = engine.sharing_network();
    let a = side(&hub, engine, "a", "b", config).await;
    let b = side(&hub, other, "b", "a", ChannelConfig::default()).await;
    (a, b, hub)
}

fn relay(side: &mut Side) {
    while let Ok(P2PSignalingEvent::Message { message, .. }) = side.inbox.try_recv() {
        side.channel
            .on_incoming_message(P2PMessage::parse(&message).unwrap());
    }
}

async fn pump_until(a: &mut Side, b: &mut Side, done: impl Fn(&Side, &Side) -> bool) {
    for _ in 0..500 {
        if done(a, b) {
            return;
        }
        relay(a);
        relay(b);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached");
}

fn stream(id: &str) -> LocalStream {
    LocalStream::new(
        id,
        vec![
            MediaTrack::new(format!("{}-audio", id), MediaKind::Audio),
            MediaTrack::new(format!("{}-video", id), MediaKind::Video),
        ],
    )
}

fn relayed_offers(hub: &MemoryHub, from: &str) -> Vec<String> {
    hub.messages()
        .into_iter()
        .filter(|(f, _, _)| f == from)
        .filter_map(|(_, _, text)| match P2PMessage::parse(&text) {
            Ok(P2PMessage::Signal(SignalPayload::Offer { sdp })) => Some(sdp),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_offer_carries_codec_preference() {
    let config = ChannelConfig::default().with_video_codecs(vec![VideoCodec::H264]);
    let (mut a, mut b, hub) = pair(config).await;

    let pending = a.channel.publish(stream("cam"));
    pump_until(&mut a, &mut b, |_, b| !b.recorder.streams.lock().is_empty()).await;
    pending.wait().await.unwrap();

    let offers = relayed_offers(&hub, "a");
    assert!(!offers.is_empty());
    let video = offers[0]
        .lines()
        .find(|line| line.starts_with("m=video"))
        .unwrap();
    let payloads: Vec<&str> = video.split(' ').skip(3).collect();
    assert_eq!(payloads.first(), Some(&"98"));
    assert!(!payloads.contains(&"96"));
}

#[tokio::test]
async fn test_streams_published_in_order() {
    let (mut a, mut b, _hub) = pair(ChannelConfig::default()).await;

    let first = a.channel.publish(stream("camera"));
    let second = a.channel.publish(stream("screen"));
    pump_until(&mut a, &mut b, |_, b| b.recorder.streams.lock().len() == 2).await;
    first.wait().await.unwrap();
    second.wait().await.unwrap();

    let ids: Vec<String> = b.recorder.streams.lock().iter().map(|s| s.id.clone()).collect();
    assert_eq!(ids, vec!["camera".to_string(), "screen".to_string()]);
    assert_eq!(a.channel.published_streams().len(), 2);
}

#[tokio::test]
async fn test_closed_channel_ignores_late_signaling() {
    let (mut a, mut b, hub) = pair(ChannelConfig::default()).await;
    let _publish = a.channel.publish(stream("cam"));
    pump_until(&mut a, &mut b, |a, b| {
        a.channel.state() == SessionState::Connected && b.channel.state() == SessionState::Connected
    })
    .await;

    a.channel.stop().wait().await.unwrap();
    pump_until(&mut a, &mut b, |_, b| b.channel.is_ended()).await;

    // A stale offer arriving after the close must not touch the released session
    let stale = relayed_offers(&hub, "a").remove(0);
    b.channel
        .on_incoming_message(P2PMessage::Signal(SignalPayload::Offer { sdp: stale }));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let session = b.engine.latest_session().unwrap();
    assert_eq!(session.close_count(), 1);
    assert_eq!(session.calls_after_close(), 0);
    assert_eq!(b.channel.state(), SessionState::Closed);
    assert_eq!(*b.recorder.stopped.lock(), vec!["a".to_string()]);
    assert!(a.recorder.stopped.lock().len() <= 1);
}
