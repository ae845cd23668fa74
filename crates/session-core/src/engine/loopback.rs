//! In-process media engine
//!
//! `LoopbackEngine` models just enough of a WebRTC engine to drive the
//! channel state machines end to end without real media: the offer/answer
//! signaling states, candidate gathering, track announcement through
//! `a=msid` lines, and a data channel that delivers text to the session on
//! the other side of the negotiation. Sessions created from engines that
//! share a network find each other through an `a=x-loopback-session` line.
//!
//! Every call is recorded so tests can check that nothing reaches a session
//! after it was closed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    ConnectionStats, EngineEvent, EngineSession, EngineSessionConfig, IceCandidate,
    IceConnectionState, MediaEngine, MediaSessionHandle, MediaTrack, OfferOptions, SignalingState,
};
use crate::errors::{Result, SessionError};
use crate::sdp::{MediaKind, SdpType, SessionDescription};

const SESSION_ATTRIBUTE: &str = "a=x-loopback-session:";

/// Behaviour switches for loopback sessions
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Candidates emitted after each local description
    pub candidates_per_gathering: usize,
    /// Report ICE connected as soon as both descriptions are applied
    pub auto_connect: bool,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            candidates_per_gathering: 1,
            auto_connect: true,
        }
    }
}

#[derive(Default)]
struct LoopbackNetwork {
    sessions: DashMap<String, Weak<LoopbackSession>>,
}

/// Engine whose sessions live in process memory
pub struct LoopbackEngine {
    network: Arc<LoopbackNetwork>,
    options: LoopbackOptions,
    sessions: Mutex<Vec<Arc<LoopbackSession>>>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::with_options(LoopbackOptions::default())
    }

    pub fn with_options(options: LoopbackOptions) -> Self {
        Self {
            network: Arc::new(LoopbackNetwork::default()),
            options,
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// A second engine whose sessions can reach this engine's sessions
    pub fn sharing_network(&self) -> Self {
        Self {
            network: self.network.clone(),
            options: self.options.clone(),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Every session this engine created, oldest first
    pub fn sessions(&self) -> Vec<Arc<LoopbackSession>> {
        self.sessions.lock().clone()
    }

    pub fn latest_session(&self) -> Option<Arc<LoopbackSession>> {
        self.sessions.lock().last().cloned()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_session(&self, config: &EngineSessionConfig) -> Result<EngineSession> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(LoopbackSession {
            id: Uuid::new_v4().to_string(),
            options: self.options.clone(),
            network: self.network.clone(),
            events: tx,
            model: Mutex::new(SessionModel::default()),
            calls: Mutex::new(Vec::new()),
            calls_after_close: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            fail_create_offer: AtomicBool::new(false),
            fail_set_remote: AtomicBool::new(false),
        });
        self.network
            .sessions
            .insert(session.id.clone(), Arc::downgrade(&session));
        self.sessions.lock().push(session.clone());
        debug!(session = %session.id, continual = config.continual_ice_gathering, "Loopback session created");
        Ok(EngineSession {
            handle: session,
            events: rx,
        })
    }
}

struct SessionModel {
    signaling: SignalingState,
    ice: IceConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    tracks: Vec<(MediaTrack, String)>,
    /// remote track id -> (stream id, kind)
    remote_tracks: HashMap<String, (String, MediaKind)>,
    data_channel: bool,
    data_open: bool,
    peer: Option<String>,
    ice_generation: u32,
    candidate_seq: u32,
    remote_candidates: Vec<IceCandidate>,
    max_bitrates: HashMap<MediaKind, u64>,
    bytes_sent: u64,
    bytes_received: u64,
    closed: bool,
}

impl Default for SessionModel {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            ice: IceConnectionState::New,
            local: None,
            remote: None,
            tracks: Vec::new(),
            remote_tracks: HashMap::new(),
            data_channel: false,
            data_open: false,
            peer: None,
            ice_generation: 0,
            candidate_seq: 0,
            remote_candidates: Vec::new(),
            max_bitrates: HashMap::new(),
            bytes_sent: 0,
            bytes_received: 0,
            closed: false,
        }
    }
}

/// One loopback media session
pub struct LoopbackSession {
    id: String,
    options: LoopbackOptions,
    network: Arc<LoopbackNetwork>,
    events: mpsc::UnboundedSender<EngineEvent>,
    model: Mutex<SessionModel>,
    calls: Mutex<Vec<&'static str>>,
    calls_after_close: AtomicUsize,
    close_count: AtomicUsize,
    fail_create_offer: AtomicBool,
    fail_set_remote: AtomicBool,
}

impl std::fmt::Debug for LoopbackSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackSession").field("id", &self.id).finish()
    }
}

impl LoopbackSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Mutating calls made so far, in order
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn calls_after_close(&self) -> usize {
        self.calls_after_close.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.model.lock().closed
    }

    pub fn current_signaling_state(&self) -> SignalingState {
        self.model.lock().signaling
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.model.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.model.lock().remote.clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.model.lock().remote_candidates.clone()
    }

    pub fn local_track_ids(&self) -> Vec<String> {
        self.model.lock().tracks.iter().map(|(t, _)| t.id.clone()).collect()
    }

    pub fn max_bitrate(&self, kind: MediaKind) -> Option<u64> {
        self.model.lock().max_bitrates.get(&kind).copied()
    }

    /// Id of the session on the other side of the negotiation
    pub fn peer_id(&self) -> Option<String> {
        self.model.lock().peer.clone()
    }

    pub fn fail_create_offer(&self, fail: bool) {
        self.fail_create_offer.store(fail, Ordering::SeqCst);
    }

    pub fn fail_set_remote(&self, fail: bool) {
        self.fail_set_remote.store(fail, Ordering::SeqCst);
    }

    /// Push an arbitrary engine event to the owning channel
    pub fn inject(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Change the ICE connection state and report it
    pub fn set_ice_state(&self, state: IceConnectionState) {
        self.model.lock().ice = state;
        self.inject(EngineEvent::IceConnectionStateChanged(state));
    }

    fn record(&self, call: &'static str) {
        let closed = self.model.lock().closed;
        if closed {
            self.calls_after_close.fetch_add(1, Ordering::SeqCst);
        }
        self.calls.lock().push(call);
        trace!(session = %self.id, call, "Loopback call");
    }

    fn check_open(&self) {
        if self.model.lock().closed {
            self.calls_after_close.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn deliver(&self, event: EngineEvent) {
        if let EngineEvent::DataChannelMessage(text) = &event {
            self.model.lock().bytes_received += text.len() as u64;
        }
        self.inject(event);
    }

    fn build_sdp(&self, model: &SessionModel) -> String {
        let mut lines: Vec<String> = vec![
            "v=0".into(),
            format!("o=- {} 2 IN IP4 127.0.0.1", self.id.as_bytes().iter().map(|b| *b as u64).sum::<u64>()),
            "s=-".into(),
            "t=0 0".into(),
            format!("{}{}", SESSION_ATTRIBUTE, self.id),
        ];

        lines.push("m=audio 9 UDP/TLS/RTP/SAVPF 111 0 8".into());
        lines.push("c=IN IP4 0.0.0.0".into());
        lines.push(format!("a=ice-ufrag:gen{}", model.ice_generation));
        lines.push("a=mid:0".into());
        lines.push("a=rtpmap:111 opus/48000/2".into());
        lines.push("a=rtcp-fb:111 transport-cc".into());
        lines.push("a=fmtp:111 minptime=10;useinbandfec=1".into());
        lines.push("a=rtpmap:0 PCMU/8000".into());
        lines.push("a=rtpmap:8 PCMA/8000".into());
        for (track, stream) in model.tracks.iter().filter(|(t, _)| t.kind == MediaKind::Audio) {
            lines.push(format!("a=msid:{} {}", stream, track.id));
        }

        lines.push("m=video 9 UDP/TLS/RTP/SAVPF 96 97 98 99 100 101".into());
        lines.push("c=IN IP4 0.0.0.0".into());
        lines.push(format!("a=ice-ufrag:gen{}", model.ice_generation));
        lines.push("a=mid:1".into());
        lines.push("a=rtpmap:96 VP8/90000".into());
        lines.push("a=rtcp-fb:96 nack".into());
        lines.push("a=rtpmap:97 rtx/90000".into());
        lines.push("a=fmtp:97 apt=96".into());
        lines.push("a=rtpmap:98 H264/90000".into());
        lines.push("a=rtcp-fb:98 nack".into());
        lines.push("a=fmtp:98 level-asymmetry-allowed=1;packetization-mode=1".into());
        lines.push("a=rtpmap:99 rtx/90000".into());
        lines.push("a=fmtp:99 apt=98".into());
        lines.push("a=rtpmap:100 red/90000".into());
        lines.push("a=rtpmap:101 ulpfec/90000".into());
        for (track, stream) in model.tracks.iter().filter(|(t, _)| t.kind == MediaKind::Video) {
            lines.push(format!("a=msid:{} {}", stream, track.id));
        }

        if model.data_channel {
            lines.push("m=application 9 UDP/DTLS/SCTP webrtc-datachannel".into());
            lines.push("a=mid:2".into());
        }
        lines.push(String::new());
        lines.join("\r\n")
    }

    fn gather_candidates(&self, model: &mut SessionModel) -> Vec<EngineEvent> {
        (0..self.options.candidates_per_gathering)
            .map(|_| {
                model.candidate_seq += 1;
                EngineEvent::IceCandidate(IceCandidate {
                    candidate: format!(
                        "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host generation {}",
                        model.candidate_seq,
                        50000 + model.candidate_seq,
                        model.ice_generation
                    ),
                    sdp_mid: "0".into(),
                    sdp_mline_index: 0,
                })
            })
            .collect()
    }

    fn connect_events(&self, model: &mut SessionModel) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        let negotiated = model.signaling == SignalingState::Stable
            && model.local.is_some()
            && model.remote.is_some();
        if !negotiated || !self.options.auto_connect {
            return events;
        }
        if !model.ice.is_connected() {
            model.ice = IceConnectionState::Connected;
            events.push(EngineEvent::IceConnectionStateChanged(IceConnectionState::Checking));
            events.push(EngineEvent::IceConnectionStateChanged(IceConnectionState::Connected));
        }
        if model.data_channel && !model.data_open {
            model.data_open = true;
            events.push(EngineEvent::DataChannelOpen);
        }
        events
    }

    fn remote_track_events(&self, model: &mut SessionModel, sdp: &str) -> Vec<EngineEvent> {
        let mut kind: Option<MediaKind> = None;
        let mut seen: HashMap<String, (String, MediaKind)> = HashMap::new();
        for line in sdp.lines() {
            let line = line.trim_end();
            if line.starts_with("m=audio") {
                kind = Some(MediaKind::Audio);
            } else if line.starts_with("m=video") {
                kind = Some(MediaKind::Video);
            } else if line.starts_with("m=") {
                kind = None;
            } else if let (Some(k), Some(rest)) = (kind, line.strip_prefix("a=msid:")) {
                if let Some((stream, track)) = rest.split_once(' ') {
                    seen.insert(track.to_string(), (stream.to_string(), k));
                }
            } else if let Some(peer) = line.strip_prefix(SESSION_ATTRIBUTE) {
                model.peer = Some(peer.to_string());
            }
        }
        if sdp.contains("m=application") {
            model.data_channel = true;
        }

        let mut events = Vec::new();
        for (track_id, (stream_id, k)) in &seen {
            if !model.remote_tracks.contains_key(track_id) {
                events.push(EngineEvent::TrackAdded {
                    stream_id: stream_id.clone(),
                    track: MediaTrack::new(track_id.clone(), *k),
                });
            }
        }
        let old_streams: HashSet<String> =
            model.remote_tracks.values().map(|(s, _)| s.clone()).collect();
        let new_streams: HashSet<String> = seen.values().map(|(s, _)| s.clone()).collect();
        for stream_id in old_streams.difference(&new_streams) {
            events.push(EngineEvent::StreamRemoved {
                stream_id: stream_id.clone(),
            });
        }
        model.remote_tracks = seen;
        events
    }

    fn emit_all(&self, events: Vec<EngineEvent>) {
        for event in events {
            self.inject(event);
        }
    }
}

#[async_trait]
impl MediaSessionHandle for LoopbackSession {
    fn signaling_state(&self) -> SignalingState {
        self.check_open();
        self.model.lock().signaling
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.check_open();
        self.model.lock().ice
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription> {
        self.record("create_offer");
        if self.fail_create_offer.load(Ordering::SeqCst) {
            return Err(SessionError::negotiation("loopback offer creation failed"));
        }
        let mut model = self.model.lock();
        if options.ice_restart {
            model.ice_generation += 1;
        }
        Ok(SessionDescription::offer(self.build_sdp(&model)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record("create_answer");
        let model = self.model.lock();
        if model.signaling != SignalingState::HaveRemoteOffer {
            return Err(SessionError::negotiation("no remote offer to answer"));
        }
        Ok(SessionDescription::answer(self.build_sdp(&model)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.record("set_local_description");
        let events = {
            let mut model = self.model.lock();
            let next = match (description.sdp_type, model.signaling) {
                (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (t, s) => {
                    return Err(SessionError::negotiation(format!(
                        "cannot set local {} in {:?}",
                        t, s
                    )))
                }
            };
            model.signaling = next;
            model.local = Some(description);
            let mut events = vec![EngineEvent::SignalingStateChanged(next)];
            events.extend(self.gather_candidates(&mut model));
            events.extend(self.connect_events(&mut model));
            events
        };
        self.emit_all(events);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.record("set_remote_description");
        if self.fail_set_remote.load(Ordering::SeqCst) {
            return Err(SessionError::negotiation("loopback remote description rejected"));
        }
        let events = {
            let mut model = self.model.lock();
            let next = match (description.sdp_type, model.signaling) {
                (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
                (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (t, s) => {
                    return Err(SessionError::negotiation(format!(
                        "cannot set remote {} in {:?}",
                        t, s
                    )))
                }
            };
            model.signaling = next;
            let mut events = vec![EngineEvent::SignalingStateChanged(next)];
            events.extend(self.remote_track_events(&mut model, &description.sdp));
            model.remote = Some(description);
            events.extend(self.connect_events(&mut model));
            events
        };
        self.emit_all(events);
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<()> {
        self.record("add_track");
        let mut model = self.model.lock();
        if model.tracks.iter().any(|(t, _)| t.id == track.id) {
            return Err(SessionError::engine(format!("track {} already added", track.id)));
        }
        model.tracks.push((track.clone(), stream_id.to_string()));
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        self.record("remove_track");
        self.model.lock().tracks.retain(|(t, _)| t.id != track_id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.record("add_ice_candidate");
        let mut model = self.model.lock();
        if model.remote.is_none() {
            return Err(SessionError::negotiation(
                "candidate added before remote description",
            ));
        }
        model.remote_candidates.push(candidate.clone());
        Ok(())
    }

    async fn set_max_bitrate(&self, kind: MediaKind, bitrate_bps: u64) -> Result<()> {
        self.record("set_max_bitrate");
        self.model.lock().max_bitrates.insert(kind, bitrate_bps);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<()> {
        self.record("create_data_channel");
        debug!(session = %self.id, label, "Data channel requested");
        self.model.lock().data_channel = true;
        Ok(())
    }

    fn is_data_channel_open(&self) -> bool {
        self.check_open();
        self.model.lock().data_open
    }

    async fn send_data(&self, text: &str) -> Result<()> {
        self.record("send_data");
        let peer = {
            let mut model = self.model.lock();
            if !model.data_open {
                return Err(SessionError::engine("data channel is not open"));
            }
            model.bytes_sent += text.len() as u64;
            model.peer.clone()
        };
        let peer = peer
            .and_then(|id| self.network.sessions.get(&id).and_then(|w| w.upgrade()))
            .ok_or_else(|| SessionError::engine("data channel peer is gone"))?;
        peer.deliver(EngineEvent::DataChannelMessage(text.to_string()));
        Ok(())
    }

    async fn get_stats(&self) -> Result<ConnectionStats> {
        self.record("get_stats");
        let model = self.model.lock();
        Ok(ConnectionStats {
            timestamp: Some(Utc::now()),
            bytes_sent: model.bytes_sent,
            bytes_received: model.bytes_received,
            packets_lost: 0,
            round_trip_time_ms: Some(0.1),
            available_outgoing_bitrate_bps: model.max_bitrates.values().copied().max(),
            reports: Vec::new(),
        })
    }

    async fn close(&self) {
        self.record("close");
        self.close_count.fetch_add(1, Ordering::SeqCst);
        {
            let mut model = self.model.lock();
            model.closed = true;
            model.signaling = SignalingState::Closed;
            model.ice = IceConnectionState::Closed;
            model.data_open = false;
        }
        self.network.sessions.remove(&self.id);
        debug!(session = %self.id, "Loopback session closed");
    }
}
