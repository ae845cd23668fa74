//! Value types crossing the media-engine boundary

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sdp::MediaKind;

// ===== ENGINE STATES =====

/// Offer/answer sub-state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Transport connectivity reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

// ===== ICE =====

/// A network path descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u32,
}

// ===== TRACKS AND STREAMS =====

/// Where a track's media comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackSource {
    Mic,
    Camera,
    ScreenCast,
    Mixed,
}

impl TrackSource {
    pub fn default_for(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => TrackSource::Mic,
            MediaKind::Video => TrackSource::Camera,
        }
    }
}

/// A single audio or video track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
    pub source: TrackSource,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            source: TrackSource::default_for(kind),
        }
    }

    pub fn with_source(mut self, source: TrackSource) -> Self {
        self.source = source;
        self
    }
}

/// A local stream handed to publish.
///
/// Clones share the ended flag, so ending any clone ends the stream.
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
    pub attributes: HashMap<String, String>,
    ended: Arc<AtomicBool>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
            attributes: HashMap::new(),
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.tracks_of(kind).next().is_some()
    }

    /// Source of the first track of `kind`
    pub fn source_of(&self, kind: MediaKind) -> Option<TrackSource> {
        self.tracks_of(kind).next().map(|t| t.source)
    }

    pub fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

/// Audio/video source pair advertised for a stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSourceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<TrackSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<TrackSource>,
}

/// A stream received from the remote side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStream {
    pub id: String,
    /// Remote peer id (P2P) or owning participant (conference)
    pub origin: String,
    pub tracks: Vec<MediaTrack>,
    pub source: StreamSourceInfo,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

// ===== STATISTICS =====

/// Connection statistics snapshot returned by the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// When the snapshot was taken
    pub timestamp: Option<DateTime<Utc>>,
    /// Bytes sent across all senders
    pub bytes_sent: u64,
    /// Bytes received across all receivers
    pub bytes_received: u64,
    /// Packets reported lost by the remote side
    pub packets_lost: u64,
    /// Current round-trip time estimate
    pub round_trip_time_ms: Option<f64>,
    /// Estimated available outgoing bitrate
    pub available_outgoing_bitrate_bps: Option<u64>,
    /// Raw engine reports for callers that need more
    #[serde(default)]
    pub reports: Vec<serde_json::Value>,
}

// ===== ENGINE EVENTS =====

/// Notifications emitted by a media-session handle
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    SignalingStateChanged(SignalingState),
    IceConnectionStateChanged(IceConnectionState),
    IceCandidate(IceCandidate),
    IceCandidatesRemoved(Vec<IceCandidate>),
    TrackAdded { stream_id: String, track: MediaTrack },
    StreamRemoved { stream_id: String },
    RenegotiationNeeded,
    DataChannelOpen,
    DataChannelMessage(String),
}

/// Options for offer creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfferOptions {
    pub ice_restart: bool,
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
}

/// Parameters for a new media-session handle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSessionConfig {
    pub ice_servers: Vec<String>,
    pub continual_ice_gathering: bool,
}
