//! Media-engine boundary
//!
//! The engine owns transports, codecs and capture pipelines. This crate only
//! sees it through [`MediaEngine`] and the per-session [`MediaSessionHandle`],
//! plus the stream of [`EngineEvent`]s each handle emits.

pub mod loopback;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::sdp::{MediaKind, SessionDescription};

pub use types::*;

/// A freshly created media session and its notification stream
pub struct EngineSession {
    pub handle: Arc<dyn MediaSessionHandle>,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
}

/// Factory for media-session handles
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    async fn create_session(&self, config: &EngineSessionConfig) -> Result<EngineSession>;
}

/// One negotiating or active connection inside the engine.
///
/// Implementations may assume calls arrive one at a time; the channel layer
/// runs every call on its engine queue.
#[async_trait]
pub trait MediaSessionHandle: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    fn ice_connection_state(&self) -> IceConnectionState;

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<()>;

    async fn remove_track(&self, track_id: &str) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Cap the encoder bitrate of every sender of `kind`
    async fn set_max_bitrate(&self, kind: MediaKind, bitrate_bps: u64) -> Result<()>;

    async fn create_data_channel(&self, label: &str) -> Result<()>;

    fn is_data_channel_open(&self) -> bool;

    async fn send_data(&self, text: &str) -> Result<()>;

    async fn get_stats(&self) -> Result<ConnectionStats>;

    /// Release the session. Called at most once by the owning channel.
    async fn close(&self);
}
