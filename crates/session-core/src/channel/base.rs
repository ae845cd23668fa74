//! State and buffering shared by every channel variant

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use super::buffer::FifoBuffer;
use super::SessionState;
use crate::config::ChannelConfig;
use crate::engine::{
    ConnectionStats, EngineEvent, EngineSessionConfig, IceCandidate, MediaEngine,
    MediaSessionHandle, OfferOptions, SignalingState,
};
use crate::errors::{Result, SessionError};
use crate::executor::Executors;
use crate::sdp::{set_preferred_codecs, set_start_video_bandwidth, MediaKind, SessionDescription};

/// What to do after the engine reports the stable signaling state
#[derive(Debug, Clone, PartialEq)]
pub enum StableAction {
    /// Not stable, nothing to do
    None,
    /// A restart was requested mid-negotiation: offer again with new credentials
    Restart,
    /// Send these buffered candidates, in order
    Flush(Vec<IceCandidate>),
}

struct HandleSlot {
    handle: Option<Arc<dyn MediaSessionHandle>>,
    ended: bool,
}

struct Negotiation {
    /// Signaling state as last reported through engine events
    signaling: SignalingState,
    local_candidates: FifoBuffer<IceCandidate>,
    remote_candidates: FifoBuffer<IceCandidate>,
    remote_description_set: bool,
    ice_restart_pending: bool,
    negotiation_needed: bool,
    pending_remote: Option<SessionDescription>,
}

impl Default for Negotiation {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            local_candidates: FifoBuffer::new(),
            remote_candidates: FifoBuffer::new(),
            remote_description_set: false,
            ice_restart_pending: false,
            negotiation_needed: false,
            pending_remote: None,
        }
    }
}

/// Owner of one media-session handle.
///
/// The handle is released at most once. Once released, every accessor
/// refuses to hand it out, so results of engine calls still in flight are
/// simply discarded by their callers.
pub struct ChannelCore {
    key: String,
    session_id: Mutex<Option<String>>,
    config: ChannelConfig,
    executors: Executors,
    slot: Mutex<HandleSlot>,
    state: watch::Sender<SessionState>,
    negotiation: Mutex<Negotiation>,
}

impl std::fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCore")
            .field("key", &self.key)
            .field("session_id", &*self.session_id.lock())
            .field("state", &self.state())
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl ChannelCore {
    pub fn new(key: impl Into<String>, config: ChannelConfig, executors: Executors) -> Self {
        let (state, _) = watch::channel(SessionState::Ready);
        Self {
            key: key.into(),
            session_id: Mutex::new(None),
            config,
            executors,
            slot: Mutex::new(HandleSlot {
                handle: None,
                ended: false,
            }),
            state,
            negotiation: Mutex::new(Negotiation::default()),
        }
    }

    /// Label used in logs: the remote id for P2P, a local key for conference
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn executors(&self) -> &Executors {
        &self.executors
    }

    /// Id assigned by the remote party or server once negotiation starts
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    pub fn set_session_id(&self, id: impl Into<String>) {
        *self.session_id.lock() = Some(id.into());
    }

    // ===== HANDLE OWNERSHIP =====

    /// Create the engine session this channel will own
    pub async fn attach(&self, engine: &dyn MediaEngine) -> Result<mpsc::UnboundedReceiver<EngineEvent>> {
        let session = engine
            .create_session(&EngineSessionConfig {
                ice_servers: self.config.ice_servers.clone(),
                continual_ice_gathering: self.config.continual_ice_gathering,
            })
            .await?;
        let ended = {
            let mut slot = self.slot.lock();
            if !slot.ended {
                slot.handle = Some(session.handle.clone());
            }
            slot.ended
        };
        if ended {
            session.handle.close().await;
            return Err(SessionError::invalid_state("channel closed while attaching"));
        }
        debug!(channel = %self.key, "Media session attached");
        Ok(session.events)
    }

    /// The live handle, if any
    pub fn handle(&self) -> Option<Arc<dyn MediaSessionHandle>> {
        let slot = self.slot.lock();
        if slot.ended {
            None
        } else {
            slot.handle.clone()
        }
    }

    /// The live handle, or an error once the channel is released
    pub fn engine(&self) -> Result<Arc<dyn MediaSessionHandle>> {
        let slot = self.slot.lock();
        if slot.ended {
            return Err(SessionError::invalid_state("channel is closed"));
        }
        slot.handle
            .clone()
            .ok_or_else(|| SessionError::invalid_state("no media session attached"))
    }

    pub fn is_ended(&self) -> bool {
        self.slot.lock().ended
    }

    /// Release the handle and enter `Closed`. Returns false if the channel
    /// was already released.
    pub async fn release(&self) -> bool {
        let handle = {
            let mut slot = self.slot.lock();
            if slot.ended {
                return false;
            }
            slot.ended = true;
            slot.handle.take()
        };
        self.transition(SessionState::Closed);
        {
            let mut negotiation = self.negotiation.lock();
            negotiation.local_candidates.clear();
            negotiation.remote_candidates.clear();
            negotiation.pending_remote = None;
        }
        if let Some(handle) = handle {
            handle.close().await;
        }
        info!(channel = %self.key, "Channel released");
        true
    }

    // ===== STATE MACHINE =====

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Move to `next` if the transition is allowed
    pub fn transition(&self, next: SessionState) -> bool {
        let mut from = SessionState::Closed;
        let changed = self.state.send_if_modified(|current| {
            from = *current;
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(channel = %self.key, from = %from, to = %next, "Session state changed");
        } else {
            trace!(channel = %self.key, current = %from, requested = %next, "Transition ignored");
        }
        changed
    }

    // ===== DESCRIPTIONS =====

    fn rewrite(&self, sdp: &str) -> String {
        let sdp = set_preferred_codecs(sdp, &self.config.audio_codecs, MediaKind::Audio);
        set_preferred_codecs(&sdp, &self.config.video_codecs, MediaKind::Video)
    }

    /// Create an offer, apply codec preferences and the start bitrate hint,
    /// then set it as local description
    pub async fn create_and_set_local_offer(&self, options: OfferOptions) -> Result<SessionDescription> {
        let offer = self.engine()?.create_offer(options).await?;
        let mut sdp = self.rewrite(&offer.sdp);
        if self.config.start_video_bitrate_kbps > 0 {
            sdp = set_start_video_bandwidth(&sdp, self.config.start_video_bitrate_kbps);
        }
        let description = SessionDescription {
            sdp_type: offer.sdp_type,
            sdp,
        };
        self.engine()?.set_local_description(description.clone()).await?;
        trace!(channel = %self.key, ice_restart = options.ice_restart, "Local offer set");
        Ok(description)
    }

    pub async fn create_and_set_local_answer(&self) -> Result<SessionDescription> {
        let answer = self.engine()?.create_answer().await?;
        let description = SessionDescription {
            sdp_type: answer.sdp_type,
            sdp: self.rewrite(&answer.sdp),
        };
        self.engine()?.set_local_description(description.clone()).await?;
        trace!(channel = %self.key, "Local answer set");
        Ok(description)
    }

    /// Apply a remote description, then every candidate that arrived early
    pub async fn apply_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = SessionDescription {
            sdp_type: description.sdp_type,
            sdp: self.rewrite(&description.sdp),
        };
        self.engine()?.set_remote_description(description).await?;
        let early = {
            let mut negotiation = self.negotiation.lock();
            negotiation.remote_description_set = true;
            negotiation.remote_candidates.drain()
        };
        if !early.is_empty() {
            debug!(channel = %self.key, count = early.len(), "Applying buffered remote candidates");
        }
        for candidate in early {
            self.engine()?.add_ice_candidate(&candidate).await?;
        }
        Ok(())
    }

    /// Apply a remote candidate, or hold it until the remote description is set
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        {
            let mut negotiation = self.negotiation.lock();
            if !negotiation.remote_description_set {
                negotiation.remote_candidates.push(candidate);
                return Ok(());
            }
        }
        self.engine()?.add_ice_candidate(&candidate).await
    }

    /// Current signaling state straight from the engine
    pub fn signaling_state(&self) -> Option<SignalingState> {
        self.handle().map(|h| h.signaling_state())
    }

    pub fn is_stable(&self) -> bool {
        self.signaling_state() == Some(SignalingState::Stable)
    }

    // ===== CANDIDATES AND RESTARTS =====

    /// A locally gathered candidate. Returns it when it may be sent now;
    /// otherwise it is buffered until the next stable state.
    pub fn on_local_candidate(&self, candidate: IceCandidate) -> Option<IceCandidate> {
        let mut negotiation = self.negotiation.lock();
        if negotiation.signaling == SignalingState::Stable {
            Some(candidate)
        } else {
            negotiation.local_candidates.push(candidate);
            None
        }
    }

    /// Track an engine signaling state report
    pub fn on_signaling_change(&self, state: SignalingState) -> StableAction {
        let mut negotiation = self.negotiation.lock();
        negotiation.signaling = state;
        if state != SignalingState::Stable {
            return StableAction::None;
        }
        if negotiation.ice_restart_pending {
            negotiation.ice_restart_pending = false;
            let dropped = negotiation.local_candidates.clear();
            trace!(channel = %self.key, dropped, "Restart pending, candidates discarded");
            StableAction::Restart
        } else {
            StableAction::Flush(negotiation.local_candidates.drain())
        }
    }

    /// Returns true when the restart can start right away. Otherwise
    /// candidates of the current generation are discarded and the restart
    /// waits for the next stable state.
    pub fn request_ice_restart(&self) -> bool {
        let stable = self.is_stable();
        let mut negotiation = self.negotiation.lock();
        if stable && negotiation.signaling == SignalingState::Stable {
            return true;
        }
        let dropped = negotiation.local_candidates.clear();
        negotiation.ice_restart_pending = true;
        debug!(channel = %self.key, dropped, "ICE restart deferred until stable");
        false
    }

    pub fn buffered_local_candidates(&self) -> usize {
        self.negotiation.lock().local_candidates.len()
    }

    pub fn buffered_remote_candidates(&self) -> usize {
        self.negotiation.lock().remote_candidates.len()
    }

    // ===== DEFERRED NEGOTIATION =====

    /// Keep a remote offer that arrived mid-negotiation
    pub fn set_pending_remote(&self, description: SessionDescription) {
        let mut negotiation = self.negotiation.lock();
        if negotiation.pending_remote.is_some() {
            warn!(channel = %self.key, "Replacing an unapplied remote description");
        }
        negotiation.pending_remote = Some(description);
    }

    pub fn take_pending_remote(&self) -> Option<SessionDescription> {
        self.negotiation.lock().pending_remote.take()
    }

    pub fn set_negotiation_needed(&self) {
        self.negotiation.lock().negotiation_needed = true;
    }

    pub fn take_negotiation_needed(&self) -> bool {
        std::mem::take(&mut self.negotiation.lock().negotiation_needed)
    }

    // ===== MEDIA SETTINGS =====

    /// Push the configured sender caps to the engine
    pub async fn apply_bitrate_settings(&self) -> Result<()> {
        let handle = self.engine()?;
        if self.config.max_audio_bitrate_kbps > 0 {
            handle
                .set_max_bitrate(MediaKind::Audio, self.config.max_audio_bitrate_kbps as u64 * 1024)
                .await?;
        }
        if self.config.max_video_bitrate_kbps > 0 {
            handle
                .set_max_bitrate(MediaKind::Video, self.config.max_video_bitrate_kbps as u64 * 1024)
                .await?;
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<ConnectionStats> {
        self.engine()?.get_stats().await
    }
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        let handle = {
            let mut slot = self.slot.lock();
            slot.ended = true;
            slot.handle.take()
        };
        if let Some(handle) = handle {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { handle.close().await });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::LoopbackEngine;
    use crate::sdp::VideoCodec;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 1 127.0.0.1 {} typ host", n, 5000 + n),
            sdp_mid: "0".into(),
            sdp_mline_index: 0,
        }
    }

    async fn attached(config: ChannelConfig) -> (ChannelCore, LoopbackEngine) {
        let engine = LoopbackEngine::new();
        let core = ChannelCore::new("peer", config, Executors::new());
        core.attach(&engine).await.unwrap();
        (core, engine)
    }

    #[tokio::test]
    async fn test_local_candidates_buffer_until_stable() {
        let core = ChannelCore::new("peer", ChannelConfig::default(), Executors::new());
        assert_eq!(core.on_local_candidate(candidate(1)), Some(candidate(1)));

        assert_eq!(core.on_signaling_change(SignalingState::HaveLocalOffer), StableAction::None);
        assert_eq!(core.on_local_candidate(candidate(2)), None);
        assert_eq!(core.on_local_candidate(candidate(3)), None);
        assert_eq!(core.on_local_candidate(candidate(4)), None);
        assert_eq!(
            core.on_signaling_change(SignalingState::Stable),
            StableAction::Flush(vec![candidate(2), candidate(3), candidate(4)])
        );
        assert_eq!(core.buffered_local_candidates(), 0);
    }

    #[tokio::test]
    async fn test_restart_mid_negotiation_discards_candidates() {
        let (core, _engine) = attached(ChannelConfig::default()).await;
        core.create_and_set_local_offer(OfferOptions::default()).await.unwrap();
        core.on_signaling_change(SignalingState::HaveLocalOffer);
        core.on_local_candidate(candidate(1));

        assert!(!core.request_ice_restart());
        assert_eq!(core.buffered_local_candidates(), 0);
        core.on_local_candidate(candidate(2));
        assert_eq!(core.on_signaling_change(SignalingState::Stable), StableAction::Restart);
        assert_eq!(core.buffered_local_candidates(), 0);
    }

    #[tokio::test]
    async fn test_remote_candidates_wait_for_remote_description() {
        let (core, engine) = attached(ChannelConfig::default()).await;
        core.add_remote_candidate(candidate(7)).await.unwrap();
        assert_eq!(core.buffered_remote_candidates(), 1);
        let session = engine.latest_session().unwrap();
        assert!(!session.calls().contains(&"add_ice_candidate"));

        let remote = LoopbackEngine::new();
        let peer = ChannelCore::new("other", ChannelConfig::default(), Executors::new());
        peer.attach(&remote).await.unwrap();
        let offer = peer.create_and_set_local_offer(OfferOptions::default()).await.unwrap();
        core.apply_remote_description(offer).await.unwrap();

        assert_eq!(session.remote_candidates(), vec![candidate(7)]);
        core.add_remote_candidate(candidate(8)).await.unwrap();
        assert_eq!(session.remote_candidates().len(), 2);
    }

    #[tokio::test]
    async fn test_local_offer_uses_codec_preferences() {
        let config = ChannelConfig::default()
            .with_video_codecs(vec![VideoCodec::H264])
            .with_start_video_bitrate(500);
        let (core, engine) = attached(config).await;
        let offer = core.create_and_set_local_offer(OfferOptions::default()).await.unwrap();
        assert!(offer.sdp.contains("m=video 9 UDP/TLS/RTP/SAVPF 98 99 100 101"));
        assert!(!offer.sdp.contains("VP8"));
        assert!(offer.sdp.contains("x-google-start-bitrate=500"));
        let session = engine.latest_session().unwrap();
        assert_eq!(session.local_description(), Some(offer));
    }

    #[tokio::test]
    async fn test_release_closes_handle_once() {
        let (core, engine) = attached(ChannelConfig::default()).await;
        core.transition(SessionState::Matched);
        assert!(core.release().await);
        assert!(!core.release().await);
        assert_eq!(core.state(), SessionState::Closed);
        assert!(core.engine().is_err());
        assert!(!core.transition(SessionState::Connected));

        let session = engine.latest_session().unwrap();
        assert_eq!(session.close_count(), 1);
        assert_eq!(session.calls_after_close(), 0);
    }

    #[tokio::test]
    async fn test_bitrate_caps_in_bps() {
        let config = ChannelConfig::default().with_max_bitrates(32, 300);
        let (core, engine) = attached(config).await;
        core.apply_bitrate_settings().await.unwrap();
        let session = engine.latest_session().unwrap();
        assert_eq!(session.max_bitrate(MediaKind::Audio), Some(32 * 1024));
        assert_eq!(session.max_bitrate(MediaKind::Video), Some(300 * 1024));
    }
}
