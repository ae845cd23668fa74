//! Point-to-point session channel
//!
//! One channel per remote peer. Besides offer/answer it runs the peer
//! application protocol: user-agent exchange, track-source and stream-info
//! announcements, `chat-tracks-added` acknowledgements that complete a
//! publish, text messages over the `message` data channel, and
//! `chat-closed`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::base::{ChannelCore, StableAction};
use super::buffer::FifoBuffer;
use super::{spawn_event_pump, Role, SessionChannel, SessionState};
use crate::config::{ChannelConfig, UserAgentConfig};
use crate::engine::{
    ConnectionStats, EngineEvent, IceCandidate, IceConnectionState, LocalStream, MediaEngine,
    MediaTrack, OfferOptions, RemoteStream, SignalingState, TrackSource,
};
use crate::errors::{Result, SessionError};
use crate::executor::{Completion, Executors, PendingResult, TaskQueue};
use crate::sdp::SessionDescription;
use crate::signaling::messages::{
    CloseInfo, P2PMessage, PeerCapabilities, SignalPayload, StreamInfo, TextMessage,
    TrackSourceEntry, UserAgentInfo, TEXT_CHANNEL_LABEL,
};
use crate::signaling::P2PSignalingChannel;

/// Largest text message accepted by [`P2PChannel::send`]
pub const MAX_MESSAGE_LENGTH: usize = 0xFFFF;

/// Notifications from a P2P channel, delivered on the event queue
pub trait P2PChannelObserver: Send + Sync + 'static {
    /// The session ended. `instance_id` tells replaced channels apart.
    fn on_stopped(&self, remote_id: &str, instance_id: &str);

    fn on_stream_added(&self, stream: RemoteStream);

    fn on_stream_ended(&self, remote_id: &str, stream_id: &str);

    fn on_message_received(&self, remote_id: &str, message: String);

    /// Failure of an established session, followed by `on_stopped`
    fn on_error(&self, remote_id: &str, error: SessionError);
}

/// Everything a channel needs from its owning client
#[derive(Clone)]
pub struct P2PChannelContext {
    pub local_id: String,
    pub signaling: Arc<dyn P2PSignalingChannel>,
    pub engine: Arc<dyn MediaEngine>,
    pub config: ChannelConfig,
    pub user_agent: UserAgentConfig,
    pub executors: Executors,
    pub observer: Weak<dyn P2PChannelObserver>,
}

type PublishEntry = (LocalStream, Completion<()>);

#[derive(Default)]
struct P2PInner {
    ua_sent: bool,
    remote_user_agent: Option<UserAgentInfo>,
    remote_capabilities: PeerCapabilities,

    pending_publish: FifoBuffer<LocalStream>,
    pending_unpublish: FifoBuffer<LocalStream>,
    /// stream id -> stream and its publish result, until the peer confirms
    publishing: HashMap<String, PublishEntry>,
    published: HashMap<String, LocalStream>,
    /// local track id -> stream id
    local_track_streams: HashMap<String, String>,
    latest_publish: Option<LocalStream>,

    pending_messages: FifoBuffer<(TextMessage, Completion<()>)>,
    message_seq: u64,
    data_channel_requested: bool,

    remote_track_sources: HashMap<String, TrackSource>,
    remote_stream_infos: HashMap<String, StreamInfo>,
    remote_tracks: HashMap<String, Vec<MediaTrack>>,
    announced_streams: HashSet<String>,

    ice_state: Option<IceConnectionState>,
    watchdog_epoch: u64,
    abandoned: bool,
}

/// Session with one remote peer
pub struct P2PChannel {
    core: ChannelCore,
    instance_id: String,
    local_id: String,
    remote_id: String,
    signaling: Arc<dyn P2PSignalingChannel>,
    outbound: TaskQueue,
    observer: Weak<dyn P2PChannelObserver>,
    user_agent: UserAgentConfig,
    created_at: Instant,
    inner: Mutex<P2PInner>,
    weak_self: Weak<P2PChannel>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for P2PChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2PChannel")
            .field("instance_id", &self.instance_id)
            .field("remote_id", &self.remote_id)
            .field("state", &self.core.state())
            .finish()
    }
}

impl P2PChannel {
    /// Create a channel to `remote_id` with a fresh engine session
    pub async fn create(context: &P2PChannelContext, remote_id: &str) -> Result<Arc<Self>> {
        let channel = Arc::new_cyclic(|weak| P2PChannel {
            core: ChannelCore::new(remote_id, context.config.clone(), context.executors.clone()),
            instance_id: Uuid::new_v4().to_string(),
            local_id: context.local_id.clone(),
            remote_id: remote_id.to_string(),
            signaling: context.signaling.clone(),
            outbound: TaskQueue::new("p2p-outbound"),
            observer: context.observer.clone(),
            user_agent: context.user_agent.clone(),
            created_at: Instant::now(),
            inner: Mutex::new(P2PInner::default()),
            weak_self: weak.clone(),
            pump: Mutex::new(None),
        });
        let events = channel.core.attach(context.engine.as_ref()).await?;
        let pump = spawn_event_pump(
            Arc::downgrade(&channel),
            context.executors.engine.clone(),
            events,
        );
        *channel.pump.lock() = Some(pump);
        info!(remote = %remote_id, instance = %channel.instance_id, "P2P channel created");
        Ok(channel)
    }

    // ===== ACCESSORS =====

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn subscribe_state(&self) -> tokio::sync::watch::Receiver<SessionState> {
        self.core.subscribe_state()
    }

    pub fn is_abandoned(&self) -> bool {
        self.inner.lock().abandoned
    }

    pub fn is_ended(&self) -> bool {
        self.core.is_ended()
    }

    /// The engine holds a local offer the peer has not answered yet
    pub fn have_local_offer(&self) -> bool {
        self.core.signaling_state() == Some(SignalingState::HaveLocalOffer)
    }

    pub fn ice_state(&self) -> Option<IceConnectionState> {
        self.inner.lock().ice_state
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn remote_capabilities(&self) -> PeerCapabilities {
        self.inner.lock().remote_capabilities.clone()
    }

    pub fn remote_user_agent(&self) -> Option<UserAgentInfo> {
        self.inner.lock().remote_user_agent.clone()
    }

    /// Ids of streams the peer has confirmed
    pub fn published_streams(&self) -> Vec<String> {
        self.inner.lock().published.keys().cloned().collect()
    }

    /// Older than `max_age` while the ICE state is one of `states`, or no
    /// longer usable at all
    pub fn is_stale(&self, max_age: Duration, states: &[IceConnectionState]) -> bool {
        if self.is_abandoned() || self.core.is_ended() {
            return true;
        }
        let ice = self.ice_state().unwrap_or(IceConnectionState::New);
        self.age() > max_age && states.contains(&ice)
    }

    // ===== PUBLIC REQUESTS =====

    fn post<F, Fut>(&self, job: F)
    where
        F: FnOnce(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if let Some(this) = self.weak_self.upgrade() {
            self.core.executors().engine.post(async move { job(this).await });
        }
    }

    fn completion<T: Send + 'static>(&self) -> (Completion<T>, PendingResult<T>) {
        Completion::new(&self.core.executors().events)
    }

    /// Publish a local stream to the peer. Resolves once the peer reports
    /// the stream's tracks.
    pub fn publish(&self, stream: LocalStream) -> PendingResult<()> {
        let (completion, pending) = self.completion();
        self.resume_publish(stream, completion);
        pending
    }

    /// Publish with a result slot taken from another channel
    pub fn resume_publish(&self, stream: LocalStream, completion: Completion<()>) {
        if stream.tracks.is_empty() {
            completion.fail(SessionError::invalid_argument("stream has no tracks"));
            return;
        }
        if stream.is_ended() {
            completion.fail(SessionError::invalid_argument("stream has ended"));
            return;
        }
        self.post(move |this| async move { this.do_publish(stream, completion).await });
    }

    pub fn unpublish(&self, stream: &LocalStream) -> PendingResult<()> {
        let (completion, pending) = self.completion();
        let stream_id = stream.id.clone();
        self.post(move |this| async move { this.do_unpublish(stream_id, completion).await });
        pending
    }

    /// Send a text message over the data channel
    pub fn send(&self, message: impl Into<String>) -> PendingResult<()> {
        let message = message.into();
        let (completion, pending) = self.completion();
        if message.len() > MAX_MESSAGE_LENGTH {
            completion.fail(SessionError::invalid_argument("message is too long"));
            return pending;
        }
        self.post(move |this| async move { this.do_send(message, completion).await });
        pending
    }

    pub fn stop(&self) -> PendingResult<()> {
        let (completion, pending) = self.completion();
        self.post(move |this| async move {
            match this.core.state() {
                SessionState::Offered
                | SessionState::Matched
                | SessionState::Connecting
                | SessionState::Connected => {
                    this.terminate(true, SessionError::invalid_state("session stopped"))
                        .await;
                    completion.succeed(());
                }
                _ => completion.fail(SessionError::invalid_state("session not started")),
            }
        });
        pending
    }

    pub fn get_stats(&self) -> PendingResult<ConnectionStats> {
        let (completion, pending) = self.completion();
        self.post(move |this| async move {
            if this.core.state() != SessionState::Connected {
                completion.fail(SessionError::invalid_state("session is not connected"));
                return;
            }
            completion.complete(this.core.stats().await);
        });
        pending
    }

    /// Restart ICE now if stable, otherwise at the next stable state
    pub fn ice_restart(&self) {
        self.post(|this| async move {
            if this.core.request_ice_restart() {
                this.offer(OfferOptions {
                    ice_restart: true,
                    ..Default::default()
                })
                .await;
            }
        });
    }

    /// Queue a message received from the peer for processing
    pub fn on_incoming_message(&self, message: P2PMessage) {
        self.post(|this| async move {
            let kind = message.kind();
            if let Err(error) = this.clone().handle_signaling_message(message).await {
                warn!(remote = %this.remote_id, kind, %error, "Failed to handle peer message");
            }
        });
    }

    // ===== HAND-OVER BETWEEN CHANNEL INSTANCES =====

    /// Take the most recent publish request so a replacement channel can
    /// carry it. The result slot is absent once the peer confirmed it.
    pub fn take_latest_publish(&self) -> Option<(LocalStream, Option<Completion<()>>)> {
        let mut inner = self.inner.lock();
        let stream = inner.latest_publish.take()?;
        inner.pending_publish.remove_first(|s| s.id == stream.id);
        let completion = inner.publishing.remove(&stream.id).map(|(_, c)| c);
        Some((stream, completion))
    }

    /// Copy what the peer already told the channel this one replaces
    pub fn inherit_from(&self, previous: &P2PChannel) {
        let (user_agent, capabilities, sources, infos) = {
            let old = previous.inner.lock();
            (
                old.remote_user_agent.clone(),
                old.remote_capabilities.clone(),
                old.remote_track_sources.clone(),
                old.remote_stream_infos.clone(),
            )
        };
        let mut inner = self.inner.lock();
        inner.remote_user_agent = user_agent;
        inner.remote_capabilities = capabilities;
        inner.remote_track_sources.extend(sources);
        inner.remote_stream_infos.extend(infos);
    }

    /// Drop the session without telling the peer. Outstanding requests fail.
    pub async fn abandon(&self, reason: &str) {
        info!(remote = %self.remote_id, instance = %self.instance_id, reason, "Abandoning channel");
        self.inner.lock().abandoned = true;
        self.fail_all(SessionError::invalid_state(format!("channel abandoned: {}", reason)));
        self.core.release().await;
    }

    // ===== OUTBOUND =====

    fn send_signaling(&self, message: P2PMessage) {
        let kind = message.kind();
        let text = match message.to_text() {
            Ok(text) => text,
            Err(error) => {
                error!(kind, %error, "Failed to serialize peer message");
                return;
            }
        };
        let signaling = self.signaling.clone();
        let remote = self.remote_id.clone();
        let weak = self.weak_self.clone();
        trace!(remote = %remote, kind, "Queueing peer message");
        self.outbound.post(async move {
            let Err(error) = signaling.send_message(&remote, &text).await else {
                return;
            };
            warn!(remote = %remote, kind, %error, "Peer message not delivered");
            if matches!(error, SessionError::TargetUnreachable { .. }) {
                if let Some(this) = weak.upgrade() {
                    let queue = this.core.executors().engine.clone();
                    queue.post(async move { this.on_target_unreachable(error).await });
                }
            }
        });
    }

    fn ensure_user_agent_sent(&self) {
        let first = !std::mem::replace(&mut self.inner.lock().ua_sent, true);
        if first {
            let capabilities = PeerCapabilities {
                continual_ice_gathering: self.core.config().continual_ice_gathering,
                unified_plan: true,
                stream_removable: true,
                ignore_data_channel_acks: true,
            };
            self.send_signaling(P2PMessage::UserAgent(UserAgentInfo::from_config(
                &self.user_agent,
                Some(capabilities),
            )));
        }
    }

    fn send_local_stream_info(&self, stream: &LocalStream) {
        let sources = stream
            .tracks
            .iter()
            .map(|t| TrackSourceEntry {
                id: t.id.clone(),
                source: t.source,
            })
            .collect();
        self.send_signaling(P2PMessage::TrackSources(sources));
        self.send_signaling(P2PMessage::StreamInfo(StreamInfo {
            id: stream.id.clone(),
            tracks: stream.tracks.iter().map(|t| t.id.clone()).collect(),
            source: crate::engine::StreamSourceInfo {
                audio: stream.source_of(crate::sdp::MediaKind::Audio),
                video: stream.source_of(crate::sdp::MediaKind::Video),
            },
            attributes: stream.attributes.clone(),
        }));
    }

    // ===== OBSERVER =====

    fn notify<F>(&self, f: F)
    where
        F: FnOnce(&dyn P2PChannelObserver) + Send + 'static,
    {
        let observer = self.observer.clone();
        self.core.executors().events.post(async move {
            if let Some(observer) = observer.upgrade() {
                f(observer.as_ref());
            }
        });
    }

    fn notify_stopped(&self) {
        let remote = self.remote_id.clone();
        let instance = self.instance_id.clone();
        self.notify(move |o| o.on_stopped(&remote, &instance));
    }

    fn notify_error(&self, error: SessionError) {
        let remote = self.remote_id.clone();
        self.notify(move |o| o.on_error(&remote, error));
    }

    // ===== REQUEST HANDLERS =====

    async fn do_publish(&self, stream: LocalStream, completion: Completion<()>) {
        if self.core.is_ended() {
            completion.fail(SessionError::invalid_state("channel is closed"));
            return;
        }
        {
            let mut inner = self.inner.lock();
            if inner.publishing.contains_key(&stream.id) || inner.published.contains_key(&stream.id) {
                completion.fail(SessionError::invalid_argument("the stream is already published"));
                return;
            }
            for track in &stream.tracks {
                inner
                    .local_track_streams
                    .insert(track.id.clone(), stream.id.clone());
            }
            inner.latest_publish = Some(stream.clone());
            inner
                .publishing
                .insert(stream.id.clone(), (stream.clone(), completion));
            inner.pending_publish.push(stream);
        }
        self.ensure_user_agent_sent();
        if self.core.state() == SessionState::Ready {
            self.core.transition(SessionState::Offered);
        }
        if self.core.is_stable() {
            self.drain_pending_streams().await;
        }
    }

    async fn do_unpublish(&self, stream_id: String, completion: Completion<()>) {
        if self.core.is_ended() {
            completion.fail(SessionError::invalid_state("channel is closed"));
            return;
        }
        {
            let mut inner = self.inner.lock();
            if !inner.remote_capabilities.stream_removable {
                completion.fail(SessionError::not_supported("stream removal by the remote peer"));
                return;
            }
            let Some(stream) = inner.published.remove(&stream_id) else {
                completion.fail(SessionError::invalid_argument("the stream is not published"));
                return;
            };
            for track in &stream.tracks {
                inner.local_track_streams.remove(&track.id);
            }
            if inner.latest_publish.as_ref().map(|s| s.id == stream_id).unwrap_or(false) {
                inner.latest_publish = None;
            }
            inner.pending_unpublish.push(stream);
        }
        completion.succeed(());
        if self.core.is_stable() {
            self.drain_pending_streams().await;
        }
    }

    async fn do_send(&self, message: String, completion: Completion<()>) {
        if self.core.is_ended() {
            completion.fail(SessionError::invalid_state("channel is closed"));
            return;
        }
        self.ensure_user_agent_sent();
        if self.core.state() == SessionState::Ready {
            self.core.transition(SessionState::Offered);
        }
        let create_channel = {
            let mut inner = self.inner.lock();
            inner.message_seq += 1;
            let id = inner.message_seq.to_string();
            inner.pending_messages.push((TextMessage { id, data: message }, completion));
            !std::mem::replace(&mut inner.data_channel_requested, true)
        };
        let open = self
            .core
            .handle()
            .map(|h| h.is_data_channel_open())
            .unwrap_or(false);
        if open {
            self.drain_pending_messages().await;
            return;
        }
        if create_channel {
            let created = match self.core.engine() {
                Ok(handle) => handle.create_data_channel(TEXT_CHANNEL_LABEL).await,
                Err(error) => Err(error),
            };
            if let Err(error) = created {
                warn!(remote = %self.remote_id, %error, "Could not create data channel");
                let batch = self.inner.lock().pending_messages.drain();
                for (_, completion) in batch {
                    completion.fail(error.clone());
                }
                return;
            }
            self.offer(OfferOptions::default()).await;
        }
    }

    // ===== NEGOTIATION =====

    /// Offer now if the engine is stable, otherwise at the next stable state
    async fn offer(&self, options: OfferOptions) {
        if !self.core.is_stable() {
            self.core.set_negotiation_needed();
            return;
        }
        match self.core.create_and_set_local_offer(options).await {
            Ok(offer) => {
                self.core.transition(SessionState::Connecting);
                if let Some(payload) = SignalPayload::from_description(&offer) {
                    self.send_signaling(P2PMessage::Signal(payload));
                }
            }
            Err(error) => self.fail_negotiation(error).await,
        }
    }

    async fn answer(&self) {
        match self.core.create_and_set_local_answer().await {
            Ok(answer) => {
                if let Some(payload) = SignalPayload::from_description(&answer) {
                    self.send_signaling(P2PMessage::Signal(payload));
                }
            }
            Err(error) => self.fail_negotiation(error).await,
        }
    }

    async fn on_remote_offer(&self, offer: SessionDescription) {
        match self.core.signaling_state() {
            Some(SignalingState::Stable) => {
                self.core.transition(SessionState::Connecting);
                if let Err(error) = self.core.apply_remote_description(offer).await {
                    self.fail_negotiation(error).await;
                    return;
                }
                self.answer().await;
            }
            Some(SignalingState::HaveLocalOffer) => {
                // Collision with the peer's offer; our offer stands.
                warn!(remote = %self.remote_id, "Dropping remote offer while a local offer is outstanding");
            }
            Some(state) => {
                debug!(remote = %self.remote_id, ?state, "Deferring remote offer until stable");
                self.core.set_pending_remote(offer);
            }
            None => debug!(remote = %self.remote_id, "Remote offer after release ignored"),
        }
    }

    async fn on_remote_answer(&self, answer: SessionDescription) {
        if !self.have_local_offer() {
            warn!(remote = %self.remote_id, "Unexpected answer ignored");
            return;
        }
        if let Err(error) = self.core.apply_remote_description(answer).await {
            self.fail_negotiation(error).await;
        }
    }

    async fn fail_negotiation(&self, error: SessionError) {
        error!(remote = %self.remote_id, %error, "Negotiation failed");
        if self.core.state() == SessionState::Connected {
            self.notify_error(error.clone());
        }
        self.terminate(true, error).await;
    }

    async fn drain_pending_streams(&self) {
        let (publish, unpublish) = {
            let mut inner = self.inner.lock();
            (inner.pending_publish.drain(), inner.pending_unpublish.drain())
        };
        let mut renegotiate = false;
        for stream in publish {
            self.send_local_stream_info(&stream);
            for track in &stream.tracks {
                let added = match self.core.engine() {
                    Ok(handle) => handle.add_track(track, &stream.id).await,
                    Err(error) => Err(error),
                };
                if let Err(error) = added {
                    warn!(stream = %stream.id, track = %track.id, %error, "Adding track failed");
                    let entry = self.inner.lock().publishing.remove(&stream.id);
                    if let Some((_, completion)) = entry {
                        completion.fail(error);
                    }
                    break;
                }
            }
            renegotiate = true;
        }
        for stream in unpublish {
            for track in &stream.tracks {
                if let Ok(handle) = self.core.engine() {
                    if let Err(error) = handle.remove_track(&track.id).await {
                        warn!(track = %track.id, %error, "Removing track failed");
                    }
                }
            }
            self.send_signaling(P2PMessage::TracksRemoved(
                stream.tracks.iter().map(|t| t.id.clone()).collect(),
            ));
            renegotiate = true;
        }
        let needed = self.core.take_negotiation_needed();
        if renegotiate || needed {
            self.offer(OfferOptions::default()).await;
        }
    }

    async fn drain_pending_messages(&self) {
        let batch = self.inner.lock().pending_messages.drain();
        for (message, completion) in batch {
            let sent = match (self.core.engine(), serde_json::to_string(&message)) {
                (Ok(handle), Ok(text)) => handle.send_data(&text).await,
                (Err(error), _) => Err(error),
                (_, Err(error)) => Err(error.into()),
            };
            completion.complete(sent);
        }
    }

    // ===== ENGINE EVENTS =====

    async fn on_signaling_state(&self, state: SignalingState) {
        match self.core.on_signaling_change(state) {
            StableAction::None => return,
            StableAction::Restart => {
                self.offer(OfferOptions {
                    ice_restart: true,
                    ..Default::default()
                })
                .await;
                return;
            }
            StableAction::Flush(candidates) => {
                for candidate in candidates {
                    self.send_signaling(P2PMessage::Signal(SignalPayload::from_candidate(&candidate)));
                }
            }
        }
        if !self.core.is_stable() {
            return;
        }
        if let Some(offer) = self.core.take_pending_remote() {
            self.on_remote_offer(offer).await;
            return;
        }
        self.drain_pending_streams().await;
    }

    async fn on_ice_state(&self, state: IceConnectionState) {
        self.inner.lock().ice_state = Some(state);
        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                self.inner.lock().watchdog_epoch += 1;
                if self.core.transition(SessionState::Connected) {
                    info!(remote = %self.remote_id, "P2P session connected");
                }
                if let Err(error) = self.core.apply_bitrate_settings().await {
                    warn!(remote = %self.remote_id, %error, "Applying bitrate caps failed");
                }
                if self.core.is_stable() {
                    self.drain_pending_streams().await;
                }
            }
            IceConnectionState::Disconnected => self.arm_watchdog(),
            IceConnectionState::Failed => {
                let error = SessionError::engine("ICE connection failed");
                self.notify_error(error.clone());
                self.terminate(true, error).await;
            }
            IceConnectionState::Closed => {
                self.terminate(false, SessionError::engine("media session closed")).await;
            }
            IceConnectionState::New | IceConnectionState::Checking => {}
        }
    }

    fn arm_watchdog(&self) {
        let epoch = {
            let mut inner = self.inner.lock();
            inner.watchdog_epoch += 1;
            inner.watchdog_epoch
        };
        let timeout = self.core.config().disconnect_timeout;
        let weak = self.weak_self.clone();
        let queue = self.core.executors().engine.clone();
        debug!(remote = %self.remote_id, timeout_ms = timeout.as_millis() as u64, "ICE disconnected, watchdog armed");
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(this) = weak.upgrade() {
                queue.post(async move { this.check_watchdog(epoch, timeout).await });
            }
        });
    }

    async fn check_watchdog(&self, epoch: u64, timeout: Duration) {
        let expired = {
            let inner = self.inner.lock();
            inner.watchdog_epoch == epoch && inner.ice_state == Some(IceConnectionState::Disconnected)
        };
        if !expired || self.core.is_ended() {
            return;
        }
        warn!(remote = %self.remote_id, "ICE stayed disconnected, stopping session");
        let error = SessionError::timeout("ice reconnection", timeout.as_millis() as u64);
        self.notify_error(error.clone());
        self.terminate(true, error).await;
    }

    /// Build the remote stream once its info and all its tracks are known
    fn remote_stream_ready(&self, stream_id: &str) -> Option<RemoteStream> {
        let mut inner = self.inner.lock();
        if inner.announced_streams.contains(stream_id) {
            return None;
        }
        let info = inner.remote_stream_infos.get(stream_id)?;
        let arrived = inner.remote_tracks.get(stream_id)?;
        if !info.tracks.iter().all(|id| arrived.iter().any(|t| &t.id == id)) {
            return None;
        }
        let tracks = arrived
            .iter()
            .map(|t| {
                let mut track = t.clone();
                if let Some(source) = inner.remote_track_sources.get(&t.id) {
                    track.source = *source;
                }
                track
            })
            .collect();
        let stream = RemoteStream {
            id: stream_id.to_string(),
            origin: self.remote_id.clone(),
            tracks,
            source: info.source.clone(),
            attributes: info.attributes.clone(),
        };
        inner.announced_streams.insert(stream_id.to_string());
        Some(stream)
    }

    fn announce_if_ready(&self, stream_id: &str) {
        if let Some(stream) = self.remote_stream_ready(stream_id) {
            debug!(remote = %self.remote_id, stream = %stream.id, "Remote stream complete");
            self.send_signaling(P2PMessage::TracksAdded(
                stream.tracks.iter().map(|t| t.id.clone()).collect(),
            ));
            self.notify(move |o| o.on_stream_added(stream));
        }
    }

    fn on_remote_track(&self, stream_id: String, track: MediaTrack) {
        {
            let mut inner = self.inner.lock();
            let tracks = inner.remote_tracks.entry(stream_id.clone()).or_default();
            if !tracks.iter().any(|t| t.id == track.id) {
                tracks.push(track);
            }
        }
        self.announce_if_ready(&stream_id);
    }

    fn on_remote_stream_removed(&self, stream_id: &str) {
        let announced = {
            let mut inner = self.inner.lock();
            inner.remote_tracks.remove(stream_id);
            inner.remote_stream_infos.remove(stream_id);
            inner.announced_streams.remove(stream_id)
        };
        if announced {
            let remote = self.remote_id.clone();
            let stream = stream_id.to_string();
            self.notify(move |o| o.on_stream_ended(&remote, &stream));
        }
    }

    fn on_data_message(&self, text: &str) {
        let message: TextMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(error) => {
                warn!(remote = %self.remote_id, %error, "Malformed data channel message");
                return;
            }
        };
        let ignore_acks = self.inner.lock().remote_capabilities.ignore_data_channel_acks;
        if !ignore_acks {
            self.send_signaling(P2PMessage::DataReceived(message.id.clone()));
        }
        let remote = self.remote_id.clone();
        self.notify(move |o| o.on_message_received(&remote, message.data));
    }

    // ===== PEER MESSAGES =====

    fn on_user_agent(&self, info: UserAgentInfo) {
        {
            let mut inner = self.inner.lock();
            inner.remote_capabilities = info.capabilities.clone().unwrap_or_default();
            inner.remote_user_agent = Some(info);
        }
        self.ensure_user_agent_sent();
        if matches!(
            self.core.state(),
            SessionState::Ready | SessionState::Offered | SessionState::Pending
        ) {
            self.core.transition(SessionState::Matched);
        }
    }

    fn on_tracks_added(&self, track_ids: Vec<String>) {
        let confirmed: Vec<Completion<()>> = {
            let mut inner = self.inner.lock();
            let mut confirmed = Vec::new();
            for track_id in &track_ids {
                let Some(stream_id) = inner.local_track_streams.get(track_id).cloned() else {
                    continue;
                };
                if let Some((stream, completion)) = inner.publishing.remove(&stream_id) {
                    inner.published.insert(stream_id, stream);
                    confirmed.push(completion);
                }
            }
            confirmed
        };
        for completion in confirmed {
            completion.succeed(());
        }
    }

    // ===== TEARDOWN =====

    fn fail_all(&self, error: SessionError) {
        let (publishing, messages) = {
            let mut inner = self.inner.lock();
            inner.pending_publish.clear();
            inner.pending_unpublish.clear();
            let publishing: Vec<Completion<()>> =
                inner.publishing.drain().map(|(_, (_, c))| c).collect();
            (publishing, inner.pending_messages.drain())
        };
        for completion in publishing {
            completion.fail(error.clone());
        }
        for (_, completion) in messages {
            completion.fail(error.clone());
        }
    }

    fn end_remote_streams(&self) {
        let announced: Vec<String> = self.inner.lock().announced_streams.drain().collect();
        for stream_id in announced {
            let remote = self.remote_id.clone();
            self.notify(move |o| o.on_stream_ended(&remote, &stream_id));
        }
    }

    /// Stop the session once: optionally tell the peer, fail what is
    /// outstanding, release the handle and report the stop
    async fn terminate(&self, notify_peer: bool, error: SessionError) {
        if self.core.is_ended() {
            return;
        }
        if notify_peer {
            self.send_signaling(P2PMessage::Closed(None));
        }
        self.end_remote_streams();
        self.fail_all(error);
        self.core.release().await;
        self.notify_stopped();
    }

    async fn on_target_unreachable(&self, error: SessionError) {
        if self.core.is_ended() {
            return;
        }
        self.inner.lock().abandoned = true;
        self.fail_all(error);
        self.core.release().await;
    }
}

#[async_trait]
impl SessionChannel for P2PChannel {
    type Signal = P2PMessage;

    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn role(&self) -> Role {
        Role::Peer
    }

    async fn create_offer(self: Arc<Self>) -> Result<()> {
        self.offer(OfferOptions::default()).await;
        Ok(())
    }

    async fn create_answer(self: Arc<Self>) -> Result<()> {
        if self.core.signaling_state() != Some(SignalingState::HaveRemoteOffer) {
            return Err(SessionError::invalid_state("no remote offer to answer"));
        }
        self.answer().await;
        Ok(())
    }

    async fn handle_signaling_message(self: Arc<Self>, message: P2PMessage) -> Result<()> {
        if self.core.is_ended() {
            debug!(remote = %self.remote_id, kind = message.kind(), "Message for released channel ignored");
            return Ok(());
        }
        if self.core.state() == SessionState::Ready {
            self.core.transition(SessionState::Pending);
        }
        match message {
            P2PMessage::UserAgent(info) => self.on_user_agent(info),
            P2PMessage::Signal(SignalPayload::Offer { sdp }) => {
                self.on_remote_offer(SessionDescription::offer(sdp)).await
            }
            P2PMessage::Signal(SignalPayload::Answer { sdp }) => {
                self.on_remote_answer(SessionDescription::answer(sdp)).await
            }
            P2PMessage::Signal(SignalPayload::Candidates {
                candidate,
                sdp_mid,
                sdp_mline_index,
            }) => {
                let candidate = IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                };
                self.core.add_remote_candidate(candidate).await?;
            }
            P2PMessage::Signal(SignalPayload::RemovedCandidates { candidates }) => {
                debug!(remote = %self.remote_id, count = candidates.len(), "Peer removed candidates");
            }
            P2PMessage::TrackSources(entries) => {
                let mut inner = self.inner.lock();
                for entry in entries {
                    inner.remote_track_sources.insert(entry.id, entry.source);
                }
            }
            P2PMessage::StreamInfo(info) => {
                let stream_id = info.id.clone();
                self.inner.lock().remote_stream_infos.insert(stream_id.clone(), info);
                self.announce_if_ready(&stream_id);
            }
            P2PMessage::TracksAdded(track_ids) => self.on_tracks_added(track_ids),
            P2PMessage::TracksRemoved(track_ids) => {
                debug!(remote = %self.remote_id, tracks = ?track_ids, "Peer removed tracks");
            }
            P2PMessage::DataReceived(id) => {
                trace!(remote = %self.remote_id, id = %id, "Peer acknowledged message");
            }
            P2PMessage::Closed(info) => {
                let info: CloseInfo = info.unwrap_or_default();
                info!(remote = %self.remote_id, code = ?info.code, "Peer closed the session");
                self.terminate(false, SessionError::disconnected("stop message received"))
                    .await;
            }
        }
        Ok(())
    }

    async fn handle_engine_event(self: Arc<Self>, event: EngineEvent) {
        match event {
            EngineEvent::SignalingStateChanged(state) => self.on_signaling_state(state).await,
            EngineEvent::IceConnectionStateChanged(state) => self.on_ice_state(state).await,
            EngineEvent::IceCandidate(candidate) => {
                if let Some(candidate) = self.core.on_local_candidate(candidate) {
                    self.send_signaling(P2PMessage::Signal(SignalPayload::from_candidate(&candidate)));
                }
            }
            EngineEvent::IceCandidatesRemoved(candidates) => {
                self.send_signaling(P2PMessage::Signal(SignalPayload::RemovedCandidates { candidates }));
            }
            EngineEvent::TrackAdded { stream_id, track } => self.on_remote_track(stream_id, track),
            EngineEvent::StreamRemoved { stream_id } => self.on_remote_stream_removed(&stream_id),
            EngineEvent::RenegotiationNeeded => self.offer(OfferOptions::default()).await,
            EngineEvent::DataChannelOpen => self.drain_pending_messages().await,
            EngineEvent::DataChannelMessage(text) => self.on_data_message(&text),
        }
    }

    async fn close(self: Arc<Self>) {
        self.terminate(false, SessionError::disconnected("channel closed")).await;
    }
}

impl Drop for P2PChannel {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::LoopbackEngine;
    use crate::sdp::MediaKind;
    use crate::signaling::memory::{MemoryHub, MemorySignalingChannel};
    use crate::signaling::P2PSignalingEvent;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        stopped: Mutex<Vec<String>>,
        streams: Mutex<Vec<RemoteStream>>,
        messages: Mutex<Vec<String>>,
        errors: Mutex<Vec<SessionError>>,
    }

    impl P2PChannelObserver for Recorder {
        fn on_stopped(&self, remote_id: &str, _instance_id: &str) {
            self.stopped.lock().push(remote_id.to_string());
        }
        fn on_stream_added(&self, stream: RemoteStream) {
            self.streams.lock().push(stream);
        }
        fn on_stream_ended(&self, _remote_id: &str, _stream_id: &str) {}
        fn on_message_received(&self, _remote_id: &str, message: String) {
            self.messages.lock().push(message);
        }
        fn on_error(&self, _remote_id: &str, error: SessionError) {
            self.errors.lock().push(error);
        }
    }

    struct Side {
        channel: Arc<P2PChannel>,
        inbox: mpsc::UnboundedReceiver<P2PSignalingEvent>,
        recorder: Arc<Recorder>,
        engine: Arc<LoopbackEngine>,
    }

    async fn side(hub: &Arc<MemoryHub>, engine: Arc<LoopbackEngine>, local: &str, remote: &str) -> Side {
        let signaling: Arc<MemorySignalingChannel> = hub.channel();
        let (_, inbox) = signaling.connect(local).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn P2PChannelObserver> = recorder.clone();
        let context = P2PChannelContext {
            local_id: local.to_string(),
            signaling,
            engine: engine.clone(),
            config: ChannelConfig::default(),
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

    /// Relay messages between the two sides until `done` holds
    async fn pump_until(a: &mut Side, b: &mut Side, done: impl Fn(&Side, &Side) -> bool) {
        for _ in 0..500 {
            if done(a, b) {
                return;
            }
            while let Ok(P2PSignalingEvent::Message { message, .. }) = a.inbox.try_recv() {
                a.channel.on_incoming_message(P2PMessage::parse(&message).unwrap());
            }
            while let Ok(P2PSignalingEvent::Message { message, .. }) = b.inbox.try_recv() {
                b.channel.on_incoming_message(P2PMessage::parse(&message).unwrap());
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    fn camera_stream(id: &str) -> LocalStream {
        LocalStream::new(
            id,
            vec![
                MediaTrack::new(format!("{}-audio", id), MediaKind::Audio),
                MediaTrack::new(format!("{}-video", id), MediaKind::Video),
            ],
        )
    }

    async fn pair() -> (Side, Side, Arc<MemoryHub>) {
        let hub = MemoryHub::new();
        let engine = Arc::new(LoopbackEngine::new());
        let other = Arc::new(engine.sharing_network());
        let a = side(&hub, engine, "a", "b").await;
        let b = side(&hub, other, "b", "a").await;
        (a, b, hub)
    }

    #[tokio::test]
    async fn test_publish_completes_on_tracks_added() {
        let (mut a, mut b, hub) = pair().await;
        let pending = a.channel.publish(camera_stream("cam"));
        pump_until(&mut a, &mut b, |a, b| {
            a.channel.state() == SessionState::Connected
                && b.channel.state() == SessionState::Connected
                && !b.recorder.streams.lock().is_empty()
                && !a.channel.published_streams().is_empty()
        })
        .await;
        pending.wait().await.unwrap();

        let streams = b.recorder.streams.lock().clone();
        assert_eq!(streams[0].id, "cam");
        assert_eq!(streams[0].origin, "a");
        assert_eq!(streams[0].tracks.len(), 2);
        assert_eq!(hub.count_messages("a", "b", "chat-ua"), 1);
        assert_eq!(hub.count_messages("b", "a", "chat-ua"), 1);
        assert_eq!(hub.count_messages("b", "a", "chat-tracks-added"), 1);
    }

    #[tokio::test]
    async fn test_duplicate_publish_rejected() {
        let (a, _b, _hub) = pair().await;
        let _first = a.channel.publish(camera_stream("cam"));
        let second = a.channel.publish(camera_stream("cam"));
        assert!(matches!(
            second.wait().await,
            Err(SessionError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_text_message_over_data_channel() {
        let (mut a, mut b, _hub) = pair().await;
        let first = a.channel.send("hello");
        let second = a.channel.send("world");
        pump_until(&mut a, &mut b, |_, b| b.recorder.messages.lock().len() == 2).await;
        first.wait().await.unwrap();
        second.wait().await.unwrap();
        assert_eq!(*b.recorder.messages.lock(), vec!["hello".to_string(), "world".to_string()]);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (a, _b, _hub) = pair().await;
        let result = a.channel.send("x".repeat(MAX_MESSAGE_LENGTH + 1)).wait().await;
        assert!(matches!(result, Err(SessionError::InvalidArgument { .. })));
        assert_eq!(a.channel.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_stop_before_start_fails() {
        let (a, _b, _hub) = pair().await;
        let result = a.channel.stop().wait().await;
        assert!(matches!(result, Err(SessionError::InvalidState { .. })));
        assert!(!a.channel.is_ended());
    }

    #[tokio::test]
    async fn test_remote_stop_releases_once() {
        let (mut a, mut b, _hub) = pair().await;
        let _publish = a.channel.publish(camera_stream("cam"));
        pump_until(&mut a, &mut b, |a, _| a.channel.state() == SessionState::Connected).await;

        b.channel.stop().wait().await.unwrap();
        pump_until(&mut a, &mut b, |a, _| a.channel.is_ended()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*a.recorder.stopped.lock(), vec!["b".to_string()]);
        let session = a.engine.latest_session().unwrap();
        assert_eq!(session.close_count(), 1);
        assert_eq!(session.calls_after_close(), 0);
        assert_eq!(a.channel.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_unpublish_needs_removable_peer() {
        let (a, _b, _hub) = pair().await;
        let stream = camera_stream("cam");
        let result = a.channel.unpublish(&stream).wait().await;
        assert!(matches!(result, Err(SessionError::NotSupported { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_watchdog_stops_session() {
        let (mut a, mut b, _hub) = pair().await;
        let _publish = a.channel.publish(camera_stream("cam"));
        pump_until(&mut a, &mut b, |a, _| a.channel.state() == SessionState::Connected).await;

        let session = a.engine.latest_session().unwrap();
        session.set_ice_state(IceConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!a.channel.is_ended());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(a.channel.is_ended());
        assert!(matches!(a.recorder.errors.lock()[0], SessionError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_cancels_watchdog() {
        let (mut a, mut b, _hub) = pair().await;
        let _publish = a.channel.publish(camera_stream("cam"));
        pump_until(&mut a, &mut b, |a, _| a.channel.state() == SessionState::Connected).await;

        let session = a.engine.latest_session().unwrap();
        session.set_ice_state(IceConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_secs(3)).await;
        session.set_ice_state(IceConnectionState::Connected);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!a.channel.is_ended());
    }

    #[tokio::test]
    async fn test_ice_failure_reports_and_stops() {
        let (mut a, mut b, _hub) = pair().await;
        let _publish = a.channel.publish(camera_stream("cam"));
        pump_until(&mut a, &mut b, |a, _| a.channel.state() == SessionState::Connected).await;

        a.engine
            .latest_session()
            .unwrap()
            .set_ice_state(IceConnectionState::Failed);
        pump_until(&mut a, &mut b, |a, b| a.channel.is_ended() && b.channel.is_ended()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(a.recorder.errors.lock()[0], SessionError::Engine { .. }));
        assert_eq!(*b.recorder.stopped.lock(), vec!["a".to_string()]);
    }
}
