//! Conference session channel
//!
//! A conference session is either a publication (local stream sent to the
//! server) or a subscription (one server stream received). The server
//! assigns the session id in the `publish`/`subscribe` acknowledgement;
//! every later `soac`, control and stop request refers to it. The server
//! never offers, so these channels only create offers and apply answers.

use std::future::Future;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::base::{ChannelCore, StableAction};
use super::options::{MuteTarget, PublishOptions, RemoteStreamInfo, SubscribeOptions};
use super::{spawn_event_pump, Role, SessionChannel, SessionState};
use crate::config::ChannelConfig;
use crate::engine::{
    ConnectionStats, EngineEvent, IceCandidate, IceConnectionState, LocalStream, MediaEngine,
    MediaTrack, OfferOptions, RemoteStream, SignalingState,
};
use crate::errors::{Result, SessionError};
use crate::executor::{Completion, Executors, PendingResult};
use crate::sdp::{MediaKind, SessionDescription};
use crate::signaling::messages::{
    events, soac_payload, ConferenceCandidate, ConferenceSignal, ProgressStatus, RemovedCandidate,
};
use crate::signaling::SignalingTransport;

/// Notifications about an established conference session
pub trait ConferenceChannelObserver: Send + Sync + 'static {
    /// The session is over, for whatever reason
    fn on_ended(&self, session_id: &str);

    fn on_error(&self, session_id: &str, error: SessionError);
}

enum Request {
    Publish {
        stream: LocalStream,
        completion: Option<Completion<String>>,
    },
    Subscribe {
        info: RemoteStreamInfo,
        options: SubscribeOptions,
        completion: Option<Completion<RemoteStream>>,
    },
}

#[derive(Default)]
struct ConferenceInner {
    request: Option<Request>,
    remote_tracks: Vec<MediaTrack>,
    server_ready: bool,
    connected_once: bool,
}

/// One publication or subscription
pub struct ConferenceChannel {
    core: ChannelCore,
    role: Role,
    transport: Arc<SignalingTransport>,
    observer: Weak<dyn ConferenceChannelObserver>,
    inner: Mutex<ConferenceInner>,
    weak_self: Weak<ConferenceChannel>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConferenceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConferenceChannel")
            .field("role", &self.role)
            .field("session_id", &self.core.session_id())
            .field("state", &self.core.state())
            .finish()
    }
}

impl ConferenceChannel {
    pub async fn create(
        role: Role,
        transport: Arc<SignalingTransport>,
        engine: &dyn MediaEngine,
        config: ChannelConfig,
        executors: Executors,
        observer: Weak<dyn ConferenceChannelObserver>,
    ) -> Result<Arc<Self>> {
        if role == Role::Peer {
            return Err(SessionError::invalid_argument(
                "conference channels publish or subscribe",
            ));
        }
        let key = match role {
            Role::Publisher => "publication",
            _ => "subscription",
        };
        let channel = Arc::new_cyclic(|weak| ConferenceChannel {
            core: ChannelCore::new(key, config, executors.clone()),
            role,
            transport,
            observer,
            inner: Mutex::new(ConferenceInner::default()),
            weak_self: weak.clone(),
            pump: Mutex::new(None),
        });
        let events = channel.core.attach(engine).await?;
        let pump = spawn_event_pump(Arc::downgrade(&channel), executors.engine.clone(), events);
        *channel.pump.lock() = Some(pump);
        Ok(channel)
    }

    pub fn session_id(&self) -> Option<String> {
        self.core.session_id()
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn is_ended(&self) -> bool {
        self.core.is_ended()
    }

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

    // ===== REQUESTS =====

    /// Publish `stream`. Resolves with the session id once the server
    /// reports the publication ready.
    pub fn publish(&self, stream: LocalStream, options: PublishOptions) -> PendingResult<String> {
        let (completion, pending) = self.completion();
        if self.role != Role::Publisher {
            completion.fail(SessionError::invalid_state("channel does not publish"));
            return pending;
        }
        if stream.is_ended() {
            completion.fail(SessionError::invalid_argument("stream has ended"));
            return pending;
        }
        let payload = match options.to_payload(&stream) {
            Ok(payload) => payload,
            Err(error) => {
                completion.fail(error);
                return pending;
            }
        };
        self.post(move |this| async move {
            if !this.claim(Request::Publish {
                stream,
                completion: Some(completion),
            }) {
                return;
            }
            this.send_request(events::PUBLISH, payload);
        });
        pending
    }

    /// Subscribe to a remote stream. Resolves with the received stream once
    /// the server reports ready and the tracks arrived.
    pub fn subscribe(&self, info: RemoteStreamInfo, options: SubscribeOptions) -> PendingResult<RemoteStream> {
        let (completion, pending) = self.completion();
        if self.role != Role::Subscriber {
            completion.fail(SessionError::invalid_state("channel does not subscribe"));
            return pending;
        }
        if let Err(error) = options.validate(&info.capabilities) {
            completion.fail(error);
            return pending;
        }
        if options.audio.is_some() && !info.has_audio() || options.video.is_some() && !info.has_video() {
            completion.fail(SessionError::invalid_argument(
                "stream does not carry the requested media",
            ));
            return pending;
        }
        let payload = options.to_payload(&info.id);
        self.post(move |this| async move {
            if !this.claim(Request::Subscribe {
                info,
                options,
                completion: Some(completion),
            }) {
                return;
            }
            this.send_request(events::SUBSCRIBE, payload);
        });
        pending
    }

    /// Record the channel's only request. A second one is refused.
    fn claim(&self, request: Request) -> bool {
        let error = if self.core.is_ended() {
            SessionError::invalid_state("channel is closed")
        } else if self.inner.lock().request.is_some() {
            SessionError::invalid_state("channel already has a session")
        } else {
            self.inner.lock().request = Some(request);
            return true;
        };
        match request {
            Request::Publish { completion, .. } => completion.map(|c| c.fail(error)),
            Request::Subscribe { completion, .. } => completion.map(|c| c.fail(error)),
        };
        false
    }

    fn send_request(&self, event: &'static str, payload: Value) {
        let ack = self.transport.emit_request(event, payload);
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            let result = ack.wait().await;
            if let Some(this) = weak.upgrade() {
                let queue = this.core.executors().engine.clone();
                queue.post(async move { this.on_request_ack(result).await });
            }
        });
    }

    async fn on_request_ack(&self, result: Result<Value>) {
        if self.core.is_ended() {
            return;
        }
        let event = match self.role {
            Role::Publisher => events::PUBLISH,
            _ => events::SUBSCRIBE,
        };
        let session_id = result.and_then(|data| {
            data.get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| SessionError::server_rejected(event, "acknowledgement without session id"))
        });
        let session_id = match session_id {
            Ok(id) => id,
            Err(error) => {
                warn!(role = ?self.role, %error, "Server refused the session");
                self.fail_session(error).await;
                return;
            }
        };
        info!(role = ?self.role, session = %session_id, "Conference session assigned");
        self.core.set_session_id(session_id);
        self.core.transition(SessionState::Matched);

        let options = match self.role {
            Role::Publisher => {
                if let Err(error) = self.add_local_tracks().await {
                    self.fail_session(error).await;
                    return;
                }
                OfferOptions::default()
            }
            _ => {
                let inner = self.inner.lock();
                let (audio, video) = match &inner.request {
                    Some(Request::Subscribe { options, .. }) => {
                        (options.audio.is_some(), options.video.is_some())
                    }
                    _ => (false, false),
                };
                OfferOptions {
                    ice_restart: false,
                    offer_to_receive_audio: audio,
                    offer_to_receive_video: video,
                }
            }
        };
        self.offer(options).await;
    }

    async fn add_local_tracks(&self) -> Result<()> {
        let stream = match &self.inner.lock().request {
            Some(Request::Publish { stream, .. }) => stream.clone(),
            _ => return Err(SessionError::internal("publication without stream")),
        };
        let handle = self.core.engine()?;
        for track in &stream.tracks {
            handle.add_track(track, &stream.id).await?;
        }
        Ok(())
    }

    pub fn mute(&self, target: MuteTarget) -> PendingResult<()> {
        self.control(target, "pause")
    }

    pub fn unmute(&self, target: MuteTarget) -> PendingResult<()> {
        self.control(target, "play")
    }

    fn control(&self, target: MuteTarget, operation: &'static str) -> PendingResult<()> {
        let (completion, pending) = self.completion();
        let event = match self.role {
            Role::Publisher => events::STREAM_CONTROL,
            _ => events::SUBSCRIPTION_CONTROL,
        };
        self.post(move |this| async move {
            let Some(id) = this.live_session_id() else {
                completion.fail(SessionError::invalid_state("session is not established"));
                return;
            };
            let payload = json!({ "id": id, "operation": operation, "data": target.as_str() });
            this.forward_ack(event, payload, completion);
        });
        pending
    }

    /// Change the video parameters of a subscription
    pub fn update_subscription(&self, update: SubscribeOptions) -> PendingResult<()> {
        let (completion, pending) = self.completion();
        self.post(move |this| async move {
            let Some(id) = this.live_session_id() else {
                completion.fail(SessionError::invalid_state("session is not established"));
                return;
            };
            let checked = match &this.inner.lock().request {
                Some(Request::Subscribe { info, .. }) => update.validate(&info.capabilities),
                _ => Err(SessionError::invalid_state("channel does not subscribe")),
            };
            if let Err(error) = checked {
                completion.fail(error);
                return;
            }
            this.forward_ack(events::SUBSCRIPTION_CONTROL, update.update_payload(&id), completion);
        });
        pending
    }

    fn forward_ack(&self, event: &'static str, payload: Value, completion: Completion<()>) {
        let ack = self.transport.emit_request(event, payload);
        tokio::spawn(async move {
            completion.complete(ack.wait().await.map(|_| ()));
        });
    }

    pub fn get_stats(&self) -> PendingResult<ConnectionStats> {
        let (completion, pending) = self.completion();
        self.post(move |this| async move {
            if this.live_session_id().is_none() {
                completion.fail(SessionError::invalid_state("session is not established"));
                return;
            }
            completion.complete(this.core.stats().await);
        });
        pending
    }

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

    /// End the session and tell the server
    pub fn stop(&self) -> PendingResult<()> {
        let (completion, pending) = self.completion();
        self.post(move |this| async move {
            if this.core.is_ended() {
                completion.fail(SessionError::invalid_state("session already ended"));
                return;
            }
            this.terminate(true, SessionError::invalid_state("session stopped"))
                .await;
            completion.succeed(());
        });
        pending
    }

    /// Queue a `progress` notification addressed to this session
    pub fn on_progress(&self, status: ProgressStatus) {
        self.post(|this| async move {
            if let Err(error) = this.handle_signaling_message(status).await {
                warn!(%error, "Failed to handle progress");
            }
        });
    }

    fn live_session_id(&self) -> Option<String> {
        if self.core.is_ended() {
            return None;
        }
        self.core.session_id()
    }

    // ===== NEGOTIATION =====

    async fn offer(&self, options: OfferOptions) {
        if !self.core.is_stable() {
            self.core.set_negotiation_needed();
            return;
        }
        match self.core.create_and_set_local_offer(options).await {
            Ok(offer) => {
                self.core.transition(SessionState::Connecting);
                self.send_soac(ConferenceSignal::Offer { sdp: offer.sdp }, true);
            }
            Err(error) => self.fail_session(error).await,
        }
    }

    fn send_soac(&self, signal: ConferenceSignal, fatal: bool) {
        let Some(id) = self.core.session_id() else {
            warn!("soac without a session id dropped");
            return;
        };
        let payload = match soac_payload(&id, &signal) {
            Ok(payload) => payload,
            Err(error) => {
                error!(%error, "Failed to encode soac");
                return;
            }
        };
        let ack = self.transport.emit_request(events::SOAC, payload);
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            let Err(error) = ack.wait().await else {
                return;
            };
            warn!(session = %id, %error, "soac was not accepted");
            if fatal {
                if let Some(this) = weak.upgrade() {
                    let queue = this.core.executors().engine.clone();
                    queue.post(async move { this.fail_session(error).await });
                }
            }
        });
    }

    fn send_candidate(&self, candidate: &IceCandidate) {
        self.send_soac(
            ConferenceSignal::Candidate {
                candidate: ConferenceCandidate::from(candidate),
            },
            false,
        );
    }

    async fn on_answer(&self, sdp: String) {
        if self.core.signaling_state() != Some(SignalingState::HaveLocalOffer) {
            warn!(session = ?self.core.session_id(), "Answer without a local offer ignored");
            return;
        }
        if let Err(error) = self
            .core
            .apply_remote_description(SessionDescription::answer(sdp))
            .await
        {
            self.fail_session(error).await;
        }
    }

    async fn on_stable(&self, action: StableAction) {
        match action {
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
                for candidate in &candidates {
                    self.send_candidate(candidate);
                }
            }
        }
        if self.core.take_negotiation_needed() {
            self.offer(OfferOptions::default()).await;
        }
    }

    async fn on_ice_state(&self, state: IceConnectionState) {
        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                self.inner.lock().connected_once = true;
                if self.core.transition(SessionState::Connected) {
                    info!(session = ?self.core.session_id(), "Conference session connected");
                    if self.role == Role::Publisher {
                        if let Err(error) = self.core.apply_bitrate_settings().await {
                            warn!(%error, "Applying bitrate caps failed");
                        }
                    }
                }
            }
            IceConnectionState::Failed => {
                let error = if self.inner.lock().connected_once {
                    SessionError::engine("ICE connection lost")
                } else {
                    SessionError::engine("ICE connection failed")
                };
                self.fail_session(error).await;
            }
            IceConnectionState::Closed => {
                self.terminate(false, SessionError::engine("media session closed")).await;
            }
            _ => {}
        }
    }

    /// Resolve the subscription once the server is ready and every
    /// requested kind has a track
    fn try_complete_subscription(&self) {
        let mut inner = self.inner.lock();
        if !inner.server_ready {
            return;
        }
        let kinds_present = |kind: MediaKind| inner.remote_tracks.iter().any(|t| t.kind == kind);
        let stream = match &inner.request {
            Some(Request::Subscribe { info, options, .. }) => {
                if options.audio.is_some() && !kinds_present(MediaKind::Audio)
                    || options.video.is_some() && !kinds_present(MediaKind::Video)
                {
                    return;
                }
                RemoteStream {
                    id: info.id.clone(),
                    origin: info.origin.clone(),
                    tracks: inner.remote_tracks.clone(),
                    source: info.source.clone(),
                    attributes: info.attributes.clone(),
                }
            }
            _ => return,
        };
        if let Some(Request::Subscribe { completion, .. }) = inner.request.as_mut() {
            if let Some(completion) = completion.take() {
                completion.succeed(stream);
            }
        }
    }

    fn on_server_ready(&self) {
        self.inner.lock().server_ready = true;
        match self.role {
            Role::Publisher => {
                let id = self.core.session_id().unwrap_or_default();
                let completion = match self.inner.lock().request.as_mut() {
                    Some(Request::Publish { completion, .. }) => completion.take(),
                    _ => None,
                };
                if let Some(completion) = completion {
                    completion.succeed(id);
                }
            }
            _ => self.try_complete_subscription(),
        }
    }

    // ===== TEARDOWN =====

    /// Report a failure where the application will see it: the pending
    /// request if there is one, the observer otherwise. Then stop.
    async fn fail_session(&self, error: SessionError) {
        if self.core.is_ended() {
            return;
        }
        let pending = self.take_pending(error.clone());
        if !pending {
            if let Some(id) = self.core.session_id() {
                let observer = self.observer.clone();
                let reported = error.clone();
                self.core.executors().events.post(async move {
                    if let Some(observer) = observer.upgrade() {
                        observer.on_error(&id, reported);
                    }
                });
            }
        }
        self.terminate(true, error).await;
    }

    /// Fail the outstanding request, returning whether there was one
    fn take_pending(&self, error: SessionError) -> bool {
        let mut inner = self.inner.lock();
        match inner.request.as_mut() {
            Some(Request::Publish { completion, .. }) => completion.take().map(|c| c.fail(error)).is_some(),
            Some(Request::Subscribe { completion, .. }) => completion.take().map(|c| c.fail(error)).is_some(),
            None => false,
        }
    }

    async fn terminate(&self, notify_server: bool, error: SessionError) {
        if self.core.is_ended() {
            return;
        }
        self.take_pending(error);
        let session_id = self.core.session_id();
        if notify_server {
            if let Some(id) = &session_id {
                let event = match self.role {
                    Role::Publisher => events::UNPUBLISH,
                    _ => events::UNSUBSCRIBE,
                };
                let ack = self.transport.emit_request(event, json!({ "id": id }));
                let id = id.clone();
                tokio::spawn(async move {
                    if let Err(error) = ack.wait().await {
                        debug!(session = %id, %error, "Stop request not acknowledged");
                    }
                });
            }
        }
        self.core.release().await;
        if let Some(id) = session_id {
            let observer = self.observer.clone();
            self.core.executors().events.post(async move {
                if let Some(observer) = observer.upgrade() {
                    observer.on_ended(&id);
                }
            });
        }
    }
}

#[async_trait]
impl SessionChannel for ConferenceChannel {
    type Signal = ProgressStatus;

    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn role(&self) -> Role {
        self.role
    }

    async fn create_offer(self: Arc<Self>) -> Result<()> {
        if self.core.session_id().is_none() {
            return Err(SessionError::invalid_state("no session assigned yet"));
        }
        self.offer(OfferOptions::default()).await;
        Ok(())
    }

    async fn create_answer(self: Arc<Self>) -> Result<()> {
        Err(SessionError::not_supported("answering conference offers"))
    }

    async fn handle_signaling_message(self: Arc<Self>, status: ProgressStatus) -> Result<()> {
        if self.core.is_ended() {
            return Ok(());
        }
        match status {
            ProgressStatus::Soac(ConferenceSignal::Answer { sdp }) => self.on_answer(sdp).await,
            ProgressStatus::Soac(ConferenceSignal::Offer { .. }) => {
                warn!(session = ?self.core.session_id(), "Server offers are not supported");
            }
            ProgressStatus::Soac(ConferenceSignal::Candidate { candidate }) => {
                self.core
                    .add_remote_candidate(candidate.to_ice_candidate())
                    .await?;
            }
            ProgressStatus::Soac(ConferenceSignal::RemovedCandidates { candidates }) => {
                debug!(count = candidates.len(), "Server removed candidates");
            }
            ProgressStatus::Ready => self.on_server_ready(),
            ProgressStatus::Error(message) => {
                let error = SessionError::server_rejected(events::PROGRESS, message);
                self.fail_session(error).await;
            }
        }
        Ok(())
    }

    async fn handle_engine_event(self: Arc<Self>, event: EngineEvent) {
        match event {
            EngineEvent::SignalingStateChanged(state) => {
                let action = self.core.on_signaling_change(state);
                self.on_stable(action).await;
            }
            EngineEvent::IceConnectionStateChanged(state) => self.on_ice_state(state).await,
            EngineEvent::IceCandidate(candidate) => {
                if let Some(candidate) = self.core.on_local_candidate(candidate) {
                    self.send_candidate(&candidate);
                }
            }
            EngineEvent::IceCandidatesRemoved(candidates) => {
                let candidates = candidates
                    .iter()
                    .map(|c| RemovedCandidate {
                        candidate: format!("a={}", c.candidate),
                    })
                    .collect();
                self.send_soac(ConferenceSignal::RemovedCandidates { candidates }, false);
            }
            EngineEvent::TrackAdded { track, .. } => {
                if self.role == Role::Subscriber {
                    self.inner.lock().remote_tracks.push(track);
                    self.try_complete_subscription();
                }
            }
            EngineEvent::StreamRemoved { stream_id } => {
                debug!(stream = %stream_id, "Remote stream removed from session");
            }
            EngineEvent::RenegotiationNeeded => {
                debug!("Renegotiation is driven by the server, ignored");
            }
            EngineEvent::DataChannelOpen | EngineEvent::DataChannelMessage(_) => {}
        }
    }

    async fn close(self: Arc<Self>) {
        self.terminate(false, SessionError::disconnected("server disconnected"))
            .await;
    }
}

impl Drop for ConferenceChannel {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::engine::loopback::LoopbackEngine;
    use crate::engine::{EngineSessionConfig, MediaSessionHandle};
    use crate::signaling::memory::{memory_connection, MemoryServer};
    use crate::signaling::ticket::encode_json;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        ended: Mutex<Vec<String>>,
        errors: Mutex<Vec<SessionError>>,
    }

    impl ConferenceChannelObserver for Recorder {
        fn on_ended(&self, session_id: &str) {
            self.ended.lock().push(session_id.to_string());
        }
        fn on_error(&self, _session_id: &str, error: SessionError) {
            self.errors.lock().push(error);
        }
    }

    struct Fixture {
        transport: Arc<SignalingTransport>,
        server: MemoryServer,
        engine: Arc<LoopbackEngine>,
        recorder: Arc<Recorder>,
    }

    async fn fixture() -> Fixture {
        let (connection, mut server) = memory_connection();
        let transport = SignalingTransport::new(connection, TransportConfig::default());
        let token = encode_json(&json!({"host": "conference.test"}));
        let login = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.connect(&token).await })
        };
        let frame = server.next_named("login").await.unwrap();
        server.ok(frame.id, json!({"id": "me", "room": {"id": "room"}}));
        login.await.unwrap().unwrap();
        Fixture {
            transport,
            server,
            engine: Arc::new(LoopbackEngine::new()),
            recorder: Arc::new(Recorder::default()),
        }
    }

    async fn channel(f: &Fixture, role: Role) -> Arc<ConferenceChannel> {
        let observer: Arc<dyn ConferenceChannelObserver> = f.recorder.clone();
        ConferenceChannel::create(
            role,
            f.transport.clone(),
            f.engine.as_ref(),
            ChannelConfig::default(),
            Executors::new(),
            Arc::downgrade(&observer),
        )
        .await
        .unwrap()
    }

    fn camera() -> LocalStream {
        LocalStream::new(
            "local",
            vec![
                MediaTrack::new("mic", MediaKind::Audio),
                MediaTrack::new("cam", MediaKind::Video),
            ],
        )
    }

    /// Answer the client's offer from a fake media server session
    async fn answer_offer(f: &mut Fixture, media_server: &Arc<dyn MediaSessionHandle>, session: &str) -> String {
        let frame = f.server.next_named("soac").await.unwrap();
        assert_eq!(frame.payload["id"], session);
        assert_eq!(frame.payload["signaling"]["type"], "offer");
        let sdp = frame.payload["signaling"]["sdp"].as_str().unwrap().to_string();
        f.server.ok(frame.id, Value::Null);
        media_server
            .set_remote_description(SessionDescription::offer(sdp))
            .await
            .unwrap();
        let answer = media_server.create_answer().await.unwrap();
        media_server.set_local_description(answer.clone()).await.unwrap();
        answer.sdp
    }

    fn route_progress(channel: &ConferenceChannel, data: Value) {
        let notification =
            crate::signaling::ServerNotification::parse("progress", &data).unwrap();
        if let crate::signaling::ServerNotification::Progress(progress) = notification {
            channel.on_progress(progress.status);
        }
    }

    #[tokio::test]
    async fn test_publish_resolves_on_ready() {
        let mut f = fixture().await;
        let mcu_engine = f.engine.sharing_network();
        let media_server = mcu_engine
            .create_session(&EngineSessionConfig::default())
            .await
            .unwrap()
            .handle;
        let publication = channel(&f, Role::Publisher).await;
        let pending = publication.publish(camera(), PublishOptions::default());

        let frame = f.server.next_named("publish").await.unwrap();
        assert_eq!(frame.payload["media"]["audio"]["source"], "mic");
        f.server.ok(frame.id, json!({"id": "pub-1"}));

        let answer = answer_offer(&mut f, &media_server, "pub-1").await;
        route_progress(
            &publication,
            json!({"id": "pub-1", "status": "soac", "data": {"type": "answer", "sdp": answer}}),
        );
        route_progress(&publication, json!({"id": "pub-1", "status": "ready"}));

        assert_eq!(pending.wait().await.unwrap(), "pub-1");
        let session = f.engine.latest_session().unwrap();
        assert_eq!(session.local_track_ids(), vec!["mic".to_string(), "cam".to_string()]);
        assert_eq!(publication.session_id().as_deref(), Some("pub-1"));
    }

    #[tokio::test]
    async fn test_publish_rejected_by_server() {
        let mut f = fixture().await;
        let publication = channel(&f, Role::Publisher).await;
        let pending = publication.publish(camera(), PublishOptions::default());
        let frame = f.server.next_named("publish").await.unwrap();
        f.server.error(frame.id, "quota exceeded");

        let result = pending.wait().await;
        assert!(matches!(result, Err(SessionError::ServerRejected { message, .. }) if message == "quota exceeded"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(publication.is_ended());
        assert_eq!(f.engine.latest_session().unwrap().close_count(), 1);
    }

    #[tokio::test]
    async fn test_second_publish_refused() {
        let mut f = fixture().await;
        let publication = channel(&f, Role::Publisher).await;
        let _first = publication.publish(camera(), PublishOptions::default());
        let second = publication.publish(camera(), PublishOptions::default());
        assert!(matches!(second.wait().await, Err(SessionError::InvalidState { .. })));
        assert!(f.server.next_named("publish").await.is_some());
    }

    #[tokio::test]
    async fn test_progress_error_after_ready_reports_to_observer() {
        let mut f = fixture().await;
        let publication = channel(&f, Role::Publisher).await;
        let pending = publication.publish(camera(), PublishOptions::default());
        let frame = f.server.next_named("publish").await.unwrap();
        f.server.ok(frame.id, json!({"id": "pub-2"}));
        f.server.next_named("soac").await.unwrap();
        route_progress(&publication, json!({"id": "pub-2", "status": "ready"}));
        pending.wait().await.unwrap();

        route_progress(&publication, json!({"id": "pub-2", "status": "error", "data": "media failure"}));
        let stop = f.server.next_named("unpublish").await.unwrap();
        assert_eq!(stop.payload, json!({"id": "pub-2"}));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.recorder.errors.lock().len(), 1);
        assert_eq!(*f.recorder.ended.lock(), vec!["pub-2".to_string()]);
    }

    #[tokio::test]
    async fn test_mute_sends_stream_control() {
        let mut f = fixture().await;
        let publication = channel(&f, Role::Publisher).await;
        let _pending = publication.publish(camera(), PublishOptions::default());
        let frame = f.server.next_named("publish").await.unwrap();
        f.server.ok(frame.id, json!({"id": "pub-3"}));
        f.server.next_named("soac").await.unwrap();

        let muted = publication.mute(MuteTarget::Audio);
        let control = f.server.next_named("stream-control").await.unwrap();
        assert_eq!(control.payload, json!({"id": "pub-3", "operation": "pause", "data": "audio"}));
        f.server.ok(control.id, Value::Null);
        muted.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_mute_before_session_fails() {
        let f = fixture().await;
        let publication = channel(&f, Role::Publisher).await;
        let result = publication.mute(MuteTarget::Video).wait().await;
        assert!(matches!(result, Err(SessionError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_subscribe_receives_tracks() {
        let mut f = fixture().await;
        let mcu_engine = f.engine.sharing_network();
        let media_server = mcu_engine
            .create_session(&EngineSessionConfig::default())
            .await
            .unwrap()
            .handle;
        media_server
            .add_track(&MediaTrack::new("mixed-audio", MediaKind::Audio), "mixed")
            .await
            .unwrap();
        media_server
            .add_track(&MediaTrack::new("mixed-video", MediaKind::Video), "mixed")
            .await
            .unwrap();

        let info = RemoteStreamInfo::from_value(&json!({
            "id": "mixed",
            "type": "mixed",
            "info": {"label": "common"},
            "media": {
                "audio": {"source": "mic", "format": {"codec": "opus"}},
                "video": {"source": "camera", "format": {"codec": "vp8"},
                          "parameters": {"resolution": {"width": 640, "height": 480}}}
            }
        }))
        .unwrap();
        let subscription = channel(&f, Role::Subscriber).await;
        let pending = subscription.subscribe(info, SubscribeOptions::default());

        let frame = f.server.next_named("subscribe").await.unwrap();
        assert_eq!(frame.payload["media"]["audio"]["from"], "mixed");
        f.server.ok(frame.id, json!({"id": "sub-1"}));

        let answer = answer_offer(&mut f, &media_server, "sub-1").await;
        route_progress(
            &subscription,
            json!({"peerId": "sub-1", "status": "soac", "data": {"type": "answer", "sdp": answer}}),
        );
        route_progress(&subscription, json!({"peerId": "sub-1", "status": "ready"}));

        let stream = pending.wait().await.unwrap();
        assert_eq!(stream.id, "mixed");
        assert_eq!(stream.origin, "mcu");
        assert_eq!(stream.tracks.len(), 2);
    }

    #[tokio::test]
    async fn test_stop_releases_and_unsubscribes() {
        let mut f = fixture().await;
        let info = RemoteStreamInfo::from_value(&json!({
            "id": "s9",
            "type": "forward",
            "info": {"owner": "alice"},
            "media": {"audio": {"source": "mic", "format": {"codec": "opus"}}}
        }))
        .unwrap();
        let subscription = channel(&f, Role::Subscriber).await;
        let _pending = subscription.subscribe(info, SubscribeOptions::audio_only());
        let frame = f.server.next_named("subscribe").await.unwrap();
        f.server.ok(frame.id, json!({"id": "sub-9"}));
        f.server.next_named("soac").await.unwrap();

        subscription.stop().wait().await.unwrap();
        let stop = f.server.next_named("unsubscribe").await.unwrap();
        assert_eq!(stop.payload, json!({"id": "sub-9"}));
        let session = f.engine.latest_session().unwrap();
        assert_eq!(session.close_count(), 1);
        assert_eq!(session.calls_after_close(), 0);
        assert!(matches!(
            subscription.stop().wait().await,
            Err(SessionError::InvalidState { .. })
        ));
    }
}
