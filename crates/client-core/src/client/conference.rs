//! Conference client
//!
//! [`ConferenceClient`] joins a room through a [`SignalingTransport`],
//! keeps the room's participants and streams current from server
//! notifications, and runs one [`ConferenceChannel`] per publication or
//! subscription. `progress` notifications are routed to the channel whose
//! server-assigned session id they carry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rtcsig_session_core::channel::{MuteTarget, PublishOptions, RemoteStreamInfo, SubscribeOptions};
use rtcsig_session_core::engine::{ConnectionStats, LocalStream, MediaEngine, RemoteStream};
use rtcsig_session_core::signaling::messages::ProgressStatus;
use rtcsig_session_core::signaling::{
    ServerNotification, SignalingConnection, SignalingTransport, TransportEvent,
};
use rtcsig_session_core::{
    ConferenceChannel, ConferenceChannelObserver, Executors, Role, SessionChannel, SessionError,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::ConferenceClientConfig;
use super::recovery::{retry_with_backoff, with_timeout};
use crate::error::{ClientError, ClientResult};
use crate::events::{
    ClientEvent, EventEmitter, EventPriority, EventSubscription, MessageInfo, ParticipantInfo,
};

/// The room as it was when the join completed
#[derive(Debug, Clone)]
pub struct ConferenceInfo {
    pub id: String,
    pub myself: ParticipantInfo,
    pub participants: Vec<ParticipantInfo>,
    pub remote_streams: Vec<RemoteStreamInfo>,
}

impl ConferenceInfo {
    /// Read the login acknowledgement
    fn from_login(login: &Value) -> ClientResult<Self> {
        let myself: ParticipantInfo = serde_json::from_value(login.clone())
            .map_err(|_| ClientError::internal("received invalid user info from the server"))?;
        let room = login
            .get("room")
            .filter(|r| r.is_object())
            .ok_or_else(|| ClientError::internal("login response without room"))?;
        let id = room
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::internal("room without id"))?
            .to_string();

        let participants = room
            .get("participants")
            .and_then(Value::as_array)
            .map(|users| {
                users
                    .iter()
                    .filter_map(|user| match serde_json::from_value(user.clone()) {
                        Ok(participant) => Some(participant),
                        Err(error) => {
                            warn!(%error, "Skipping malformed participant");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        let remote_streams = room
            .get("streams")
            .and_then(Value::as_array)
            .map(|streams| {
                streams
                    .iter()
                    .filter_map(|stream| match RemoteStreamInfo::from_value(stream) {
                        Ok(info) => Some(info),
                        Err(error) => {
                            warn!(%error, "Skipping malformed stream");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            id,
            myself,
            participants,
            remote_streams,
        })
    }
}

/// Client for one conference room at a time
pub struct ConferenceClient {
    config: ConferenceClientConfig,
    transport: Arc<SignalingTransport>,
    engine: Arc<dyn MediaEngine>,
    executors: Executors,
    events: EventEmitter,
    info: RwLock<Option<ConferenceInfo>>,
    participants: DashMap<String, ParticipantInfo>,
    streams: DashMap<String, RemoteStreamInfo>,
    channels: Mutex<Vec<Arc<ConferenceChannel>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<ConferenceClient>,
}

impl std::fmt::Debug for ConferenceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConferenceClient")
            .field("room", &self.info.read().as_ref().map(|i| i.id.clone()))
            .field("channels", &self.channels.lock().len())
            .finish()
    }
}

impl ConferenceClient {
    /// Create a client over `connection`. Must be called inside a tokio
    /// runtime.
    pub fn new(
        config: ConferenceClientConfig,
        connection: Arc<dyn SignalingConnection>,
        engine: Arc<dyn MediaEngine>,
    ) -> ClientResult<Arc<Self>> {
        config.validate()?;
        let transport = SignalingTransport::new(connection, config.transport.clone());
        let executors = Executors::new();
        Ok(Arc::new_cyclic(|weak| ConferenceClient {
            config,
            transport,
            engine,
            events: EventEmitter::new(executors.events.clone()),
            executors,
            info: RwLock::new(None),
            participants: DashMap::new(),
            streams: DashMap::new(),
            channels: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
            weak_self: weak.clone(),
        }))
    }

    pub fn config(&self) -> &ConferenceClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<SignalingTransport> {
        &self.transport
    }

    pub fn info(&self) -> Option<ConferenceInfo> {
        self.info.read().clone()
    }

    pub fn is_joined(&self) -> bool {
        self.info.read().is_some()
    }

    pub fn participants(&self) -> Vec<ParticipantInfo> {
        self.participants.iter().map(|p| p.value().clone()).collect()
    }

    pub fn remote_streams(&self) -> Vec<RemoteStreamInfo> {
        self.streams.iter().map(|s| s.value().clone()).collect()
    }

    pub fn remote_stream(&self, stream_id: &str) -> Option<RemoteStreamInfo> {
        self.streams.get(stream_id).map(|s| s.value().clone())
    }

    /// Publications and subscriptions that have not ended
    pub fn active_sessions(&self) -> usize {
        self.channels.lock().iter().filter(|c| !c.is_ended()).count()
    }

    pub fn subscribe_events(&self, subscription: EventSubscription) -> uuid::Uuid {
        self.events.subscribe(subscription)
    }

    pub fn unsubscribe_events(&self, subscription_id: uuid::Uuid) -> bool {
        self.events.unsubscribe(subscription_id)
    }

    pub fn event_stream(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.stream()
    }

    fn ensure_joined(&self) -> ClientResult<()> {
        if self.is_joined() {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    // ===== ROOM =====

    /// Join the room `token` grants access to. Recoverable failures are
    /// retried with backoff, the whole join bounded by `join_timeout`.
    pub async fn join(&self, token: &str) -> ClientResult<ConferenceInfo> {
        if self.is_joined() {
            return Err(ClientError::invalid_state("already in a conference"));
        }
        self.start_listener();

        let transport = self.transport.clone();
        let login = with_timeout(
            "conference join",
            self.config.join_timeout,
            retry_with_backoff("conference join", self.config.retry.clone(), || {
                let transport = transport.clone();
                let token = token.to_string();
                async move { transport.connect(&token).await.map_err(ClientError::from) }
            }),
        )
        .await;
        let login = match login {
            Ok(login) => login,
            Err(error) => {
                self.stop_listener();
                return Err(error);
            }
        };

        let info = match ConferenceInfo::from_login(&login) {
            Ok(info) => info,
            Err(error) => {
                let _ = self.transport.disconnect().await;
                self.stop_listener();
                return Err(error);
            }
        };
        for participant in &info.participants {
            self.participants
                .insert(participant.id.clone(), participant.clone());
        }
        for stream in &info.remote_streams {
            self.streams.insert(stream.id.clone(), stream.clone());
        }
        *self.info.write() = Some(info.clone());
        info!(
            room = %info.id,
            participant = %info.myself.id,
            participants = info.participants.len(),
            streams = info.remote_streams.len(),
            "Joined conference"
        );
        Ok(info)
    }

    /// End every session and leave the room
    pub async fn leave(&self) -> ClientResult<()> {
        self.ensure_joined()?;
        self.close_all_channels().await;
        let result = self.transport.disconnect().await;
        self.reset();
        info!("Left conference");
        result.map_err(ClientError::from)
    }

    /// Send a text message to one participant, or to everybody with `None`
    pub async fn send(&self, message: &str, to: Option<&str>) -> ClientResult<()> {
        self.ensure_joined()?;
        if message.is_empty() {
            return Err(ClientError::Session(SessionError::invalid_argument(
                "message is empty",
            )));
        }
        self.transport.send_custom_message(to, message).await?;
        Ok(())
    }

    fn reset(&self) {
        self.stop_listener();
        self.info.write().take();
        self.participants.clear();
        self.streams.clear();
        self.channels.lock().clear();
    }

    // ===== SESSIONS =====

    async fn create_channel(&self, role: Role) -> ClientResult<Arc<ConferenceChannel>> {
        let observer: Weak<dyn ConferenceChannelObserver> = self.weak_self.clone();
        let transport = self.transport.clone();
        let engine = self.engine.clone();
        let config = self.config.channel.clone();
        let executors = self.executors.clone();
        let channel = self
            .executors
            .engine
            .run(async move {
                ConferenceChannel::create(role, transport, engine.as_ref(), config, executors, observer)
                    .await
            })
            .await??;
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    fn forget(&self, channel: &Arc<ConferenceChannel>) {
        self.channels.lock().retain(|c| !Arc::ptr_eq(c, channel));
    }

    /// Publish a local stream. Resolves once the server reports the
    /// publication ready.
    pub async fn publish(
        &self,
        stream: LocalStream,
        options: PublishOptions,
    ) -> ClientResult<ConferencePublication> {
        self.ensure_joined()?;
        let channel = self.create_channel(Role::Publisher).await?;
        match channel.publish(stream.clone(), options).wait().await {
            Ok(id) => {
                info!(session = %id, stream = %stream.id, "Publication ready");
                Ok(ConferencePublication {
                    client: self.weak_self.clone(),
                    channel,
                    id,
                    stream,
                    ended: AtomicBool::new(false),
                })
            }
            Err(error) => {
                self.forget(&channel);
                Err(error.into())
            }
        }
    }

    /// Subscribe to a stream announced in the room
    pub async fn subscribe(
        &self,
        stream_id: &str,
        options: SubscribeOptions,
    ) -> ClientResult<ConferenceSubscription> {
        self.ensure_joined()?;
        let info = self
            .remote_stream(stream_id)
            .ok_or_else(|| ClientError::StreamNotFound {
                stream_id: stream_id.to_string(),
            })?;
        options.validate(&info.capabilities)?;
        let channel = self.create_channel(Role::Subscriber).await?;
        match channel.subscribe(info, options).wait().await {
            Ok(stream) => {
                let id = channel.session_id().unwrap_or_default();
                info!(session = %id, stream = %stream.id, "Subscription ready");
                Ok(ConferenceSubscription {
                    client: self.weak_self.clone(),
                    channel,
                    id,
                    stream,
                    ended: AtomicBool::new(false),
                })
            }
            Err(error) => {
                self.forget(&channel);
                Err(error.into())
            }
        }
    }

    async fn close_all_channels(&self) {
        let channels: Vec<Arc<ConferenceChannel>> = self.channels.lock().drain(..).collect();
        if channels.is_empty() {
            return;
        }
        let closed = self
            .executors
            .engine
            .run(async move {
                for channel in channels {
                    channel.close().await;
                }
            })
            .await;
        if let Err(error) = closed {
            warn!(%error, "Closing sessions failed");
        }
    }

    // ===== NOTIFICATIONS =====

    fn start_listener(&self) {
        let mut events = self.transport.subscribe();
        let weak = self.weak_self.clone();
        let task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Conference listener lagged behind");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(client) = weak.upgrade() else {
                    break;
                };
                client.on_transport_event(event);
            }
            debug!("Conference listener ended");
        });
        if let Some(previous) = self.listener.lock().replace(task) {
            previous.abort();
        }
    }

    fn stop_listener(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }

    fn on_transport_event(self: Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Notification(notification) => {
                let queue = self.executors.engine.clone();
                queue.post(async move { self.on_notification(notification) });
            }
            TransportEvent::Reconnecting { attempt } => {
                info!(attempt, "Conference signaling reconnecting");
            }
            TransportEvent::Reconnected => info!("Conference signaling reconnected"),
            TransportEvent::ServerDisconnected => {
                let queue = self.executors.engine.clone();
                queue.post(async move { self.on_server_disconnected().await });
            }
        }
    }

    fn channel_for_session(&self, session_id: &str) -> Option<Arc<ConferenceChannel>> {
        self.channels
            .lock()
            .iter()
            .find(|c| c.session_id().as_deref() == Some(session_id))
            .cloned()
    }

    fn on_notification(&self, notification: ServerNotification) {
        match notification {
            ServerNotification::Progress(progress) => {
                match self.channel_for_session(&progress.id) {
                    Some(channel) => channel.on_progress(progress.status),
                    None => debug!(session = %progress.id, "Progress for unknown session ignored"),
                }
            }
            ServerNotification::Stream { id, status, data } => {
                self.on_stream_notification(id, &status, data)
            }
            ServerNotification::Text { from, message, to } => {
                self.events.emit(ClientEvent::MessageReceived {
                    info: MessageInfo::new(from, message, Some(to)),
                    priority: EventPriority::Normal,
                });
            }
            ServerNotification::Participant { action, data } => {
                self.on_participant_notification(&action, data)
            }
            ServerNotification::ConnectionFailed(data) => {
                let session = data.get("id").and_then(Value::as_str).unwrap_or_default();
                match self.channel_for_session(session) {
                    Some(channel) => {
                        channel.on_progress(ProgressStatus::Error("connection failed".to_string()))
                    }
                    None => warn!(session, "Connection failure for unknown session"),
                }
            }
            ServerNotification::Other { name, .. } => {
                debug!(event = %name, "Unhandled server notification");
            }
        }
    }

    fn on_stream_notification(&self, id: String, status: &str, data: Value) {
        match status {
            "add" => match RemoteStreamInfo::from_value(&data) {
                Ok(info) => {
                    self.streams.insert(info.id.clone(), info.clone());
                    self.events.emit(ClientEvent::ConferenceStreamAdded {
                        info,
                        priority: EventPriority::Normal,
                    });
                }
                Err(error) => warn!(stream = %id, %error, "Malformed stream announcement"),
            },
            "update" => {
                let field = data
                    .get("field")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let value = data.get("value").cloned().unwrap_or(Value::Null);
                if !self.streams.contains_key(&id) {
                    warn!(stream = %id, "Update for unknown stream ignored");
                    return;
                }
                if field == "." {
                    // Whole description replaced
                    match RemoteStreamInfo::from_value(&value) {
                        Ok(info) => {
                            self.streams.insert(id.clone(), info);
                        }
                        Err(error) => warn!(stream = %id, %error, "Malformed stream update"),
                    }
                }
                self.events.emit(ClientEvent::ConferenceStreamUpdated {
                    stream_id: id,
                    field,
                    value,
                    priority: EventPriority::Low,
                });
            }
            "remove" => {
                if self.streams.remove(&id).is_some() {
                    self.events.emit(ClientEvent::ConferenceStreamRemoved {
                        stream_id: id,
                        priority: EventPriority::Normal,
                    });
                }
            }
            other => debug!(stream = %id, status = other, "Unknown stream status"),
        }
    }

    fn on_participant_notification(&self, action: &str, data: Value) {
        match action {
            "join" => match serde_json::from_value::<ParticipantInfo>(data) {
                Ok(participant) => {
                    self.participants
                        .insert(participant.id.clone(), participant.clone());
                    self.events.emit(ClientEvent::ParticipantJoined {
                        participant,
                        priority: EventPriority::Normal,
                    });
                }
                Err(error) => warn!(%error, "Malformed participant"),
            },
            "leave" => {
                let Some(participant_id) = data.as_str() else {
                    warn!("Participant leave without id");
                    return;
                };
                if self.participants.remove(participant_id).is_some() {
                    self.events.emit(ClientEvent::ParticipantLeft {
                        participant_id: participant_id.to_string(),
                        priority: EventPriority::Normal,
                    });
                }
            }
            other => debug!(action = other, "Unknown participant action"),
        }
    }

    async fn on_server_disconnected(&self) {
        warn!("Conference server disconnected");
        let channels: Vec<Arc<ConferenceChannel>> = self.channels.lock().drain(..).collect();
        for channel in channels {
            channel.close().await;
        }
        self.reset();
        self.events.emit(ClientEvent::ServerDisconnected {
            priority: EventPriority::Critical,
        });
    }
}

impl ConferenceChannelObserver for ConferenceClient {
    fn on_ended(&self, session_id: &str) {
        self.channels
            .lock()
            .retain(|c| c.session_id().as_deref() != Some(session_id));
        self.events.emit(ClientEvent::ConferenceSessionEnded {
            session_id: session_id.to_string(),
            priority: EventPriority::High,
        });
    }

    fn on_error(&self, session_id: &str, error: SessionError) {
        self.events.emit(ClientEvent::SessionError {
            session_id: session_id.to_string(),
            error: error.into(),
            priority: EventPriority::High,
        });
    }
}

impl Drop for ConferenceClient {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }
}

/// A local stream sent to the conference
#[derive(Debug)]
pub struct ConferencePublication {
    client: Weak<ConferenceClient>,
    channel: Arc<ConferenceChannel>,
    id: String,
    stream: LocalStream,
    ended: AtomicBool,
}

impl ConferencePublication {
    /// Session id assigned by the server
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream(&self) -> &LocalStream {
        &self.stream
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst) || self.channel.is_ended()
    }

    pub async fn mute(&self, target: MuteTarget) -> ClientResult<()> {
        Ok(self.channel.mute(target).wait().await?)
    }

    pub async fn unmute(&self, target: MuteTarget) -> ClientResult<()> {
        Ok(self.channel.unmute(target).wait().await?)
    }

    pub async fn get_stats(&self) -> ClientResult<ConnectionStats> {
        Ok(self.channel.get_stats().wait().await?)
    }

    pub fn ice_restart(&self) {
        self.channel.ice_restart();
    }

    /// Unpublish
    pub async fn stop(&self) -> ClientResult<()> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Err(ClientError::invalid_state("publication already stopped"));
        }
        let result = self.channel.stop().wait().await;
        if let Some(client) = self.client.upgrade() {
            client.forget(&self.channel);
        }
        Ok(result?)
    }
}

/// A conference stream received from the server
#[derive(Debug)]
pub struct ConferenceSubscription {
    client: Weak<ConferenceClient>,
    channel: Arc<ConferenceChannel>,
    id: String,
    stream: RemoteStream,
    ended: AtomicBool,
}

impl ConferenceSubscription {
    /// Session id assigned by the server
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream(&self) -> &RemoteStream {
        &self.stream
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst) || self.channel.is_ended()
    }

    pub async fn mute(&self, target: MuteTarget) -> ClientResult<()> {
        Ok(self.channel.mute(target).wait().await?)
    }

    pub async fn unmute(&self, target: MuteTarget) -> ClientResult<()> {
        Ok(self.channel.unmute(target).wait().await?)
    }

    /// Change resolution, frame rate, bitrate or key-frame interval
    pub async fn update(&self, options: SubscribeOptions) -> ClientResult<()> {
        Ok(self.channel.update_subscription(options).wait().await?)
    }

    pub async fn get_stats(&self) -> ClientResult<ConnectionStats> {
        Ok(self.channel.get_stats().wait().await?)
    }

    pub fn ice_restart(&self) {
        self.channel.ice_restart();
    }

    /// Unsubscribe
    pub async fn stop(&self) -> ClientResult<()> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Err(ClientError::invalid_state("subscription already stopped"));
        }
        let result = self.channel.stop().wait().await;
        if let Some(client) = self.client.upgrade() {
            client.forget(&self.channel);
        }
        Ok(result?)
    }
}
