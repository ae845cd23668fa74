//! Point-to-point client
//!
//! [`P2PClient`] owns one [`P2PChannel`] per remote id. Everything that
//! touches the channel map or feeds a channel runs on the engine queue, so
//! channel creation, glare hand-over and incoming dispatch never race.
//!
//! Two situations replace a channel instead of feeding it:
//!
//! - **Glare.** An offer arrives while our own offer is outstanding and our
//!   id sorts after the remote's. We give way: the old channel is abandoned,
//!   a new one answers the remote offer and then republishes our stream
//!   with the original result slot.
//! - **Gathering policy unsupported.** The peer closes with code 2601; a new
//!   channel republishes the latest stream.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rtcsig_session_core::channel::p2p::P2PChannelContext;
use rtcsig_session_core::engine::{ConnectionStats, LocalStream, MediaEngine, RemoteStream};
use rtcsig_session_core::signaling::messages::CLOSE_CODE_GATHERING_UNSUPPORTED;
use rtcsig_session_core::signaling::{P2PMessage, P2PSignalingChannel, P2PSignalingEvent};
use rtcsig_session_core::{Executors, P2PChannel, P2PChannelObserver, SessionChannel, SessionError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::P2PClientConfig;
use super::recovery::retry_with_backoff;
use crate::error::{ClientError, ClientResult};
use crate::events::{ClientEvent, EventEmitter, EventPriority, EventSubscription, MessageInfo};

/// Client for direct sessions with remote peers
pub struct P2PClient {
    config: P2PClientConfig,
    signaling: Arc<dyn P2PSignalingChannel>,
    engine: Arc<dyn MediaEngine>,
    executors: Executors,
    events: EventEmitter,
    local_id: RwLock<Option<String>>,
    allowed_remote_ids: RwLock<HashSet<String>>,
    channels: Mutex<HashMap<String, Arc<P2PChannel>>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<P2PClient>,
}

impl std::fmt::Debug for P2PClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2PClient")
            .field("local_id", &*self.local_id.read())
            .field("channels", &self.channels.lock().len())
            .finish()
    }
}

impl P2PClient {
    /// Create a client. Must be called inside a tokio runtime.
    pub fn new(
        config: P2PClientConfig,
        signaling: Arc<dyn P2PSignalingChannel>,
        engine: Arc<dyn MediaEngine>,
    ) -> ClientResult<Arc<Self>> {
        config.validate()?;
        let executors = Executors::new();
        Ok(Arc::new_cyclic(|weak| P2PClient {
            config,
            signaling,
            engine,
            events: EventEmitter::new(executors.events.clone()),
            executors,
            local_id: RwLock::new(None),
            allowed_remote_ids: RwLock::new(HashSet::new()),
            channels: Mutex::new(HashMap::new()),
            receiver: Mutex::new(None),
            weak_self: weak.clone(),
        }))
    }

    pub fn config(&self) -> &P2PClientConfig {
        &self.config
    }

    pub fn local_id(&self) -> Option<String> {
        self.local_id.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.local_id.read().is_some()
    }

    pub fn subscribe(&self, subscription: EventSubscription) -> uuid::Uuid {
        self.events.subscribe(subscription)
    }

    pub fn unsubscribe(&self, subscription_id: uuid::Uuid) -> bool {
        self.events.unsubscribe(subscription_id)
    }

    pub fn event_stream(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.stream()
    }

    /// Remote ids with a channel, usable or not
    pub fn remote_ids(&self) -> Vec<String> {
        self.channels.lock().keys().cloned().collect()
    }

    // ===== CONNECTION =====

    /// Authenticate with the signaling server and start receiving. Returns
    /// the id the server assigned.
    pub async fn connect(&self, token: &str) -> ClientResult<String> {
        if self.is_connected() {
            return Err(ClientError::invalid_state("already connected"));
        }
        let signaling = self.signaling.clone();
        let (local_id, inbox) = retry_with_backoff("p2p connect", self.config.retry.clone(), || {
            let signaling = signaling.clone();
            let token = token.to_string();
            async move { signaling.connect(&token).await.map_err(ClientError::from) }
        })
        .await?;

        *self.local_id.write() = Some(local_id.clone());
        let task = tokio::spawn(Self::receive_loop(self.weak_self.clone(), inbox));
        if let Some(previous) = self.receiver.lock().replace(task) {
            previous.abort();
        }
        info!(local_id = %local_id, "P2P client connected");
        Ok(local_id)
    }

    /// Close every channel and leave the signaling server
    pub async fn disconnect(&self) -> ClientResult<()> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let channels: Vec<Arc<P2PChannel>> = self.channels.lock().values().cloned().collect();
        self.executors
            .engine
            .run(async move {
                for channel in channels {
                    channel.close().await;
                }
            })
            .await?;
        let result = self.signaling.disconnect().await;
        self.shut_down();
        info!("P2P client disconnected");
        result.map_err(ClientError::from)
    }

    fn shut_down(&self) {
        self.local_id.write().take();
        if let Some(receiver) = self.receiver.lock().take() {
            receiver.abort();
        }
    }

    // ===== ALLOWED REMOTES =====

    pub fn add_allowed_remote_id(&self, remote_id: impl Into<String>) {
        let remote_id = remote_id.into();
        if !self.allowed_remote_ids.write().insert(remote_id.clone()) {
            info!(remote = %remote_id, "Remote id is already allowed");
        }
    }

    /// Disallow `remote_id` and stop its session if there is one
    pub async fn remove_allowed_remote_id(&self, remote_id: &str) -> ClientResult<()> {
        self.allowed_remote_ids.write().remove(remote_id);
        if self.existing_channel(remote_id).is_none() {
            return Ok(());
        }
        self.stop(remote_id).await
    }

    pub fn is_allowed(&self, remote_id: &str) -> bool {
        self.allowed_remote_ids.read().contains(remote_id)
    }

    fn check_allowed(&self, remote_id: &str) -> ClientResult<()> {
        if self.is_allowed(remote_id) {
            Ok(())
        } else {
            Err(ClientError::not_allowed(remote_id))
        }
    }

    // ===== SESSION OPERATIONS =====

    /// Publish `stream` to `remote_id`. Resolves once the peer has the
    /// stream's tracks.
    pub async fn publish(&self, remote_id: &str, stream: LocalStream) -> ClientResult<P2PPublication> {
        self.check_allowed(remote_id)?;
        let channel = self.channel_on_queue(remote_id).await?;
        channel.publish(stream.clone()).wait().await?;
        info!(remote = %remote_id, stream = %stream.id, "Stream published");
        Ok(P2PPublication {
            client: self.weak_self.clone(),
            remote_id: remote_id.to_string(),
            stream,
            ended: AtomicBool::new(false),
        })
    }

    pub async fn unpublish(&self, remote_id: &str, stream: &LocalStream) -> ClientResult<()> {
        let channel = self
            .existing_channel(remote_id)
            .ok_or_else(|| ClientError::invalid_state("no session to unpublish from"))?;
        channel.unpublish(stream).wait().await?;
        Ok(())
    }

    /// Send a text message to `remote_id`, starting a session if needed
    pub async fn send(&self, remote_id: &str, message: impl Into<String>) -> ClientResult<()> {
        self.check_allowed(remote_id)?;
        let channel = self.channel_on_queue(remote_id).await?;
        channel.send(message).wait().await?;
        Ok(())
    }

    pub async fn stop(&self, remote_id: &str) -> ClientResult<()> {
        let channel = self
            .existing_channel(remote_id)
            .ok_or_else(|| ClientError::invalid_state("no session to stop"))?;
        channel.stop().wait().await?;
        Ok(())
    }

    pub async fn get_stats(&self, remote_id: &str) -> ClientResult<ConnectionStats> {
        let channel = self
            .existing_channel(remote_id)
            .ok_or_else(|| ClientError::invalid_state("no session to report on"))?;
        Ok(channel.get_stats().wait().await?)
    }

    /// Whether the session with `remote_id` should be considered dead. A
    /// peer without a session is reported stale.
    pub fn is_stale(&self, remote_id: &str) -> bool {
        match self.existing_channel(remote_id) {
            Some(channel) => channel.is_stale(self.config.stale.max_age, &self.config.stale.states),
            None => true,
        }
    }

    // ===== CHANNEL MAP =====

    fn strong(&self) -> ClientResult<Arc<Self>> {
        self.weak_self
            .upgrade()
            .ok_or_else(|| ClientError::internal("client is shutting down"))
    }

    fn existing_channel(&self, remote_id: &str) -> Option<Arc<P2PChannel>> {
        self.channels.lock().get(remote_id).cloned()
    }

    fn live_channel(&self, remote_id: &str) -> Option<Arc<P2PChannel>> {
        self.channels
            .lock()
            .get(remote_id)
            .filter(|c| !c.is_abandoned() && !c.is_ended())
            .cloned()
    }

    async fn channel_on_queue(&self, remote_id: &str) -> ClientResult<Arc<P2PChannel>> {
        let this = self.strong()?;
        let remote_id = remote_id.to_string();
        self.executors
            .engine
            .run(async move { this.channel_for(&remote_id).await })
            .await?
    }

    fn channel_context(&self) -> ClientResult<P2PChannelContext> {
        let local_id = self.local_id().ok_or(ClientError::NotConnected)?;
        let observer: Weak<dyn P2PChannelObserver> = self.weak_self.clone();
        Ok(P2PChannelContext {
            local_id,
            signaling: self.signaling.clone(),
            engine: self.engine.clone(),
            config: self.config.channel.clone(),
            user_agent: self.config.user_agent.clone(),
            executors: self.executors.clone(),
            observer,
        })
    }

    /// The usable channel for `remote_id`, replacing an abandoned or ended
    /// one. Engine queue only.
    async fn channel_for(&self, remote_id: &str) -> ClientResult<Arc<P2PChannel>> {
        if let Some(channel) = self.live_channel(remote_id) {
            return Ok(channel);
        }
        let context = self.channel_context()?;
        let channel = P2PChannel::create(&context, remote_id).await?;
        let previous = self
            .channels
            .lock()
            .insert(remote_id.to_string(), channel.clone());
        if let Some(previous) = previous {
            debug!(remote = %remote_id, replaced = %previous.instance_id(), "Replaced unusable channel");
        }
        Ok(channel)
    }

    fn forget_instance(&self, remote_id: &str, instance_id: &str) -> bool {
        let mut channels = self.channels.lock();
        match channels.get(remote_id) {
            Some(channel) if channel.instance_id() == instance_id => {
                channels.remove(remote_id);
                true
            }
            _ => false,
        }
    }

    // ===== INCOMING =====

    async fn receive_loop(weak: Weak<Self>, mut inbox: mpsc::UnboundedReceiver<P2PSignalingEvent>) {
        while let Some(event) = inbox.recv().await {
            let Some(client) = weak.upgrade() else {
                break;
            };
            match event {
                P2PSignalingEvent::Message { from, message } => {
                    let queue = client.executors.engine.clone();
                    queue.post(async move { client.on_signaling_message(from, message).await });
                }
                P2PSignalingEvent::ServerDisconnected => client.on_server_disconnected(),
            }
        }
        debug!("P2P receive loop ended");
    }

    async fn on_signaling_message(&self, from: String, text: String) {
        if !self.is_allowed(&from) {
            warn!(remote = %from, "Message from a remote that is not allowed, ignored");
            return;
        }
        let message = match P2PMessage::parse(&text) {
            Ok(message) => message,
            Err(error) => {
                warn!(remote = %from, %error, "Unreadable peer message");
                return;
            }
        };

        match self.live_channel(&from) {
            None => {
                if matches!(message, P2PMessage::Closed(_)) {
                    warn!(remote = %from, "Close for a session that does not exist, ignored");
                    return;
                }
            }
            Some(channel) => {
                let yields = self
                    .local_id()
                    .is_some_and(|local| local.as_str() > from.as_str());
                if message.is_offer() && channel.have_local_offer() && yields {
                    self.resolve_glare(channel, message).await;
                    return;
                }
                if let P2PMessage::Closed(Some(info)) = &message {
                    if info.code == Some(CLOSE_CODE_GATHERING_UNSUPPORTED) {
                        self.recreate_channel(channel).await;
                        return;
                    }
                }
            }
        }

        match self.channel_for(&from).await {
            Ok(channel) => {
                let kind = message.kind();
                if let Err(error) = channel.handle_signaling_message(message).await {
                    warn!(remote = %from, kind, %error, "Peer message failed");
                }
            }
            Err(error) => warn!(remote = %from, %error, "No channel for peer message"),
        }
    }

    /// Give way to the remote offer and carry our publish over to a fresh
    /// channel that answers it
    async fn resolve_glare(&self, previous: Arc<P2PChannel>, offer: P2PMessage) {
        let remote_id = previous.remote_id().to_string();
        info!(remote = %remote_id, "Offer collision, remote side becomes the offerer");
        let latest = previous.take_latest_publish();
        self.forget_instance(&remote_id, previous.instance_id());
        previous.abandon("offer collision").await;

        let channel = match self.channel_for(&remote_id).await {
            Ok(channel) => channel,
            Err(error) => {
                warn!(remote = %remote_id, %error, "Could not replace channel after collision");
                if let Some((_, Some(completion))) = latest {
                    completion.fail(to_session_error(error));
                }
                return;
            }
        };
        channel.inherit_from(&previous);
        if let Err(error) = channel.clone().handle_signaling_message(offer).await {
            warn!(remote = %remote_id, %error, "Answering the colliding offer failed");
        }
        republish(&channel, latest);
    }

    /// Replace the channel after the peer rejected our gathering policy
    async fn recreate_channel(&self, previous: Arc<P2PChannel>) {
        let remote_id = previous.remote_id().to_string();
        info!(remote = %remote_id, "Peer cannot gather continually, recreating session");
        let latest = previous.take_latest_publish();
        self.forget_instance(&remote_id, previous.instance_id());
        previous.abandon("ice gathering policy unsupported").await;

        match self.channel_for(&remote_id).await {
            Ok(channel) => {
                channel.inherit_from(&previous);
                if latest.is_none() {
                    debug!(remote = %remote_id, "Nothing to republish");
                }
                republish(&channel, latest);
            }
            Err(error) => {
                warn!(remote = %remote_id, %error, "Could not recreate channel");
                if let Some((_, Some(completion))) = latest {
                    completion.fail(to_session_error(error));
                }
            }
        }
    }

    /// Open channels can no longer signal, so they are closed right away
    /// instead of waiting for their ICE watchdog
    fn on_server_disconnected(&self) {
        warn!("P2P signaling server disconnected");
        let channels: Vec<Arc<P2PChannel>> = self.channels.lock().values().cloned().collect();
        if !channels.is_empty() {
            debug!(count = channels.len(), "Closing channels after server disconnect");
            self.executors.engine.post(async move {
                for channel in channels {
                    channel.close().await;
                }
            });
        }
        self.shut_down();
        self.events.emit(ClientEvent::ServerDisconnected {
            priority: EventPriority::Critical,
        });
    }
}

fn republish(
    channel: &P2PChannel,
    latest: Option<(LocalStream, Option<rtcsig_session_core::Completion<()>>)>,
) {
    match latest {
        Some((stream, Some(completion))) => channel.resume_publish(stream, completion),
        Some((stream, None)) => {
            // Already confirmed once; nobody waits on this one
            drop(channel.publish(stream));
        }
        None => {}
    }
}

fn to_session_error(error: ClientError) -> SessionError {
    match error {
        ClientError::Session(e) => e,
        other => SessionError::internal(other.to_string()),
    }
}

impl P2PChannelObserver for P2PClient {
    fn on_stopped(&self, remote_id: &str, instance_id: &str) {
        if !self.forget_instance(remote_id, instance_id) {
            debug!(remote = %remote_id, instance = %instance_id, "Replaced channel stopped");
            return;
        }
        // A stopped peer has to be allowed again before a new session
        self.allowed_remote_ids.write().remove(remote_id);
        info!(remote = %remote_id, "P2P session stopped");
        self.events.emit(ClientEvent::SessionStopped {
            remote_id: remote_id.to_string(),
            priority: EventPriority::High,
        });
    }

    fn on_stream_added(&self, stream: RemoteStream) {
        self.events.emit(ClientEvent::StreamAdded {
            stream,
            priority: EventPriority::Normal,
        });
    }

    fn on_stream_ended(&self, remote_id: &str, stream_id: &str) {
        self.events.emit(ClientEvent::StreamEnded {
            remote_id: remote_id.to_string(),
            stream_id: stream_id.to_string(),
            priority: EventPriority::Normal,
        });
    }

    fn on_message_received(&self, remote_id: &str, message: String) {
        self.events.emit(ClientEvent::MessageReceived {
            info: MessageInfo::new(remote_id, message, None),
            priority: EventPriority::Normal,
        });
    }

    fn on_error(&self, remote_id: &str, error: SessionError) {
        self.events.emit(ClientEvent::SessionError {
            session_id: remote_id.to_string(),
            error: error.into(),
            priority: EventPriority::High,
        });
    }
}

impl Drop for P2PClient {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.lock().take() {
            receiver.abort();
        }
    }
}

/// A stream published to one peer
#[derive(Debug)]
pub struct P2PPublication {
    client: Weak<P2PClient>,
    remote_id: String,
    stream: LocalStream,
    ended: AtomicBool,
}

impl P2PPublication {
    pub fn id(&self) -> &str {
        &self.stream.id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn stream(&self) -> &LocalStream {
        &self.stream
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    fn client(&self) -> ClientResult<Arc<P2PClient>> {
        self.client
            .upgrade()
            .ok_or_else(|| ClientError::invalid_state("client is gone"))
    }

    /// Stop sending this stream to the peer
    pub async fn stop(&self) -> ClientResult<()> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Err(ClientError::invalid_state("publication already stopped"));
        }
        self.client()?.unpublish(&self.remote_id, &self.stream).await
    }

    pub async fn get_stats(&self) -> ClientResult<ConnectionStats> {
        self.client()?.get_stats(&self.remote_id).await
    }
}
