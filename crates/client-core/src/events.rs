//! Event handling for client-core operations
//!
//! Both clients report what happens to their sessions as [`ClientEvent`]s.
//! Applications consume them in one of two ways:
//!
//! - implement [`ClientEventHandler`] and register it with an
//!   [`EventSubscription`], optionally narrowed by an [`EventFilter`]
//! - take a broadcast receiver from [`EventEmitter::stream`]
//!
//! Handlers are always invoked on the client's event queue, one event after
//! another, never from inside a media engine callback.
//!
//! # Usage Examples
//!
//! ```rust
//! use rtcsig_client_core::events::{ClientEventHandler, MessageInfo};
//! use async_trait::async_trait;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl ClientEventHandler for Printer {
//!     async fn on_message_received(&self, info: MessageInfo) {
//!         println!("{} says {}", info.from, info.message);
//!     }
//! }
//! ```
//!
//! ## Event Filtering
//!
//! ```rust
//! use rtcsig_client_core::events::{EventFilter, EventPriority};
//! use std::collections::HashSet;
//!
//! let filter = EventFilter {
//!     min_priority: Some(EventPriority::High),
//!     remote_ids: Some(HashSet::from(["bob".to_string()])),
//! };
//! assert!(filter.remote_ids.is_some());
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rtcsig_session_core::channel::RemoteStreamInfo;
use rtcsig_session_core::engine::RemoteStream;
use rtcsig_session_core::TaskQueue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::ClientError;

/// Capacity of the broadcast stream
const EVENT_STREAM_CAPACITY: usize = 256;

/// A text message from a peer or a conference participant
#[derive(Debug, Clone, PartialEq)]
pub struct MessageInfo {
    pub from: String,
    pub message: String,
    /// Conference addressing: `"all"` for broadcasts, `None` for P2P
    pub to: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl MessageInfo {
    pub fn new(from: impl Into<String>, message: impl Into<String>, to: Option<String>) -> Self {
        Self {
            from: from.into(),
            message: message.into(),
            to,
            timestamp: Utc::now(),
        }
    }
}

/// A conference participant as announced by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: String,
    #[serde(rename = "user", default)]
    pub user_id: String,
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventPriority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A P2P peer's stream is ready to render
    StreamAdded {
        stream: RemoteStream,
        priority: EventPriority,
    },
    StreamEnded {
        remote_id: String,
        stream_id: String,
        priority: EventPriority,
    },
    MessageReceived {
        info: MessageInfo,
        priority: EventPriority,
    },
    /// The P2P session with `remote_id` is over
    SessionStopped {
        remote_id: String,
        priority: EventPriority,
    },
    /// An established session failed; a stop event follows
    SessionError {
        session_id: String,
        error: ClientError,
        priority: EventPriority,
    },
    ConferenceStreamAdded {
        info: RemoteStreamInfo,
        priority: EventPriority,
    },
    ConferenceStreamUpdated {
        stream_id: String,
        field: String,
        value: Value,
        priority: EventPriority,
    },
    ConferenceStreamRemoved {
        stream_id: String,
        priority: EventPriority,
    },
    /// A publication or subscription ended
    ConferenceSessionEnded {
        session_id: String,
        priority: EventPriority,
    },
    ParticipantJoined {
        participant: ParticipantInfo,
        priority: EventPriority,
    },
    ParticipantLeft {
        participant_id: String,
        priority: EventPriority,
    },
    ServerDisconnected {
        priority: EventPriority,
    },
}

impl ClientEvent {
    pub fn priority(&self) -> EventPriority {
        match self {
            ClientEvent::StreamAdded { priority, .. }
            | ClientEvent::StreamEnded { priority, .. }
            | ClientEvent::MessageReceived { priority, .. }
            | ClientEvent::SessionStopped { priority, .. }
            | ClientEvent::SessionError { priority, .. }
            | ClientEvent::ConferenceStreamAdded { priority, .. }
            | ClientEvent::ConferenceStreamUpdated { priority, .. }
            | ClientEvent::ConferenceStreamRemoved { priority, .. }
            | ClientEvent::ConferenceSessionEnded { priority, .. }
            | ClientEvent::ParticipantJoined { priority, .. }
            | ClientEvent::ParticipantLeft { priority, .. }
            | ClientEvent::ServerDisconnected { priority } => *priority,
        }
    }

    /// The peer or participant the event is about, when there is one
    pub fn remote_id(&self) -> Option<&str> {
        match self {
            ClientEvent::StreamAdded { stream, .. } => Some(&stream.origin),
            ClientEvent::StreamEnded { remote_id, .. }
            | ClientEvent::SessionStopped { remote_id, .. } => Some(remote_id),
            ClientEvent::MessageReceived { info, .. } => Some(&info.from),
            ClientEvent::ConferenceStreamAdded { info, .. } => Some(&info.origin),
            ClientEvent::ParticipantJoined { participant, .. } => Some(&participant.id),
            ClientEvent::ParticipantLeft { participant_id, .. } => Some(participant_id),
            _ => None,
        }
    }

    pub fn passes_filter(&self, filter: &EventFilter) -> bool {
        if let Some(min_priority) = filter.min_priority {
            if self.priority() < min_priority {
                return false;
            }
        }
        if let Some(remote_ids) = &filter.remote_ids {
            match self.remote_id() {
                Some(id) if remote_ids.contains(id) => {}
                // Events without a remote are still delivered
                None => {}
                Some(_) => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub remote_ids: Option<HashSet<String>>,
    pub min_priority: Option<EventPriority>,
}

/// Application callbacks. Every method has an empty default.
#[async_trait]
pub trait ClientEventHandler: Send + Sync {
    async fn on_stream_added(&self, _stream: RemoteStream) {}

    async fn on_stream_ended(&self, _remote_id: String, _stream_id: String) {}

    async fn on_message_received(&self, _info: MessageInfo) {}

    async fn on_session_stopped(&self, _remote_id: String) {}

    async fn on_session_error(&self, _session_id: String, _error: ClientError) {}

    async fn on_conference_stream_added(&self, _info: RemoteStreamInfo) {}

    async fn on_conference_stream_updated(&self, _stream_id: String, _field: String, _value: Value) {}

    async fn on_conference_stream_removed(&self, _stream_id: String) {}

    async fn on_conference_session_ended(&self, _session_id: String) {}

    async fn on_participant_joined(&self, _participant: ParticipantInfo) {}

    async fn on_participant_left(&self, _participant_id: String) {}

    async fn on_server_disconnected(&self) {}

    async fn on_client_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::StreamAdded { stream, .. } => self.on_stream_added(stream).await,
            ClientEvent::StreamEnded {
                remote_id,
                stream_id,
                ..
            } => self.on_stream_ended(remote_id, stream_id).await,
            ClientEvent::MessageReceived { info, .. } => self.on_message_received(info).await,
            ClientEvent::SessionStopped { remote_id, .. } => {
                self.on_session_stopped(remote_id).await
            }
            ClientEvent::SessionError {
                session_id, error, ..
            } => self.on_session_error(session_id, error).await,
            ClientEvent::ConferenceStreamAdded { info, .. } => {
                self.on_conference_stream_added(info).await
            }
            ClientEvent::ConferenceStreamUpdated {
                stream_id,
                field,
                value,
                ..
            } => {
                self.on_conference_stream_updated(stream_id, field, value)
                    .await
            }
            ClientEvent::ConferenceStreamRemoved { stream_id, .. } => {
                self.on_conference_stream_removed(stream_id).await
            }
            ClientEvent::ConferenceSessionEnded { session_id, .. } => {
                self.on_conference_session_ended(session_id).await
            }
            ClientEvent::ParticipantJoined { participant, .. } => {
                self.on_participant_joined(participant).await
            }
            ClientEvent::ParticipantLeft { participant_id, .. } => {
                self.on_participant_left(participant_id).await
            }
            ClientEvent::ServerDisconnected { .. } => self.on_server_disconnected().await,
        }
    }
}

pub struct EventSubscription {
    handler: Arc<dyn ClientEventHandler>,
    filter: EventFilter,
    id: uuid::Uuid,
}

impl EventSubscription {
    pub fn new(handler: Arc<dyn ClientEventHandler>, filter: EventFilter) -> Self {
        Self {
            handler,
            filter,
            id: uuid::Uuid::new_v4(),
        }
    }

    pub fn all_events(handler: Arc<dyn ClientEventHandler>) -> Self {
        Self::new(handler, EventFilter::default())
    }

    /// Only events about one peer, plus events about no peer in particular
    pub fn remote_events(handler: Arc<dyn ClientEventHandler>, remote_id: impl Into<String>) -> Self {
        let filter = EventFilter {
            remote_ids: Some(HashSet::from([remote_id.into()])),
            ..Default::default()
        };
        Self::new(handler, filter)
    }

    pub fn high_priority_events(handler: Arc<dyn ClientEventHandler>) -> Self {
        let filter = EventFilter {
            min_priority: Some(EventPriority::High),
            ..Default::default()
        };
        Self::new(handler, filter)
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn should_receive(&self, event: &ClientEvent) -> bool {
        event.passes_filter(&self.filter)
    }

    pub async fn deliver_event(&self, event: ClientEvent) {
        if self.should_receive(&event) {
            self.handler.on_client_event(event).await;
        }
    }
}

/// Fans client events out to subscriptions and the broadcast stream
pub struct EventEmitter {
    subscriptions: RwLock<Vec<Arc<EventSubscription>>>,
    stream: broadcast::Sender<ClientEvent>,
    queue: TaskQueue,
}

impl EventEmitter {
    /// Deliver handler calls on `queue`
    pub fn new(queue: TaskQueue) -> Self {
        let (stream, _) = broadcast::channel(EVENT_STREAM_CAPACITY);
        Self {
            subscriptions: RwLock::new(Vec::new()),
            stream,
            queue,
        }
    }

    pub fn subscribe(&self, subscription: EventSubscription) -> uuid::Uuid {
        let id = subscription.id();
        self.subscriptions.write().push(Arc::new(subscription));
        id
    }

    pub fn unsubscribe(&self, subscription_id: uuid::Uuid) -> bool {
        let mut subscriptions = self.subscriptions.write();
        if let Some(pos) = subscriptions.iter().position(|s| s.id() == subscription_id) {
            subscriptions.remove(pos);
            true
        } else {
            false
        }
    }

    /// A receiver for every event emitted from now on
    pub fn stream(&self) -> broadcast::Receiver<ClientEvent> {
        self.stream.subscribe()
    }

    pub fn emit(&self, event: ClientEvent) {
        trace!(priority = ?event.priority(), "Emitting client event");
        // No receivers is fine
        let _ = self.stream.send(event.clone());

        let subscriptions = self.subscriptions.read().clone();
        if subscriptions.is_empty() {
            return;
        }
        self.queue.post(async move {
            for subscription in subscriptions {
                subscription.deliver_event(event.clone()).await;
            }
        });
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscriptions", &self.subscription_count())
            .field("receivers", &self.stream.receiver_count())
            .finish()
    }
}

impl Drop for EventEmitter {
    fn drop(&mut self) {
        debug!(queue = self.queue.name(), "Event emitter dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collector {
        messages: Mutex<Vec<String>>,
        disconnects: Mutex<u32>,
    }

    #[async_trait]
    impl ClientEventHandler for Collector {
        async fn on_message_received(&self, info: MessageInfo) {
            self.messages.lock().push(info.message);
        }

        async fn on_server_disconnected(&self) {
            *self.disconnects.lock() += 1;
        }
    }

    fn message(from: &str, text: &str) -> ClientEvent {
        ClientEvent::MessageReceived {
            info: MessageInfo::new(from, text, None),
            priority: EventPriority::Normal,
        }
    }

    async fn settle(queue: &TaskQueue) {
        queue.run(async {}).await.unwrap();
    }

    #[tokio::test]
    async fn test_handlers_receive_events_in_order() {
        let queue = TaskQueue::new("events");
        let emitter = EventEmitter::new(queue.clone());
        let collector = Arc::new(Collector::default());
        emitter.subscribe(EventSubscription::all_events(collector.clone()));

        for text in ["one", "two", "three"] {
            emitter.emit(message("bob", text));
        }
        settle(&queue).await;

        assert_eq!(*collector.messages.lock(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_remote_filter_passes_events_without_remote() {
        let queue = TaskQueue::new("events");
        let emitter = EventEmitter::new(queue.clone());
        let collector = Arc::new(Collector::default());
        emitter.subscribe(EventSubscription::remote_events(collector.clone(), "bob"));

        emitter.emit(message("carol", "ignored"));
        emitter.emit(message("bob", "kept"));
        emitter.emit(ClientEvent::ServerDisconnected {
            priority: EventPriority::Critical,
        });
        settle(&queue).await;

        assert_eq!(*collector.messages.lock(), vec!["kept"]);
        assert_eq!(*collector.disconnects.lock(), 1);
    }

    #[tokio::test]
    async fn test_priority_filter() {
        let event = message("bob", "hi");
        let filter = EventFilter {
            min_priority: Some(EventPriority::High),
            ..Default::default()
        };
        assert!(!event.passes_filter(&filter));
        assert!(ClientEvent::ServerDisconnected {
            priority: EventPriority::Critical
        }
        .passes_filter(&filter));
    }

    #[tokio::test]
    async fn test_broadcast_stream_and_unsubscribe() {
        let queue = TaskQueue::new("events");
        let emitter = EventEmitter::new(queue.clone());
        let mut stream = emitter.stream();
        let collector = Arc::new(Collector::default());
        let id = emitter.subscribe(EventSubscription::all_events(collector.clone()));
        assert!(emitter.unsubscribe(id));
        assert!(!emitter.unsubscribe(id));

        emitter.emit(message("bob", "hello"));
        let event = tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.remote_id(), Some("bob"));
        settle(&queue).await;
        assert!(collector.messages.lock().is_empty());
    }
}
