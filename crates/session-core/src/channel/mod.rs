//! Session channels
//!
//! A channel owns one media-session handle and turns local requests plus
//! remote signaling into engine calls. [`ChannelCore`] holds what every
//! variant shares: the session state machine, candidate buffering and the
//! exactly-once release of the handle. [`P2PChannel`] adds the peer
//! application protocol, [`ConferenceChannel`] the server-arbitrated one.
//!
//! All channel work runs on the engine [`TaskQueue`]; results and observer
//! notifications go out through the event queue.

pub mod base;
pub mod buffer;
pub mod conference;
pub mod options;
pub mod p2p;

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::engine::EngineEvent;
use crate::errors::Result;
use crate::executor::TaskQueue;

pub use base::{ChannelCore, StableAction};
pub use buffer::FifoBuffer;
pub use conference::{ConferenceChannel, ConferenceChannelObserver};
pub use options::{
    MuteTarget, PublishOptions, RemoteStreamInfo, Resolution, StreamKind, SubscribeOptions,
    SubscriptionCapabilities,
};
pub use p2p::{P2PChannel, P2PChannelObserver};

/// Negotiation progress of one session.
///
/// States only move forward, except that `Closed` is reachable from
/// anywhere and is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Ready,
    Offered,
    Pending,
    Matched,
    Connecting,
    Connected,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        match (self, next) {
            (SessionState::Closed, _) => false,
            (_, SessionState::Closed) => true,
            (from, to) => to > from,
        }
    }

    /// A WebRTC exchange is under way or established
    pub fn is_negotiating(self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Ready => "ready",
            SessionState::Offered => "offered",
            SessionState::Pending => "pending",
            SessionState::Matched => "matched",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What the local side does in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Peer,
    Publisher,
    Subscriber,
}

/// Capabilities shared by the channel variants.
///
/// Every method here runs on the engine queue; the public request methods
/// of each variant post onto that queue and return immediately.
#[async_trait]
pub trait SessionChannel: Send + Sync + 'static {
    /// Signaling message type consumed by this variant
    type Signal: Send + 'static;

    fn core(&self) -> &ChannelCore;

    fn role(&self) -> Role;

    fn state(&self) -> SessionState {
        self.core().state()
    }

    /// Create, rewrite, apply and send a local offer
    async fn create_offer(self: Arc<Self>) -> Result<()>;

    /// Create, rewrite, apply and send a local answer
    async fn create_answer(self: Arc<Self>) -> Result<()>;

    async fn handle_signaling_message(self: Arc<Self>, message: Self::Signal) -> Result<()>;

    async fn handle_engine_event(self: Arc<Self>, event: EngineEvent);

    /// Release the session without notifying the remote side
    async fn close(self: Arc<Self>);
}

/// Forward engine notifications onto the engine queue until the channel is
/// gone or released
pub(crate) fn spawn_event_pump<C: SessionChannel>(
    channel: Weak<C>,
    queue: TaskQueue,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(channel) = channel.upgrade() else {
                break;
            };
            if channel.core().is_ended() {
                trace!(channel = %channel.core().key(), "Dropping engine event after release");
                break;
            }
            queue.post(async move {
                if !channel.core().is_ended() {
                    channel.handle_engine_event(event).await;
                }
            });
        }
    })
}
