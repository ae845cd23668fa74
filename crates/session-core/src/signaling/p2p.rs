//! P2P signaling boundary
//!
//! The P2P server only relays opaque text between ids. Everything about
//! sessions lives in the application messages of [`super::messages`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::Result;

/// Inbound events from a P2P signaling server
#[derive(Debug, Clone, PartialEq)]
pub enum P2PSignalingEvent {
    Message { from: String, message: String },
    ServerDisconnected,
}

#[async_trait]
pub trait P2PSignalingChannel: Send + Sync + 'static {
    /// Authenticate and return the local id with the inbound event stream
    async fn connect(&self, token: &str) -> Result<(String, mpsc::UnboundedReceiver<P2PSignalingEvent>)>;

    async fn disconnect(&self) -> Result<()>;

    /// Relay `message` to `remote_id`. Fails with `TargetUnreachable` when
    /// the server does not know the peer.
    async fn send_message(&self, remote_id: &str, message: &str) -> Result<()>;
}
