//! Socket boundary used by the conference transport

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::Result;

/// One outbound named event
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub id: u64,
    pub name: String,
    pub payload: Value,
}

/// What the socket reports back
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Socket (re)opened
    Opened,
    /// Socket lost, the library is retrying
    Reconnecting,
    /// Socket gone and no longer retrying
    Closed { reason: String },
    /// Acknowledgement for frame `id`, shaped `[status, data]`
    Ack { id: u64, data: Value },
    Notification { name: String, data: Value },
}

/// A socket.io-style connection with acknowledged emits
#[async_trait]
pub trait SignalingConnection: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<mpsc::UnboundedReceiver<ConnectionEvent>>;

    /// Queue a frame for sending. Must not block.
    fn emit(&self, frame: OutboundFrame) -> Result<()>;

    async fn close(&self);
}
