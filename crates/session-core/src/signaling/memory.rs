//! In-memory signaling for tests and demos
//!
//! [`memory_connection`] gives a conference socket whose server side is
//! driven by hand through [`MemoryServer`]. [`MemoryHub`] routes P2P text
//! messages between clients in the same process.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::connection::{ConnectionEvent, OutboundFrame, SignalingConnection};
use super::p2p::{P2PSignalingChannel, P2PSignalingEvent};
use crate::errors::{Result, SessionError};

// ===== CONFERENCE SOCKET =====

struct Link {
    url: Option<String>,
    open: bool,
    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    frames: mpsc::UnboundedSender<OutboundFrame>,
}

/// Client side of an in-memory socket
pub struct MemoryConnection {
    link: Arc<Mutex<Link>>,
}

/// Server side of an in-memory socket
pub struct MemoryServer {
    link: Arc<Mutex<Link>>,
    frames: mpsc::UnboundedReceiver<OutboundFrame>,
}

/// Create a connected client/server pair
pub fn memory_connection() -> (Arc<MemoryConnection>, MemoryServer) {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let link = Arc::new(Mutex::new(Link {
        url: None,
        open: false,
        events: None,
        frames: frames_tx,
    }));
    (
        Arc::new(MemoryConnection { link: link.clone() }),
        MemoryServer {
            link,
            frames: frames_rx,
        },
    )
}

#[async_trait]
impl SignalingConnection for MemoryConnection {
    async fn open(&self, url: &str) -> Result<mpsc::UnboundedReceiver<ConnectionEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ConnectionEvent::Opened);
        let mut link = self.link.lock();
        link.url = Some(url.to_string());
        link.open = true;
        link.events = Some(tx);
        debug!(url, "Memory socket opened");
        Ok(rx)
    }

    fn emit(&self, frame: OutboundFrame) -> Result<()> {
        let link = self.link.lock();
        if !link.open {
            return Err(SessionError::transport("socket is not open"));
        }
        trace!(id = frame.id, name = %frame.name, "Memory socket emit");
        link.frames
            .send(frame)
            .map_err(|_| SessionError::transport("server side is gone"))
    }

    async fn close(&self) {
        let mut link = self.link.lock();
        link.open = false;
        link.events = None;
    }
}

impl MemoryServer {
    fn push(&self, event: ConnectionEvent) {
        if let Some(events) = &self.link.lock().events {
            let _ = events.send(event);
        }
    }

    /// URL the client opened
    pub fn url(&self) -> Option<String> {
        self.link.lock().url.clone()
    }

    pub fn is_open(&self) -> bool {
        self.link.lock().open
    }

    pub async fn next_frame(&mut self) -> Option<OutboundFrame> {
        self.frames.recv().await
    }

    pub fn try_next_frame(&mut self) -> Option<OutboundFrame> {
        self.frames.try_recv().ok()
    }

    /// Skip frames until one named `name` arrives
    pub async fn next_named(&mut self, name: &str) -> Option<OutboundFrame> {
        while let Some(frame) = self.frames.recv().await {
            if frame.name == name {
                return Some(frame);
            }
        }
        None
    }

    pub fn ack(&self, id: u64, data: Value) {
        self.push(ConnectionEvent::Ack { id, data });
    }

    /// Acknowledge with `["ok", data]`
    pub fn ok(&self, id: u64, data: Value) {
        self.ack(id, json!(["ok", data]));
    }

    /// Acknowledge with `["error", message]`
    pub fn error(&self, id: u64, message: &str) {
        self.ack(id, json!(["error", message]));
    }

    pub fn notify(&self, name: &str, data: Value) {
        self.push(ConnectionEvent::Notification {
            name: name.to_string(),
            data,
        });
    }

    /// Simulate a dropped socket that the client library is retrying
    pub fn reconnecting(&self) {
        self.link.lock().open = false;
        self.push(ConnectionEvent::Reconnecting);
    }

    /// Simulate the socket coming back
    pub fn reopen(&self) {
        self.link.lock().open = true;
        self.push(ConnectionEvent::Opened);
    }

    pub fn close(&self, reason: &str) {
        self.push(ConnectionEvent::Closed {
            reason: reason.to_string(),
        });
    }
}

// ===== P2P HUB =====

struct Mailbox {
    tx: mpsc::UnboundedSender<P2PSignalingEvent>,
    held: Option<Vec<P2PSignalingEvent>>,
}

/// Routes P2P messages between in-process clients by id
#[derive(Default)]
pub struct MemoryHub {
    peers: DashMap<String, Arc<Mutex<Mailbox>>>,
    log: Mutex<Vec<(String, String, String)>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A signaling channel attached to this hub
    pub fn channel(self: &Arc<Self>) -> Arc<MemorySignalingChannel> {
        Arc::new(MemorySignalingChannel {
            hub: self.clone(),
            local_id: Mutex::new(None),
        })
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    /// Buffer messages for `id` until [`release`](Self::release)
    pub fn hold(&self, id: &str) {
        if let Some(mailbox) = self.peers.get(id) {
            let mut mailbox = mailbox.lock();
            if mailbox.held.is_none() {
                mailbox.held = Some(Vec::new());
            }
        }
    }

    /// Deliver held messages for `id`, in order
    pub fn release(&self, id: &str) {
        if let Some(mailbox) = self.peers.get(id) {
            let mut mailbox = mailbox.lock();
            if let Some(held) = mailbox.held.take() {
                for event in held {
                    let _ = mailbox.tx.send(event);
                }
            }
        }
    }

    /// Tell `id` the server went away and forget it
    pub fn drop_peer(&self, id: &str) {
        if let Some((_, mailbox)) = self.peers.remove(id) {
            let _ = mailbox.lock().tx.send(P2PSignalingEvent::ServerDisconnected);
        }
    }

    /// Every routed message as `(from, to, text)`
    pub fn messages(&self) -> Vec<(String, String, String)> {
        self.log.lock().clone()
    }

    /// Routed messages from `from` to `to` whose text contains `needle`
    pub fn count_messages(&self, from: &str, to: &str, needle: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|(f, t, m)| f == from && t == to && m.contains(needle))
            .count()
    }

    fn route(&self, from: &str, to: &str, message: &str) -> Result<()> {
        let mailbox = self
            .peers
            .get(to)
            .map(|m| m.clone())
            .ok_or_else(|| SessionError::TargetUnreachable {
                remote_id: to.to_string(),
            })?;
        self.log
            .lock()
            .push((from.to_string(), to.to_string(), message.to_string()));
        let event = P2PSignalingEvent::Message {
            from: from.to_string(),
            message: message.to_string(),
        };
        let mut mailbox = mailbox.lock();
        if let Some(held) = mailbox.held.as_mut() {
            held.push(event);
            return Ok(());
        }
        mailbox.tx.send(event).map_err(|_| SessionError::TargetUnreachable {
            remote_id: to.to_string(),
        })
    }
}

/// P2P signaling channel backed by a [`MemoryHub`]
pub struct MemorySignalingChannel {
    hub: Arc<MemoryHub>,
    local_id: Mutex<Option<String>>,
}

#[async_trait]
impl P2PSignalingChannel for MemorySignalingChannel {
    /// The token is the id this client registers under
    async fn connect(&self, token: &str) -> Result<(String, mpsc::UnboundedReceiver<P2PSignalingEvent>)> {
        if token.is_empty() {
            return Err(SessionError::invalid_token("empty token"));
        }
        if self.hub.peers.contains_key(token) {
            return Err(SessionError::invalid_state(format!("'{}' is already connected", token)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub
            .peers
            .insert(token.to_string(), Arc::new(Mutex::new(Mailbox { tx, held: None })));
        *self.local_id.lock() = Some(token.to_string());
        debug!(id = token, "Joined memory hub");
        Ok((token.to_string(), rx))
    }

    async fn disconnect(&self) -> Result<()> {
        let id = self
            .local_id
            .lock()
            .take()
            .ok_or_else(|| SessionError::invalid_state("not connected"))?;
        self.hub.peers.remove(&id);
        Ok(())
    }

    async fn send_message(&self, remote_id: &str, message: &str) -> Result<()> {
        let from = self
            .local_id
            .lock()
            .clone()
            .ok_or_else(|| SessionError::invalid_state("not connected"))?;
        self.hub.route(&from, remote_id, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hub_routes_and_holds() {
        let hub = MemoryHub::new();
        let a = hub.channel();
        let b = hub.channel();
        let (_, _a_rx) = a.connect("a").await.unwrap();
        let (_, mut b_rx) = b.connect("b").await.unwrap();

        hub.hold("b");
        a.send_message("b", "one").await.unwrap();
        a.send_message("b", "two").await.unwrap();
        assert!(b_rx.try_recv().is_err());
        hub.release("b");
        assert_eq!(
            b_rx.recv().await,
            Some(P2PSignalingEvent::Message { from: "a".into(), message: "one".into() })
        );
        assert_eq!(
            b_rx.recv().await,
            Some(P2PSignalingEvent::Message { from: "a".into(), message: "two".into() })
        );
        assert!(matches!(
            a.send_message("nobody", "x").await,
            Err(SessionError::TargetUnreachable { .. })
        ));
        assert_eq!(hub.count_messages("a", "b", "t"), 1);
    }
}
