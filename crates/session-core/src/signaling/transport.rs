//! Conference signaling transport
//!
//! Every request gets the next sequence id and sits in an ordered queue until
//! the server acknowledges it. Acknowledgements are consumed front to back:
//! queued entries older than the acknowledged id are reported lost, an
//! acknowledgement matching nothing is ignored. While the socket reconnects
//! nothing is dropped; after a successful `relogin` the whole queue is sent
//! again, in order, with fresh ids. A terminal disconnect fails every queued
//! request exactly once.
//!
//! The reconnection ticket received at login is refreshed shortly before it
//! expires. A refresh that comes due while reconnecting waits for `relogin`.
//! A failed refresh ends the transport.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::connection::{ConnectionEvent, OutboundFrame, SignalingConnection};
use super::messages::{events, parse_ack, ServerNotification, UserAgentInfo};
use super::ticket::{LoginToken, ReconnectionTicket};
use crate::config::TransportConfig;
use crate::errors::{Result, SessionError};

/// Lifecycle of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportPhase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// Broadcast to everything that owns sessions on this transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Notification(ServerNotification),
    Reconnecting { attempt: u32 },
    Reconnected,
    /// Terminal. Every open session is invalid from here on.
    ServerDisconnected,
}

struct OutgoingRequest {
    id: u64,
    key: u64,
    name: String,
    payload: Value,
    ack: oneshot::Sender<Result<Value>>,
}

struct ControlRequest {
    name: String,
    ack: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct TransportState {
    phase: TransportPhase,
    next_id: u64,
    next_key: u64,
    queue: VecDeque<OutgoingRequest>,
    /// login, relogin, logout and ticket refresh; never replayed
    control: HashMap<u64, ControlRequest>,
    ticket: Option<ReconnectionTicket>,
    refresh_task: Option<JoinHandle<()>>,
    /// A refresh came due while reconnecting
    refresh_deferred: bool,
    pump_task: Option<JoinHandle<()>>,
    attempts: u32,
    participant_id: Option<String>,
}

/// Ordered, acknowledged request channel to the conference server
pub struct SignalingTransport {
    config: TransportConfig,
    connection: Arc<dyn SignalingConnection>,
    state: Mutex<TransportState>,
    events: broadcast::Sender<TransportEvent>,
    weak_self: Weak<SignalingTransport>,
}

impl std::fmt::Debug for SignalingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SignalingTransport")
            .field("phase", &state.phase)
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl SignalingTransport {
    pub fn new(connection: Arc<dyn SignalingConnection>, config: TransportConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new_cyclic(|weak| Self {
            config,
            connection,
            state: Mutex::new(TransportState {
                next_id: 1,
                ..Default::default()
            }),
            events,
            weak_self: weak.clone(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self) -> TransportPhase {
        self.state.lock().phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == TransportPhase::Connected
    }

    pub fn participant_id(&self) -> Option<String> {
        self.state.lock().participant_id.clone()
    }

    pub fn ticket(&self) -> Option<ReconnectionTicket> {
        self.state.lock().ticket.clone()
    }

    /// Requests waiting for an acknowledgement
    pub fn pending_requests(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Open the socket and log in. Returns the server's login response.
    pub async fn connect(&self, token: &str) -> Result<Value> {
        let login = LoginToken::decode(token)?;
        {
            let mut state = self.state.lock();
            match state.phase {
                TransportPhase::Idle | TransportPhase::Disconnected => {}
                phase => {
                    return Err(SessionError::invalid_state(format!(
                        "transport is {:?}",
                        phase
                    )))
                }
            }
            state.phase = TransportPhase::Connecting;
            state.attempts = 0;
            state.ticket = None;
            state.participant_id = None;
        }

        let rx = match self.connection.open(&login.url()).await {
            Ok(rx) => rx,
            Err(e) => {
                self.state.lock().phase = TransportPhase::Disconnected;
                return Err(e);
            }
        };
        let pump = tokio::spawn(Self::pump(self.weak_self.clone(), rx));
        if let Some(old) = self.state.lock().pump_task.replace(pump) {
            old.abort();
        }

        let user_agent = UserAgentInfo::from_config(&self.config.user_agent, None);
        let payload = json!({
            "token": token,
            "userAgent": user_agent,
            "protocol": self.config.protocol_version,
        });
        match self.control_request(events::LOGIN, payload).await {
            Ok(info) => {
                {
                    let mut state = self.state.lock();
                    state.phase = TransportPhase::Connected;
                    state.participant_id = info.get("id").and_then(Value::as_str).map(str::to_string);
                }
                if let Some(ticket) = info.get("reconnectionTicket").and_then(Value::as_str) {
                    self.on_ticket(ticket);
                }
                let flushed = self.replay_queue();
                info!(url = %login.url(), flushed, "Logged in to conference server");
                Ok(info)
            }
            Err(e) => {
                warn!(error = %e, "Login rejected");
                self.shut_down("login failed", false).await;
                Err(e)
            }
        }
    }

    /// Log out and close. Queued requests fail.
    pub async fn disconnect(&self) -> Result<()> {
        let phase = self.phase();
        match phase {
            TransportPhase::Connected => {
                if let Err(e) = self.control_request(events::LOGOUT, Value::Null).await {
                    debug!(error = %e, "Logout not acknowledged");
                }
            }
            TransportPhase::Reconnecting => {}
            _ => return Err(SessionError::invalid_state("transport is not connected")),
        }
        self.shut_down("client disconnected", true).await;
        Ok(())
    }

    /// Queue a request and send it if the socket is up.
    ///
    /// The id is assigned here, so calls made in sequence reach the server in
    /// that sequence.
    pub fn emit_request(&self, name: &str, payload: Value) -> PendingAck {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        let key = state.next_key;
        state.next_key += 1;
        let pending = PendingAck {
            key,
            name: name.to_string(),
            rx,
            timeout: self.config.ack_timeout,
            transport: self.weak_self.clone(),
        };

        match state.phase {
            TransportPhase::Idle | TransportPhase::Disconnected => {
                let _ = tx.send(Err(SessionError::disconnected("transport is not connected")));
                return pending;
            }
            _ => {}
        }

        let id = state.next_id;
        state.next_id += 1;
        let frame = (state.phase == TransportPhase::Connected).then(|| OutboundFrame {
            id,
            name: name.to_string(),
            payload: payload.clone(),
        });
        state.queue.push_back(OutgoingRequest {
            id,
            key,
            name: name.to_string(),
            payload,
            ack: tx,
        });
        match frame {
            Some(frame) => {
                if let Err(e) = self.connection.emit(frame) {
                    warn!(id, name, error = %e, "Emit failed");
                    if let Some(request) = state.queue.pop_back() {
                        let _ = request.ack.send(Err(e));
                    }
                } else {
                    trace!(id, name, "Request sent");
                }
            }
            None => debug!(id, name, phase = ?state.phase, "Request queued until connected"),
        }
        pending
    }

    /// Send a request and wait for its acknowledgement
    pub async fn request(&self, name: &str, payload: Value) -> Result<Value> {
        self.emit_request(name, payload).wait().await
    }

    /// Send a text message to one participant, or to everyone when `to` is `None`
    pub async fn send_custom_message(&self, to: Option<&str>, message: &str) -> Result<()> {
        let payload = json!({ "to": to.unwrap_or("all"), "message": message });
        self.request(events::TEXT, payload).await.map(|_| ())
    }

    fn forget(&self, key: u64) {
        let mut state = self.state.lock();
        if let Some(pos) = state.queue.iter().position(|r| r.key == key) {
            state.queue.remove(pos);
        }
    }

    async fn control_request(&self, name: &'static str, payload: Value) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.control.insert(
                id,
                ControlRequest {
                    name: name.to_string(),
                    ack: tx,
                },
            );
            let frame = OutboundFrame {
                id,
                name: name.to_string(),
                payload,
            };
            if let Err(e) = self.connection.emit(frame) {
                state.control.remove(&id);
                return Err(e);
            }
            id
        };
        match tokio::time::timeout(self.config.ack_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::disconnected("transport closed")),
            Err(_) => {
                self.state.lock().control.remove(&id);
                Err(SessionError::timeout(name, self.config.ack_timeout.as_millis() as u64))
            }
        }
    }

    async fn pump(weak: Weak<Self>, mut rx: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(transport) = weak.upgrade() else {
                break;
            };
            transport.handle_connection_event(event).await;
        }
        trace!("Connection event pump ended");
    }

    async fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened => self.on_opened(),
            ConnectionEvent::Reconnecting => self.on_reconnecting().await,
            ConnectionEvent::Closed { reason } => self.shut_down(&reason, true).await,
            ConnectionEvent::Ack { id, data } => self.on_ack(id, &data),
            ConnectionEvent::Notification { name, data } => self.on_notification(&name, &data).await,
        }
    }

    fn on_ack(&self, id: u64, data: &Value) {
        let mut resolved = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some(control) = state.control.remove(&id) {
                resolved.push((control.ack, parse_ack(&control.name, data)));
            } else {
                while state.queue.front().is_some_and(|r| r.id < id) {
                    if let Some(lost) = state.queue.pop_front() {
                        warn!(id = lost.id, name = %lost.name, acked = id, "Request lost before acknowledgement");
                        let error = SessionError::transport(format!("'{}' was never acknowledged", lost.name));
                        resolved.push((lost.ack, Err(error)));
                    }
                }
                if state.queue.front().is_some_and(|r| r.id == id) {
                    if let Some(request) = state.queue.pop_front() {
                        trace!(id, name = %request.name, "Acknowledged");
                        resolved.push((request.ack, parse_ack(&request.name, data)));
                    }
                } else {
                    debug!(id, "Acknowledgement matches no queued request");
                }
            }
        }
        for (tx, result) in resolved {
            let _ = tx.send(result);
        }
    }

    async fn on_reconnecting(&self) {
        let verdict = {
            let mut state = self.state.lock();
            match state.phase {
                TransportPhase::Idle | TransportPhase::Disconnected => return,
                _ => {}
            }
            if state.ticket.is_none() {
                Err("connection lost before a reconnection ticket was issued")
            } else {
                state.attempts += 1;
                if state.attempts > self.config.reconnection_attempts {
                    Err("reconnection attempts exhausted")
                } else {
                    state.phase = TransportPhase::Reconnecting;
                    Ok(state.attempts)
                }
            }
        };
        match verdict {
            Ok(attempt) => {
                warn!(attempt, "Signaling connection lost, reconnecting");
                let _ = self.events.send(TransportEvent::Reconnecting { attempt });
            }
            Err(reason) => self.shut_down(reason, true).await,
        }
    }

    fn on_opened(&self) {
        let ticket = {
            let state = self.state.lock();
            if state.phase != TransportPhase::Reconnecting {
                return;
            }
            state.ticket.as_ref().map(|t| t.raw.clone())
        };
        let Some(ticket) = ticket else {
            return;
        };
        // The relogin ack arrives through the pump, so wait for it elsewhere.
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            if let Some(transport) = weak.upgrade() {
                transport.relogin(ticket).await;
            }
        });
    }

    async fn relogin(&self, ticket: String) {
        match self.control_request(events::RELOGIN, Value::String(ticket)).await {
            Ok(data) => {
                let deferred = {
                    let mut state = self.state.lock();
                    if state.phase != TransportPhase::Reconnecting {
                        return;
                    }
                    state.phase = TransportPhase::Connected;
                    state.attempts = 0;
                    std::mem::take(&mut state.refresh_deferred)
                };
                let renewed = match data.as_str() {
                    Some(ticket) => {
                        self.on_ticket(ticket);
                        true
                    }
                    None => false,
                };
                let replayed = self.replay_queue();
                info!(replayed, "Signaling session resumed");
                let _ = self.events.send(TransportEvent::Reconnected);
                if deferred && !renewed {
                    self.refresh_ticket().await;
                }
            }
            Err(e) => {
                error!(error = %e, "Relogin failed");
                self.shut_down("relogin failed", true).await;
            }
        }
    }

    /// Send every queued request again, in order, under fresh ids
    fn replay_queue(&self) -> usize {
        let mut failed = Vec::new();
        let replayed = {
            let mut state = self.state.lock();
            let queue = std::mem::take(&mut state.queue);
            for mut request in queue {
                request.id = state.next_id;
                state.next_id += 1;
                let frame = OutboundFrame {
                    id: request.id,
                    name: request.name.clone(),
                    payload: request.payload.clone(),
                };
                match self.connection.emit(frame) {
                    Ok(()) => state.queue.push_back(request),
                    Err(e) => failed.push((request.ack, e)),
                }
            }
            state.queue.len()
        };
        for (tx, e) in failed {
            let _ = tx.send(Err(e));
        }
        replayed
    }

    async fn on_notification(&self, name: &str, data: &Value) {
        if name == events::DROP {
            info!("Server dropped the session");
            self.shut_down("dropped by server", true).await;
            return;
        }
        match ServerNotification::parse(name, data) {
            Ok(notification) => {
                let _ = self.events.send(TransportEvent::Notification(notification));
            }
            Err(e) => warn!(name, error = %e, "Ignoring malformed notification"),
        }
    }

    fn on_ticket(&self, raw: &str) {
        let ticket = ReconnectionTicket::decode(raw).unwrap_or_else(|e| {
            warn!(error = %e, "Cannot parse reconnection ticket, refresh disabled");
            ReconnectionTicket {
                raw: raw.to_string(),
                not_after_ms: None,
            }
        });
        let delay = ticket.refresh_delay(
            Utc::now().timestamp_millis(),
            self.config.ticket_refresh_margin,
            self.config.ticket_fallback_refresh,
        );

        let mut state = self.state.lock();
        if let Some(task) = state.refresh_task.take() {
            task.abort();
        }
        state.ticket = Some(ticket);
        if let Some(delay) = delay {
            debug!(delay_ms = delay.as_millis() as u64, "Reconnection ticket refresh scheduled");
            let weak = self.weak_self.clone();
            state.refresh_task = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(transport) = weak.upgrade() {
                    transport.refresh_ticket().await;
                }
            }));
        }
    }

    async fn refresh_ticket(&self) {
        {
            let mut state = self.state.lock();
            // This runs on the refresh task itself; detach so nothing aborts it.
            state.refresh_task.take();
            match state.phase {
                TransportPhase::Disconnected => return,
                TransportPhase::Reconnecting => {
                    debug!("Ticket refresh postponed until relogin");
                    state.refresh_deferred = true;
                    return;
                }
                _ => {}
            }
        }
        match self.control_request(events::REFRESH_TICKET, Value::Null).await {
            Ok(Value::String(ticket)) => {
                debug!("Reconnection ticket refreshed");
                self.on_ticket(&ticket);
            }
            Ok(other) => {
                error!(response = %other, "Ticket refresh returned no ticket");
                self.shut_down("reconnection ticket refresh failed", true).await;
            }
            Err(e) => {
                error!(error = %e, "Ticket refresh failed");
                self.shut_down("reconnection ticket refresh failed", true).await;
            }
        }
    }

    async fn shut_down(&self, reason: &str, notify: bool) {
        let (queue, control) = {
            let mut state = self.state.lock();
            if state.phase == TransportPhase::Disconnected {
                return;
            }
            state.phase = TransportPhase::Disconnected;
            if let Some(task) = state.refresh_task.take() {
                task.abort();
            }
            state.ticket = None;
            state.refresh_deferred = false;
            (std::mem::take(&mut state.queue), std::mem::take(&mut state.control))
        };
        let failed = queue.len() + control.len();
        for request in queue {
            let _ = request.ack.send(Err(SessionError::disconnected(reason)));
        }
        for (_, request) in control {
            let _ = request.ack.send(Err(SessionError::disconnected(reason)));
        }
        self.connection.close().await;
        info!(reason, failed, "Signaling transport disconnected");
        if notify {
            let _ = self.events.send(TransportEvent::ServerDisconnected);
        }
    }
}

impl Drop for SignalingTransport {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(task) = state.refresh_task.take() {
            task.abort();
        }
        if let Some(task) = state.pump_task.take() {
            task.abort();
        }
    }
}

/// Acknowledgement of one queued request
#[derive(Debug)]
pub struct PendingAck {
    key: u64,
    name: String,
    rx: oneshot::Receiver<Result<Value>>,
    timeout: Duration,
    transport: Weak<SignalingTransport>,
}

impl PendingAck {
    /// Wait for the server. Timing out removes only this request.
    pub async fn wait(self) -> Result<Value> {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::disconnected("transport dropped the request")),
            Err(_) => {
                if let Some(transport) = self.transport.upgrade() {
                    transport.forget(self.key);
                }
                warn!(name = %self.name, "Request timed out");
                Err(SessionError::timeout(self.name, self.timeout.as_millis() as u64))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::memory::{memory_connection, MemoryServer};
    use crate::signaling::ticket::encode_json;

    fn token() -> String {
        encode_json(&json!({"host": "conference.test"}))
    }

    fn ticket_expiring_in(ms: i64) -> String {
        encode_json(&json!({"notAfter": Utc::now().timestamp_millis() + ms}))
    }

    async fn connected(ticket: Option<String>) -> (Arc<SignalingTransport>, MemoryServer) {
        let (connection, mut server) = memory_connection();
        let transport = SignalingTransport::new(connection, TransportConfig::default());
        let login = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.connect(&token()).await })
        };
        let frame = server.next_frame().await.unwrap();
        assert_eq!(frame.name, "login");
        assert_eq!(frame.payload["protocol"], "1.2");
        let mut info = json!({"id": "participant-1"});
        if let Some(ticket) = ticket {
            info["reconnectionTicket"] = Value::String(ticket);
        }
        server.ok(frame.id, info);
        login.await.unwrap().unwrap();
        (transport, server)
    }

    #[tokio::test]
    async fn test_ids_increase_and_acks_resolve_in_order() {
        let (transport, mut server) = connected(None).await;
        assert_eq!(transport.participant_id().as_deref(), Some("participant-1"));

        let first = transport.emit_request("publish", json!({"n": 1}));
        let second = transport.emit_request("publish", json!({"n": 2}));
        let f1 = server.next_frame().await.unwrap();
        let f2 = server.next_frame().await.unwrap();
        assert!(f1.id < f2.id);

        server.ok(f1.id, json!({"id": "s1"}));
        server.ok(f2.id, json!({"id": "s2"}));
        assert_eq!(first.wait().await.unwrap(), json!({"id": "s1"}));
        assert_eq!(second.wait().await.unwrap(), json!({"id": "s2"}));
        assert_eq!(transport.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_skipped_ack_drops_older_entries_only() {
        let (transport, mut server) = connected(None).await;
        let a = transport.emit_request("text", json!({}));
        let b = transport.emit_request("text", json!({}));
        let c = transport.emit_request("text", json!({}));
        let _fa = server.next_frame().await.unwrap();
        let fb = server.next_frame().await.unwrap();
        let fc = server.next_frame().await.unwrap();

        server.ok(fb.id, Value::Null);
        assert!(matches!(a.wait().await, Err(SessionError::Transport { .. })));
        assert!(b.wait().await.is_ok());
        assert_eq!(transport.pending_requests(), 1);

        // stale id is ignored
        server.ok(fb.id, Value::Null);
        server.ok(fc.id, Value::Null);
        assert!(c.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_queue_replayed_after_relogin() {
        let (transport, mut server) = connected(Some(ticket_expiring_in(600_000))).await;
        let mut events = transport.subscribe();

        let before = transport.emit_request("publish", json!({"n": 1}));
        let sent = server.next_frame().await.unwrap();

        server.reconnecting();
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Reconnecting { attempt: 1 });
        let during = transport.emit_request("publish", json!({"n": 2}));
        assert!(server.try_next_frame().is_none());

        server.reopen();
        let relogin = server.next_frame().await.unwrap();
        assert_eq!(relogin.name, "relogin");
        server.ok(relogin.id, Value::String(ticket_expiring_in(600_000)));

        let r1 = server.next_frame().await.unwrap();
        let r2 = server.next_frame().await.unwrap();
        assert_eq!(r1.payload, json!({"n": 1}));
        assert_eq!(r2.payload, json!({"n": 2}));
        assert!(r1.id > sent.id && r2.id > r1.id);
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Reconnected);

        server.ok(r1.id, Value::Null);
        server.ok(r2.id, Value::Null);
        assert!(before.wait().await.is_ok());
        assert!(during.wait().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_due_while_reconnecting_waits_for_relogin() {
        let (transport, mut server) = connected(Some(ticket_expiring_in(5_000))).await;
        let mut events = transport.subscribe();

        server.reconnecting();
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Reconnecting { attempt: 1 });
        // the refresh timer fires in here
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.phase(), TransportPhase::Reconnecting);
        assert!(server.try_next_frame().is_none());

        server.reopen();
        let relogin = server.next_frame().await.unwrap();
        assert_eq!(relogin.name, "relogin");
        server.ok(relogin.id, Value::Null);
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Reconnected);

        let refresh = server.next_frame().await.unwrap();
        assert_eq!(refresh.name, "refreshReconnectionTicket");
        let renewed = ticket_expiring_in(600_000);
        server.ok(refresh.id, Value::String(renewed.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.ticket().unwrap().raw, renewed);
        assert_eq!(transport.phase(), TransportPhase::Connected);
    }

    #[tokio::test]
    async fn test_reconnect_without_ticket_is_terminal() {
        let (transport, server) = connected(None).await;
        let mut events = transport.subscribe();
        let pending = transport.emit_request("publish", json!({}));
        server.reconnecting();
        assert_eq!(events.recv().await.unwrap(), TransportEvent::ServerDisconnected);
        assert!(matches!(pending.wait().await, Err(SessionError::Disconnected { .. })));
        assert_eq!(transport.phase(), TransportPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_drop_notification_fails_everything_once() {
        let (transport, server) = connected(None).await;
        let mut events = transport.subscribe();
        let a = transport.emit_request("publish", json!({}));
        let b = transport.emit_request("subscribe", json!({}));
        server.notify("drop", Value::Null);
        assert_eq!(events.recv().await.unwrap(), TransportEvent::ServerDisconnected);
        assert!(a.wait().await.is_err());
        assert!(b.wait().await.is_err());
        // a second terminal signal changes nothing
        server.close("gone");
        let after = transport.emit_request("publish", json!({}));
        assert!(matches!(after.wait().await, Err(SessionError::Disconnected { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_keeps_later_entries() {
        let (transport, mut server) = connected(None).await;
        let slow = transport.emit_request("publish", json!({"n": 1}));
        let result = slow.wait().await;
        assert!(matches!(result, Err(SessionError::Timeout { .. })));

        let next = transport.emit_request("publish", json!({"n": 2}));
        let _first = server.next_frame().await.unwrap();
        let second = server.next_frame().await.unwrap();
        server.ok(second.id, Value::Null);
        assert!(next.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_token_rejected_before_connecting() {
        let (connection, _server) = memory_connection();
        let transport = SignalingTransport::new(connection, TransportConfig::default());
        assert!(matches!(
            transport.connect("not a token").await,
            Err(SessionError::InvalidToken { .. })
        ));
        assert_eq!(transport.phase(), TransportPhase::Idle);
    }
}
