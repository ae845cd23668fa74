//! Signaling: wire formats, the conference transport and the P2P boundary

pub mod connection;
pub mod memory;
pub mod messages;
pub mod p2p;
pub mod ticket;
pub mod transport;

pub use connection::{ConnectionEvent, OutboundFrame, SignalingConnection};
pub use messages::{P2PMessage, ServerNotification, SignalPayload};
pub use p2p::{P2PSignalingChannel, P2PSignalingEvent};
pub use ticket::{LoginToken, ReconnectionTicket};
pub use transport::{PendingAck, SignalingTransport, TransportEvent, TransportPhase};
