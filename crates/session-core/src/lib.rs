//! Session negotiation for WebRTC signaling clients.
//!
//! This crate sits between an application-facing client and a media
//! engine. It owns the parts of a session that are independent of both:
//!
//! - [`sdp`]: codec preference and bandwidth rewriting of session descriptions
//! - [`signaling`]: wire formats, the acknowledged conference transport and
//!   the P2P relay boundary
//! - [`channel`]: the per-session state machine, in P2P and conference flavours
//! - [`engine`]: the media engine boundary, plus an in-process loopback engine
//! - [`executor`]: the serial engine and event queues every channel runs on
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rtcsig_session_core::prelude::*;
//!
//! # async fn example() -> rtcsig_session_core::Result<()> {
//! let (connection, _server) = rtcsig_session_core::signaling::memory::memory_connection();
//! let transport = SignalingTransport::new(connection, TransportConfig::default());
//! let login = transport.connect("eyJob3N0IjoiY29uZmVyZW5jZS5leGFtcGxlIn0=").await?;
//! println!("joined as {:?}", login.get("id"));
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod sdp;
pub mod signaling;

/// Version advertised in user-agent payloads
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use channel::{
    ConferenceChannel, ConferenceChannelObserver, P2PChannel, P2PChannelObserver, Role,
    SessionChannel, SessionState,
};
pub use config::{ChannelConfig, TransportConfig, UserAgentConfig};
pub use errors::{ErrorCategory, Result, SessionError};
pub use executor::{Completion, Executors, PendingResult, TaskQueue};

pub mod prelude {
    pub use crate::channel::p2p::P2PChannelContext;
    pub use crate::channel::{
        ConferenceChannel, ConferenceChannelObserver, MuteTarget, P2PChannel, P2PChannelObserver,
        PublishOptions, RemoteStreamInfo, Role, SessionChannel, SessionState, SubscribeOptions,
    };
    pub use crate::config::{ChannelConfig, TransportConfig, UserAgentConfig};
    pub use crate::engine::{
        IceConnectionState, LocalStream, MediaEngine, MediaTrack, RemoteStream, TrackSource,
    };
    pub use crate::errors::{Result, SessionError};
    pub use crate::executor::{Executors, PendingResult};
    pub use crate::sdp::{AudioCodec, MediaKind, VideoCodec};
    pub use crate::signaling::{
        P2PMessage, P2PSignalingChannel, P2PSignalingEvent, ServerNotification,
        SignalingTransport, TransportEvent,
    };
}
