//! Client-core: application-facing WebRTC signaling clients
//!
//! This crate wraps the session channels of `rtcsig-session-core` in two
//! clients an application can drive directly:
//!
//! ```text
//! client-core -> session-core -> {signaling connection, media engine}
//! ```
//!
//! Client-core focuses on:
//! - One-call publish, subscribe and messaging APIs
//! - Event delivery for UI integration
//! - Configuration and connection retry
//! - Tracking which sessions belong to which peer or room
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rtcsig_client_core::prelude::*;
//! use rtcsig_session_core::engine::loopback::LoopbackEngine;
//! use rtcsig_session_core::signaling::memory::MemoryHub;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hub = MemoryHub::new();
//! let client = P2PClient::new(
//!     P2PClientConfig::default(),
//!     hub.channel(),
//!     Arc::new(LoopbackEngine::new()),
//! )?;
//! client.connect("alice").await?;
//! client.add_allowed_remote_id("bob");
//! client.send("bob", "hello").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod events;

pub use client::{
    ConferenceClient, ConferenceClientConfig, ConferenceInfo, ConferencePublication,
    ConferenceSubscription, P2PClient, P2PClientConfig, P2PPublication, RetryConfig, StalePolicy,
};
pub use error::{ClientError, ClientResult};
pub use events::{
    ClientEvent, ClientEventHandler, EventFilter, EventPriority, EventSubscription, MessageInfo,
    ParticipantInfo,
};

/// Client-core version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod prelude {
    pub use crate::client::{
        ConferenceClient, ConferenceClientConfig, P2PClient, P2PClientConfig, RetryConfig,
    };
    pub use crate::error::{ClientError, ClientResult};
    pub use crate::events::{ClientEvent, ClientEventHandler, EventPriority, EventSubscription};
    pub use rtcsig_session_core::channel::{MuteTarget, PublishOptions, SubscribeOptions};
    pub use rtcsig_session_core::engine::{LocalStream, MediaTrack, RemoteStream};
}
