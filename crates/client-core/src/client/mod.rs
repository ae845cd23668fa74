//! Application-facing clients
//!
//! - **`p2p`** - [`P2PClient`], one session per remote peer over a relay
//!   signaling channel, with glare resolution and allow-listing
//! - **`conference`** - [`ConferenceClient`], publications and
//!   subscriptions in a server-arbitrated room
//! - **`config`** - configuration for both clients
//! - **`recovery`** - retry with backoff for the initial connection
//!
//! Both clients run every channel on a private engine queue and deliver
//! [`ClientEvent`](crate::events::ClientEvent)s on a separate event queue,
//! so handlers may call back into the client.

pub mod conference;
pub mod config;
pub mod p2p;
pub mod recovery;

pub use conference::{ConferenceClient, ConferenceInfo, ConferencePublication, ConferenceSubscription};
pub use config::{ConferenceClientConfig, P2PClientConfig, StalePolicy};
pub use p2p::{P2PClient, P2PPublication};
pub use recovery::{retry_with_backoff, with_timeout, RetryConfig};
