//! Client configuration
//!
//! Both clients carry the per-channel [`ChannelConfig`] handed to every
//! session they create, the [`UserAgentConfig`] advertised to peers and
//! servers, and a [`RetryConfig`] for the initial connection.

use std::time::Duration;

use rtcsig_session_core::engine::IceConnectionState;
use rtcsig_session_core::{ChannelConfig, TransportConfig, UserAgentConfig};
use serde::{Deserialize, Serialize};

use super::recovery::RetryConfig;
use crate::error::{ClientError, ClientResult};

/// When a P2P channel counts as stale
///
/// A channel is stale once it is older than `max_age` while its ICE state is
/// one of `states`. Abandoned and ended channels are always stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StalePolicy {
    pub max_age: Duration,
    pub states: Vec<IceConnectionState>,
}

impl Default for StalePolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30),
            states: vec![
                IceConnectionState::New,
                IceConnectionState::Checking,
                IceConnectionState::Disconnected,
                IceConnectionState::Failed,
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2PClientConfig {
    pub channel: ChannelConfig,
    pub user_agent: UserAgentConfig,
    pub stale: StalePolicy,
    pub retry: RetryConfig,
}

impl Default for P2PClientConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            user_agent: UserAgentConfig::default(),
            stale: StalePolicy::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl P2PClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_user_agent(mut self, user_agent: UserAgentConfig) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn with_stale_policy(mut self, stale: StalePolicy) -> Self {
        self.stale = stale;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> ClientResult<()> {
        validate_retry(&self.retry)?;
        if self.channel.disconnect_timeout.is_zero() {
            return Err(ClientError::configuration(
                "channel.disconnect_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConferenceClientConfig {
    pub channel: ChannelConfig,
    pub transport: TransportConfig,
    pub retry: RetryConfig,
    /// Upper bound for the whole join, retries included
    pub join_timeout: Duration,
}

impl Default for ConferenceClientConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            transport: TransportConfig::default(),
            retry: RetryConfig::default(),
            join_timeout: Duration::from_secs(60),
        }
    }
}

impl ConferenceClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn validate(&self) -> ClientResult<()> {
        validate_retry(&self.retry)?;
        if self.join_timeout.is_zero() {
            return Err(ClientError::configuration(
                "join_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn validate_retry(retry: &RetryConfig) -> ClientResult<()> {
    if retry.max_attempts == 0 {
        return Err(ClientError::configuration(
            "retry.max_attempts",
            "at least one attempt is required",
        ));
    }
    if retry.backoff_multiplier < 1.0 {
        return Err(ClientError::configuration(
            "retry.backoff_multiplier",
            "must not shrink the delay",
        ));
    }
    Ok(())
}
