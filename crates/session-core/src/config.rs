//! Channel and transport configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sdp::{AudioCodec, CodecPreferenceList, VideoCodec};

/// Per-channel negotiation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Audio codec preference, highest priority first
    pub audio_codecs: CodecPreferenceList,
    /// Video codec preference, highest priority first
    pub video_codecs: CodecPreferenceList,
    /// Audio sender cap in kbps, 0 for engine default
    pub max_audio_bitrate_kbps: u32,
    /// Video sender cap in kbps, 0 for engine default
    pub max_video_bitrate_kbps: u32,
    /// Hint written into local offers, 0 to leave the SDP untouched
    pub start_video_bitrate_kbps: u32,
    /// How long a P2P session may stay ICE-disconnected before it is stopped
    pub disconnect_timeout: Duration,
    pub continual_ice_gathering: bool,
    pub ice_servers: Vec<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            audio_codecs: CodecPreferenceList::new(),
            video_codecs: CodecPreferenceList::new(),
            max_audio_bitrate_kbps: 0,
            max_video_bitrate_kbps: 0,
            start_video_bitrate_kbps: 0,
            disconnect_timeout: Duration::from_secs(10),
            continual_ice_gathering: true,
            ice_servers: Vec::new(),
        }
    }
}

impl ChannelConfig {
    /// Narrowband settings: Opus and VP8 only, capped bitrates
    pub fn low_bandwidth() -> Self {
        Self {
            audio_codecs: vec![AudioCodec::Opus].into(),
            video_codecs: vec![VideoCodec::Vp8].into(),
            max_audio_bitrate_kbps: 32,
            max_video_bitrate_kbps: 300,
            start_video_bitrate_kbps: 150,
            ..Self::default()
        }
    }

    pub fn with_audio_codecs(mut self, codecs: impl Into<CodecPreferenceList>) -> Self {
        self.audio_codecs = codecs.into();
        self
    }

    pub fn with_video_codecs(mut self, codecs: impl Into<CodecPreferenceList>) -> Self {
        self.video_codecs = codecs.into();
        self
    }

    pub fn with_max_bitrates(mut self, audio_kbps: u32, video_kbps: u32) -> Self {
        self.max_audio_bitrate_kbps = audio_kbps;
        self.max_video_bitrate_kbps = video_kbps;
        self
    }

    pub fn with_start_video_bitrate(mut self, kbps: u32) -> Self {
        self.start_video_bitrate_kbps = kbps;
        self
    }

    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }
}

/// Signaling transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Reconnect attempts tolerated before the disconnect becomes terminal
    pub reconnection_attempts: u32,
    pub reconnection_delay: Duration,
    /// Refresh the ticket this long before it expires
    pub ticket_refresh_margin: Duration,
    /// Refresh delay used when the ticket is already past its expiry
    pub ticket_fallback_refresh: Duration,
    /// Per-request acknowledgement deadline
    pub ack_timeout: Duration,
    pub protocol_version: String,
    pub user_agent: UserAgentConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnection_attempts: 10,
            reconnection_delay: Duration::from_secs(2),
            ticket_refresh_margin: Duration::from_secs(1),
            ticket_fallback_refresh: Duration::from_secs(5 * 60),
            ack_timeout: Duration::from_secs(30),
            protocol_version: "1.2".to_string(),
            user_agent: UserAgentConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn with_reconnection(mut self, attempts: u32, delay: Duration) -> Self {
        self.reconnection_attempts = attempts;
        self.reconnection_delay = delay;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }
}

/// Identification sent at login and in P2P user-agent messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAgentConfig {
    pub sdk_type: String,
    pub sdk_version: String,
    pub runtime_name: String,
    pub runtime_version: String,
    pub os_name: String,
    pub os_version: String,
}

impl Default for UserAgentConfig {
    fn default() -> Self {
        Self {
            sdk_type: "Rust".to_string(),
            sdk_version: crate::VERSION.to_string(),
            runtime_name: "tokio".to_string(),
            runtime_version: "1".to_string(),
            os_name: std::env::consts::OS.to_string(),
            os_version: std::env::consts::ARCH.to_string(),
        }
    }
}
