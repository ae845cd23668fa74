//! Types for SDP negotiation

use std::fmt;

use serde::{Deserialize, Serialize};

/// Media kind of an `m=` section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audio codecs understood by the preference rewriter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioCodec {
    Opus,
    Isac,
    G722,
    Pcmu,
    Ilbc,
    Pcma,
}

impl AudioCodec {
    /// Encoding name as it appears in `a=rtpmap`
    pub fn sdp_name(&self) -> &'static str {
        match self {
            AudioCodec::Opus => "OPUS",
            AudioCodec::Isac => "ISAC",
            AudioCodec::G722 => "G722",
            AudioCodec::Pcmu => "PCMU",
            AudioCodec::Ilbc => "ILBC",
            AudioCodec::Pcma => "PCMA",
        }
    }
}

/// Video codecs understood by the preference rewriter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    Vp8,
    H264,
    Vp9,
    H265,
    Av1,
}

impl VideoCodec {
    /// Encoding name as it appears in `a=rtpmap`
    pub fn sdp_name(&self) -> &'static str {
        match self {
            VideoCodec::Vp8 => "VP8",
            VideoCodec::H264 => "H264",
            VideoCodec::Vp9 => "VP9",
            VideoCodec::H265 => "H265",
            VideoCodec::Av1 => "AV1",
        }
    }
}

/// Ordered codec preference, highest priority first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecPreferenceList(pub Vec<String>);

impl CodecPreferenceList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<AudioCodec>> for CodecPreferenceList {
    fn from(codecs: Vec<AudioCodec>) -> Self {
        Self(codecs.iter().map(|c| c.sdp_name().to_string()).collect())
    }
}

impl From<Vec<VideoCodec>> for CodecPreferenceList {
    fn from(codecs: Vec<VideoCodec>) -> Self {
        Self(codecs.iter().map(|c| c.sdp_name().to_string()).collect())
    }
}

impl From<Vec<&str>> for CodecPreferenceList {
    fn from(names: Vec<&str>) -> Self {
        Self(names.into_iter().map(str::to_string).collect())
    }
}

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
            SdpType::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// A session description as exchanged with the media engine and the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }
}
