//! SDP text utilities
//!
//! Only preference ordering and bitrate hints are handled here; everything
//! else about codec negotiation belongs to the media engine.

pub mod codec;
pub mod types;

pub use codec::{set_preferred_codecs, set_start_video_bandwidth};
pub use types::{AudioCodec, CodecPreferenceList, MediaKind, SdpType, SessionDescription, VideoCodec};
