//! Conference publication and subscription options

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::engine::{LocalStream, StreamSourceInfo, TrackSource};
use crate::errors::{Result, SessionError};
use crate::sdp::MediaKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

// ===== PUBLISH =====

/// Options for publishing a local stream to a conference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishOptions {
    /// Free-form attributes other participants see on the stream
    pub attributes: HashMap<String, String>,
    /// Send the stream's audio tracks
    pub audio: bool,
    /// Send the stream's video tracks
    pub video: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            attributes: HashMap::new(),
            audio: true,
            video: true,
        }
    }
}

impl PublishOptions {
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn audio_only(mut self) -> Self {
        self.video = false;
        self
    }

    pub fn video_only(mut self) -> Self {
        self.audio = false;
        self
    }

    /// Build the `publish` request body for `stream`
    pub fn to_payload(&self, stream: &LocalStream) -> Result<Value> {
        let kind_entry = |kind: MediaKind, wanted: bool| -> Value {
            match stream.source_of(kind) {
                Some(source) if wanted => json!({ "source": source }),
                _ => Value::Bool(false),
            }
        };
        let audio = kind_entry(MediaKind::Audio, self.audio);
        let video = kind_entry(MediaKind::Video, self.video);
        if audio == Value::Bool(false) && video == Value::Bool(false) {
            return Err(SessionError::invalid_argument("nothing to publish"));
        }
        let mut attributes = stream.attributes.clone();
        attributes.extend(self.attributes.clone());
        Ok(json!({
            "media": { "audio": audio, "video": video },
            "attributes": attributes,
            "transport": { "type": "webrtc", "id": Value::Null },
        }))
    }
}

// ===== REMOTE STREAMS =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Forwarded from one participant
    Forward,
    /// Mixed by the server
    Mixed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioCapabilities {
    pub codecs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoCapabilities {
    pub codecs: Vec<String>,
    pub resolutions: Vec<Resolution>,
    pub frame_rates: Vec<u32>,
    pub bitrate_multipliers: Vec<f64>,
    pub key_frame_intervals: Vec<u32>,
}

/// What a subscriber may ask the server for
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionCapabilities {
    pub audio: Option<AudioCapabilities>,
    pub video: Option<VideoCapabilities>,
}

/// A stream advertised by the conference server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStreamInfo {
    pub id: String,
    /// Owning participant, `"mcu"` for mixed streams
    pub origin: String,
    pub kind: StreamKind,
    pub source: StreamSourceInfo,
    pub attributes: HashMap<String, String>,
    /// Layout label of a mixed stream
    pub label: Option<String>,
    pub capabilities: SubscriptionCapabilities,
}

fn str_at<'v>(value: &'v Value, key: &str) -> Option<&'v str> {
    value.get(key).and_then(Value::as_str)
}

fn u32_at(value: &Value, key: &str) -> Option<u32> {
    value.get(key).and_then(Value::as_u64).map(|v| v as u32)
}

fn parse_source(value: &Value) -> Option<TrackSource> {
    value
        .get("source")
        .and_then(|s| serde_json::from_value(s.clone()).ok())
}

fn parse_resolution(value: &Value) -> Option<Resolution> {
    Some(Resolution::new(u32_at(value, "width")?, u32_at(value, "height")?))
}

fn parse_codecs(main: Option<&Value>, optional: Option<&Value>) -> Vec<String> {
    let mut codecs: Vec<String> = Vec::new();
    if let Some(codec) = main.and_then(|f| str_at(f, "codec")) {
        codecs.push(codec.to_string());
    }
    if let Some(formats) = optional.and_then(Value::as_array) {
        codecs.extend(formats.iter().filter_map(|f| str_at(f, "codec")).map(str::to_string));
    }
    codecs
}

fn parse_video(video: &Value) -> VideoCapabilities {
    let mut caps = VideoCapabilities {
        codecs: parse_codecs(
            video.get("format"),
            video.get("optional").and_then(|o| o.get("format")),
        ),
        ..Default::default()
    };
    if let Some(params) = video.get("parameters") {
        if let Some(resolution) = params.get("resolution").and_then(parse_resolution) {
            caps.resolutions.push(resolution);
        }
        if let Some(rate) = u32_at(params, "framerate") {
            caps.frame_rates.push(rate);
        }
        if let Some(interval) = u32_at(params, "keyFrameInterval") {
            caps.key_frame_intervals.push(interval);
        }
    }
    if let Some(params) = video.get("optional").and_then(|o| o.get("parameters")) {
        if let Some(list) = params.get("resolution").and_then(Value::as_array) {
            caps.resolutions.extend(list.iter().filter_map(parse_resolution));
        }
        if let Some(list) = params.get("framerate").and_then(Value::as_array) {
            caps.frame_rates.extend(list.iter().filter_map(Value::as_u64).map(|v| v as u32));
        }
        if let Some(list) = params.get("bitrate").and_then(Value::as_array) {
            // Multipliers arrive as "x0.8"
            caps.bitrate_multipliers.extend(
                list.iter()
                    .filter_map(Value::as_str)
                    .filter_map(|m| m.strip_prefix('x'))
                    .filter_map(|m| m.parse::<f64>().ok()),
            );
        }
        if let Some(list) = params.get("keyFrameInterval").and_then(Value::as_array) {
            caps.key_frame_intervals
                .extend(list.iter().filter_map(Value::as_u64).map(|v| v as u32));
        }
    }
    caps
}

impl RemoteStreamInfo {
    /// Parse a stream entry from the room description or a `stream`
    /// notification
    pub fn from_value(value: &Value) -> Result<Self> {
        let id = str_at(value, "id")
            .ok_or_else(|| SessionError::invalid_argument("stream without id"))?
            .to_string();
        let media = value
            .get("media")
            .filter(|m| m.is_object())
            .ok_or_else(|| SessionError::invalid_argument(format!("stream {} has no media info", id)))?;
        let kind = match str_at(value, "type") {
            Some("forward") => StreamKind::Forward,
            Some("mixed") => StreamKind::Mixed,
            other => {
                return Err(SessionError::invalid_argument(format!(
                    "stream {} has unknown type {:?}",
                    id, other
                )))
            }
        };
        let info = value.get("info").cloned().unwrap_or(Value::Null);

        let audio = media.get("audio").filter(|a| a.is_object());
        let video = media.get("video").filter(|v| v.is_object());
        let mut source = StreamSourceInfo {
            audio: audio.and_then(parse_source),
            video: video.and_then(parse_source),
        };

        let (origin, attributes, label) = match kind {
            StreamKind::Forward => {
                let owner = str_at(&info, "owner").ok_or_else(|| {
                    SessionError::invalid_argument(format!("forward stream {} has no owner", id))
                })?;
                let attributes: HashMap<String, String> = info
                    .get("attributes")
                    .and_then(Value::as_object)
                    .map(|map| {
                        map.iter()
                            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                            .collect()
                    })
                    .unwrap_or_default();
                (owner.to_string(), attributes, None)
            }
            StreamKind::Mixed => {
                source = StreamSourceInfo {
                    audio: audio.map(|_| TrackSource::Mixed),
                    video: video.map(|_| TrackSource::Mixed),
                };
                ("mcu".to_string(), HashMap::new(), str_at(&info, "label").map(str::to_string))
            }
        };

        let capabilities = SubscriptionCapabilities {
            audio: audio.map(|a| AudioCapabilities {
                codecs: parse_codecs(a.get("format"), a.get("optional").and_then(|o| o.get("format"))),
            }),
            video: video.map(parse_video),
        };

        Ok(Self {
            id,
            origin,
            kind,
            source,
            attributes,
            label,
            capabilities,
        })
    }

    pub fn has_audio(&self) -> bool {
        self.capabilities.audio.is_some()
    }

    pub fn has_video(&self) -> bool {
        self.capabilities.video.is_some()
    }
}

// ===== SUBSCRIBE =====

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioSubscriptionConstraints {
    /// Acceptable codecs, empty for any
    pub codecs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoSubscriptionConstraints {
    pub codecs: Vec<String>,
    pub resolution: Option<Resolution>,
    pub frame_rate: Option<u32>,
    pub bitrate_multiplier: Option<f64>,
    pub key_frame_interval: Option<u32>,
}

impl VideoSubscriptionConstraints {
    fn validate(&self, caps: &VideoCapabilities) -> Result<()> {
        codecs_allowed(&self.codecs, &caps.codecs)?;
        if let Some(resolution) = self.resolution {
            if !caps.resolutions.contains(&resolution) {
                return Err(SessionError::invalid_argument(format!(
                    "resolution {}x{} is not offered",
                    resolution.width, resolution.height
                )));
            }
        }
        if let Some(rate) = self.frame_rate {
            if !caps.frame_rates.contains(&rate) {
                return Err(SessionError::invalid_argument(format!("frame rate {} is not offered", rate)));
            }
        }
        if let Some(multiplier) = self.bitrate_multiplier {
            if !caps.bitrate_multipliers.iter().any(|m| (m - multiplier).abs() < 1e-6)
                && (multiplier - 1.0).abs() > 1e-6
            {
                return Err(SessionError::invalid_argument(format!(
                    "bitrate multiplier {} is not offered",
                    multiplier
                )));
            }
        }
        if let Some(interval) = self.key_frame_interval {
            if !caps.key_frame_intervals.contains(&interval) {
                return Err(SessionError::invalid_argument(format!(
                    "key frame interval {} is not offered",
                    interval
                )));
            }
        }
        Ok(())
    }

    /// `parameters` object, `None` when nothing beyond defaults is asked
    fn parameters(&self) -> Option<Value> {
        let mut params = Map::new();
        if let Some(resolution) = self.resolution {
            params.insert("resolution".into(), json!(resolution));
        }
        if let Some(rate) = self.frame_rate {
            params.insert("framerate".into(), json!(rate));
        }
        if let Some(multiplier) = self.bitrate_multiplier {
            if (multiplier - 1.0).abs() > 1e-6 {
                params.insert("bitrate".into(), json!(format!("x{}", multiplier)));
            }
        }
        if let Some(interval) = self.key_frame_interval {
            params.insert("keyFrameInterval".into(), json!(interval));
        }
        (!params.is_empty()).then_some(Value::Object(params))
    }
}

fn codecs_allowed(wanted: &[String], offered: &[String]) -> Result<()> {
    for codec in wanted {
        if !offered.iter().any(|o| o.eq_ignore_ascii_case(codec)) {
            return Err(SessionError::invalid_argument(format!("codec {} is not offered", codec)));
        }
    }
    Ok(())
}

/// What to receive from a remote stream. `None` skips that kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    pub audio: Option<AudioSubscriptionConstraints>,
    pub video: Option<VideoSubscriptionConstraints>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            audio: Some(AudioSubscriptionConstraints::default()),
            video: Some(VideoSubscriptionConstraints::default()),
        }
    }
}

impl SubscribeOptions {
    pub fn audio_only() -> Self {
        Self {
            audio: Some(AudioSubscriptionConstraints::default()),
            video: None,
        }
    }

    pub fn video_only() -> Self {
        Self {
            audio: None,
            video: Some(VideoSubscriptionConstraints::default()),
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.video.get_or_insert_with(Default::default).resolution = Some(Resolution::new(width, height));
        self
    }

    pub fn with_frame_rate(mut self, rate: u32) -> Self {
        self.video.get_or_insert_with(Default::default).frame_rate = Some(rate);
        self
    }

    pub fn with_bitrate_multiplier(mut self, multiplier: f64) -> Self {
        self.video.get_or_insert_with(Default::default).bitrate_multiplier = Some(multiplier);
        self
    }

    pub fn with_key_frame_interval(mut self, interval: u32) -> Self {
        self.video.get_or_insert_with(Default::default).key_frame_interval = Some(interval);
        self
    }

    /// Check the request against what the stream offers
    pub fn validate(&self, caps: &SubscriptionCapabilities) -> Result<()> {
        if self.audio.is_none() && self.video.is_none() {
            return Err(SessionError::invalid_argument("subscribe needs audio or video"));
        }
        if let Some(audio) = &self.audio {
            let offered = caps
                .audio
                .as_ref()
                .ok_or_else(|| SessionError::invalid_argument("stream has no audio"))?;
            codecs_allowed(&audio.codecs, &offered.codecs)?;
        }
        if let Some(video) = &self.video {
            let offered = caps
                .video
                .as_ref()
                .ok_or_else(|| SessionError::invalid_argument("stream has no video"))?;
            video.validate(offered)?;
        }
        Ok(())
    }

    /// Build the `subscribe` request body
    pub fn to_payload(&self, stream_id: &str) -> Value {
        let audio = match &self.audio {
            Some(_) => json!({ "from": stream_id }),
            None => Value::Bool(false),
        };
        let video = match &self.video {
            Some(video) => {
                let mut entry = json!({ "from": stream_id });
                if let Some(params) = video.parameters() {
                    entry["parameters"] = params;
                }
                entry
            }
            None => Value::Bool(false),
        };
        json!({
            "media": { "audio": audio, "video": video },
            "transport": { "type": "webrtc", "id": Value::Null },
        })
    }

    /// `subscription-control` update body for video parameters
    pub fn update_payload(&self, session_id: &str) -> Value {
        let params = self
            .video
            .as_ref()
            .and_then(VideoSubscriptionConstraints::parameters)
            .unwrap_or_else(|| json!({}));
        json!({
            "id": session_id,
            "operation": "update",
            "data": { "video": { "parameters": params } },
        })
    }
}

/// Which tracks a pause/play applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MuteTarget {
    Audio,
    Video,
    AudioAndVideo,
}

impl MuteTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            MuteTarget::Audio => "audio",
            MuteTarget::Video => "video",
            MuteTarget::AudioAndVideo => "av",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MediaTrack;

    fn forward_stream() -> Value {
        json!({
            "id": "stream-1",
            "type": "forward",
            "media": {
                "audio": {"source": "mic", "format": {"codec": "opus", "sampleRate": 48000}},
                "video": {
                    "source": "camera",
                    "format": {"codec": "vp8"},
                    "parameters": {"resolution": {"width": 1280, "height": 720}, "framerate": 30},
                    "optional": {
                        "format": [{"codec": "h264", "profile": "CB"}],
                        "parameters": {
                            "resolution": [{"width": 640, "height": 360}],
                            "framerate": [15, 24],
                            "bitrate": ["x0.8", "x0.6"],
                            "keyFrameInterval": [100]
                        }
                    }
                }
            },
            "info": {"owner": "alice", "attributes": {"room": "blue"}}
        })
    }

    #[test]
    fn test_parse_forward_stream() {
        let info = RemoteStreamInfo::from_value(&forward_stream()).unwrap();
        assert_eq!(info.origin, "alice");
        assert_eq!(info.kind, StreamKind::Forward);
        assert_eq!(info.source.video, Some(TrackSource::Camera));
        assert_eq!(info.attributes.get("room").map(String::as_str), Some("blue"));
        let video = info.capabilities.video.unwrap();
        assert_eq!(video.codecs, vec!["vp8".to_string(), "h264".to_string()]);
        assert_eq!(video.resolutions, vec![Resolution::new(1280, 720), Resolution::new(640, 360)]);
        assert_eq!(video.frame_rates, vec![30, 15, 24]);
        assert_eq!(video.bitrate_multipliers, vec![0.8, 0.6]);
    }

    #[test]
    fn test_parse_mixed_stream() {
        let value = json!({
            "id": "mix",
            "type": "mixed",
            "media": {"audio": {"format": {"codec": "opus"}}, "video": {"format": {"codec": "h264"}}},
            "info": {"label": "common"}
        });
        let info = RemoteStreamInfo::from_value(&value).unwrap();
        assert_eq!(info.origin, "mcu");
        assert_eq!(info.label.as_deref(), Some("common"));
        assert_eq!(info.source.audio, Some(TrackSource::Mixed));
    }

    #[test]
    fn test_rejects_unknown_type() {
        let value = json!({"id": "x", "type": "other", "media": {}});
        assert!(RemoteStreamInfo::from_value(&value).is_err());
    }

    #[test]
    fn test_subscribe_validation() {
        let info = RemoteStreamInfo::from_value(&forward_stream()).unwrap();
        let caps = &info.capabilities;
        assert!(SubscribeOptions::default().with_resolution(640, 360).validate(caps).is_ok());
        assert!(SubscribeOptions::default().with_resolution(320, 180).validate(caps).is_err());
        assert!(SubscribeOptions::default().with_frame_rate(60).validate(caps).is_err());
        assert!(SubscribeOptions::default().with_bitrate_multiplier(0.6).validate(caps).is_ok());
        assert!(SubscribeOptions::default().with_bitrate_multiplier(0.3).validate(caps).is_err());

        let mut audio_only = info.capabilities.clone();
        audio_only.video = None;
        assert!(SubscribeOptions::default().validate(&audio_only).is_err());
        assert!(SubscribeOptions::audio_only().validate(&audio_only).is_ok());
    }

    #[test]
    fn test_subscribe_payload() {
        let payload = SubscribeOptions::default()
            .with_bitrate_multiplier(0.8)
            .with_key_frame_interval(100)
            .to_payload("stream-1");
        assert_eq!(payload["media"]["audio"], json!({"from": "stream-1"}));
        assert_eq!(payload["media"]["video"]["parameters"]["bitrate"], "x0.8");
        assert_eq!(payload["media"]["video"]["parameters"]["keyFrameInterval"], 100);

        let plain = SubscribeOptions::video_only().with_bitrate_multiplier(1.0).to_payload("s");
        assert_eq!(plain["media"]["audio"], json!(false));
        assert!(plain["media"]["video"].get("parameters").is_none());
    }

    #[test]
    fn test_publish_payload() {
        let stream = LocalStream::new(
            "local",
            vec![MediaTrack::new("v1", MediaKind::Video).with_source(TrackSource::ScreenCast)],
        )
        .with_attribute("name", "slides");
        let payload = PublishOptions::default().to_payload(&stream).unwrap();
        assert_eq!(payload["media"]["audio"], json!(false));
        assert_eq!(payload["media"]["video"], json!({"source": "screen-cast"}));
        assert_eq!(payload["attributes"]["name"], "slides");
        assert!(PublishOptions::default().audio_only().to_payload(&stream).is_err());
    }
}
