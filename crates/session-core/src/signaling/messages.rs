//! Signaling wire formats
//!
//! P2P application messages are JSON objects `{type, data}` carried as text
//! by the P2P signaling channel. Conference messages are named events with
//! JSON payloads; their acknowledgements are `[status, data]` arrays.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::UserAgentConfig;
use crate::engine::{IceCandidate, StreamSourceInfo, TrackSource};
use crate::errors::{Result, SessionError};
use crate::sdp::{SdpType, SessionDescription};

// ===== P2P =====

/// Close code sent when the remote engine cannot honour our ICE gathering policy
pub const CLOSE_CODE_GATHERING_UNSUPPORTED: u32 = 2601;

/// Label of the data channel carrying text messages
pub const TEXT_CHANNEL_LABEL: &str = "message";

/// Application message exchanged between two peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum P2PMessage {
    #[serde(rename = "chat-ua")]
    UserAgent(UserAgentInfo),
    #[serde(rename = "chat-signal")]
    Signal(SignalPayload),
    #[serde(rename = "chat-track-sources")]
    TrackSources(Vec<TrackSourceEntry>),
    #[serde(rename = "chat-stream-info")]
    StreamInfo(StreamInfo),
    #[serde(rename = "chat-tracks-added")]
    TracksAdded(Vec<String>),
    #[serde(rename = "chat-tracks-removed")]
    TracksRemoved(Vec<String>),
    /// Acknowledges a text message by id
    #[serde(rename = "chat-data-received")]
    DataReceived(String),
    #[serde(rename = "chat-closed")]
    Closed(Option<CloseInfo>),
}

impl P2PMessage {
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a received message. A missing `data` field is read as null.
    pub fn parse(text: &str) -> Result<Self> {
        let mut value: Value = serde_json::from_str(text)?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| SessionError::invalid_argument("P2P message is not an object"))?;
        object.entry("data").or_insert(Value::Null);
        Ok(serde_json::from_value(value)?)
    }

    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            P2PMessage::UserAgent(_) => "chat-ua",
            P2PMessage::Signal(_) => "chat-signal",
            P2PMessage::TrackSources(_) => "chat-track-sources",
            P2PMessage::StreamInfo(_) => "chat-stream-info",
            P2PMessage::TracksAdded(_) => "chat-tracks-added",
            P2PMessage::TracksRemoved(_) => "chat-tracks-removed",
            P2PMessage::DataReceived(_) => "chat-data-received",
            P2PMessage::Closed(_) => "chat-closed",
        }
    }

    pub fn is_offer(&self) -> bool {
        matches!(self, P2PMessage::Signal(SignalPayload::Offer { .. }))
    }
}

/// Payload of `chat-signal`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidates {
        candidate: String,
        #[serde(rename = "sdpMid")]
        sdp_mid: String,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: u32,
    },
    RemovedCandidates {
        candidates: Vec<IceCandidate>,
    },
}

impl SignalPayload {
    pub fn from_description(description: &SessionDescription) -> Option<Self> {
        let sdp = description.sdp.clone();
        match description.sdp_type {
            SdpType::Offer => Some(SignalPayload::Offer { sdp }),
            SdpType::Answer => Some(SignalPayload::Answer { sdp }),
            _ => None,
        }
    }

    pub fn from_candidate(candidate: &IceCandidate) -> Self {
        SignalPayload::Candidates {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
        }
    }
}

/// `chat-closed` details
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One entry of `chat-track-sources`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSourceEntry {
    pub id: String,
    pub source: TrackSource,
}

/// `chat-stream-info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: String,
    pub tracks: Vec<String>,
    pub source: StreamSourceInfo,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
}

/// Peer capabilities advertised in `chat-ua`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerCapabilities {
    #[serde(default)]
    pub continual_ice_gathering: bool,
    #[serde(default)]
    pub unified_plan: bool,
    #[serde(default)]
    pub stream_removable: bool,
    #[serde(default)]
    pub ignore_data_channel_acks: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameVersion {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdkInfo {
    #[serde(rename = "type", default)]
    pub sdk_type: String,
    #[serde(default)]
    pub version: String,
}

/// Payload of `chat-ua` and of the conference login `userAgent`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAgentInfo {
    #[serde(default)]
    pub sdk: SdkInfo,
    #[serde(default)]
    pub runtime: NameVersion,
    #[serde(default)]
    pub os: NameVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<PeerCapabilities>,
}

impl UserAgentInfo {
    pub fn from_config(config: &UserAgentConfig, capabilities: Option<PeerCapabilities>) -> Self {
        Self {
            sdk: SdkInfo {
                sdk_type: config.sdk_type.clone(),
                version: config.sdk_version.clone(),
            },
            runtime: NameVersion {
                name: config.runtime_name.clone(),
                version: config.runtime_version.clone(),
            },
            os: NameVersion {
                name: config.os_name.clone(),
                version: config.os_version.clone(),
            },
            capabilities,
        }
    }
}

/// Text message carried over the data channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
    pub id: String,
    pub data: String,
}

// ===== CONFERENCE =====

pub mod events {
    pub const LOGIN: &str = "login";
    pub const RELOGIN: &str = "relogin";
    pub const LOGOUT: &str = "logout";
    pub const REFRESH_TICKET: &str = "refreshReconnectionTicket";
    pub const PUBLISH: &str = "publish";
    pub const UNPUBLISH: &str = "unpublish";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const SOAC: &str = "soac";
    pub const STREAM_CONTROL: &str = "stream-control";
    pub const SUBSCRIPTION_CONTROL: &str = "subscription-control";
    pub const TEXT: &str = "text";
    pub const PROGRESS: &str = "progress";
    pub const STREAM: &str = "stream";
    pub const PARTICIPANT: &str = "participant";
    pub const DROP: &str = "drop";
    pub const CONNECTION_FAILED: &str = "connection_failed";
}

/// Turn a `[status, data]` acknowledgement into a result
pub fn parse_ack(event: &str, ack: &Value) -> Result<Value> {
    let (status, data) = match ack {
        Value::Array(items) => (
            items.first().and_then(Value::as_str).unwrap_or_default(),
            items.get(1).cloned().unwrap_or(Value::Null),
        ),
        Value::String(s) => (s.as_str(), Value::Null),
        _ => ("", Value::Null),
    };
    match status {
        "ok" | "success" => Ok(data),
        "timeout" => Err(SessionError::timeout(event, 0)),
        "error" => {
            let message = match &data {
                Value::String(s) => s.clone(),
                Value::Null => "negative acknowledgement".to_string(),
                other => other.to_string(),
            };
            Err(SessionError::server_rejected(event, message))
        }
        other => Err(SessionError::server_rejected(
            event,
            format!("unknown acknowledgement status '{}'", other),
        )),
    }
}

/// `progress` notification for one conference session
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressMessage {
    /// Session the message belongs to
    pub id: String,
    pub status: ProgressStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressStatus {
    Soac(ConferenceSignal),
    Ready,
    Error(String),
}

/// Signaling payload inside `soac`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ConferenceSignal {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: ConferenceCandidate,
    },
    RemovedCandidates {
        candidates: Vec<RemovedCandidate>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConferenceCandidate {
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u32,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    /// Candidate line prefixed with `a=`
    pub candidate: String,
}

impl From<&IceCandidate> for ConferenceCandidate {
    fn from(candidate: &IceCandidate) -> Self {
        Self {
            sdp_mline_index: candidate.sdp_mline_index,
            sdp_mid: candidate.sdp_mid.clone(),
            candidate: format!("a={}", candidate.candidate),
        }
    }
}

impl ConferenceCandidate {
    pub fn to_ice_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: self
                .candidate
                .strip_prefix("a=")
                .unwrap_or(&self.candidate)
                .to_string(),
            sdp_mid: self.sdp_mid.clone(),
            sdp_mline_index: self.sdp_mline_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedCandidate {
    pub candidate: String,
}

/// Build the `soac` payload for a session
pub fn soac_payload(session_id: &str, signal: &ConferenceSignal) -> Result<Value> {
    Ok(json!({ "id": session_id, "signaling": serde_json::to_value(signal)? }))
}

/// Notifications pushed by the conference server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerNotification {
    Progress(ProgressMessage),
    Stream {
        id: String,
        status: String,
        data: Value,
    },
    Text {
        from: String,
        message: String,
        to: String,
    },
    Participant {
        action: String,
        data: Value,
    },
    ConnectionFailed(Value),
    Other {
        name: String,
        data: Value,
    },
}

impl ServerNotification {
    pub fn parse(name: &str, data: &Value) -> Result<Self> {
        let text = |key: &str| data.get(key).and_then(Value::as_str).map(str::to_string);
        let notification = match name {
            events::PROGRESS => {
                // Subscriptions report `peerId`, publications `id`.
                let id = text("peerId")
                    .or_else(|| text("id"))
                    .ok_or_else(|| SessionError::invalid_argument("progress without id"))?;
                let status = match text("status").as_deref() {
                    Some("soac") => {
                        let signal = data
                            .get("data")
                            .cloned()
                            .ok_or_else(|| SessionError::invalid_argument("soac without data"))?;
                        ProgressStatus::Soac(serde_json::from_value(signal)?)
                    }
                    Some("ready") => ProgressStatus::Ready,
                    Some("error") => ProgressStatus::Error(
                        data.get("data")
                            .map(|d| match d {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .unwrap_or_else(|| "server error".to_string()),
                    ),
                    other => {
                        return Err(SessionError::invalid_argument(format!(
                            "unexpected progress status {:?}",
                            other
                        )))
                    }
                };
                ServerNotification::Progress(ProgressMessage { id, status })
            }
            events::STREAM => ServerNotification::Stream {
                id: text("id").ok_or_else(|| SessionError::invalid_argument("stream without id"))?,
                status: text("status").unwrap_or_default(),
                data: data.get("data").cloned().unwrap_or(Value::Null),
            },
            events::TEXT => ServerNotification::Text {
                from: text("from").unwrap_or_default(),
                message: text("message").unwrap_or_default(),
                to: text("to").unwrap_or_else(|| "me".to_string()),
            },
            events::PARTICIPANT => ServerNotification::Participant {
                action: text("action")
                    .ok_or_else(|| SessionError::invalid_argument("participant without action"))?,
                data: data.get("data").cloned().unwrap_or(Value::Null),
            },
            events::CONNECTION_FAILED => ServerNotification::ConnectionFailed(data.clone()),
            other => ServerNotification::Other {
                name: other.to_string(),
                data: data.clone(),
            },
        };
        Ok(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_p2p_wire_format() {
        let msg = P2PMessage::Signal(SignalPayload::Candidates {
            candidate: "candidate:1 1 udp 1 1.2.3.4 5 typ host".into(),
            sdp_mid: "0".into(),
            sdp_mline_index: 0,
        });
        let value: Value = serde_json::from_str(&msg.to_text().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "chat-signal",
                "data": {
                    "type": "candidates",
                    "candidate": "candidate:1 1 udp 1 1.2.3.4 5 typ host",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0
                }
            })
        );
    }

    #[test]
    fn test_chat_closed_without_data() {
        let msg = P2PMessage::parse(r#"{"type":"chat-closed"}"#).unwrap();
        assert_eq!(msg, P2PMessage::Closed(None));

        let msg = P2PMessage::parse(r#"{"type":"chat-closed","data":{"code":2601}}"#).unwrap();
        assert_eq!(
            msg,
            P2PMessage::Closed(Some(CloseInfo {
                code: Some(2601),
                message: None
            }))
        );
    }

    #[test]
    fn test_user_agent_capabilities() {
        let text = r#"{"type":"chat-ua","data":{"sdk":{"type":"JavaScript","version":"5.0"},
            "capabilities":{"streamRemovable":true,"ignoreDataChannelAcks":true}}}"#;
        match P2PMessage::parse(text).unwrap() {
            P2PMessage::UserAgent(ua) => {
                let caps = ua.capabilities.unwrap();
                assert!(caps.stream_removable);
                assert!(caps.ignore_data_channel_acks);
                assert!(!caps.continual_ice_gathering);
                assert_eq!(ua.sdk.sdk_type, "JavaScript");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_track_sources_kebab_case() {
        let msg = P2PMessage::TrackSources(vec![TrackSourceEntry {
            id: "t1".into(),
            source: TrackSource::ScreenCast,
        }]);
        assert_eq!(
            msg.to_text().unwrap(),
            r#"{"type":"chat-track-sources","data":[{"id":"t1","source":"screen-cast"}]}"#
        );
    }

    #[test]
    fn test_parse_ack_statuses() {
        assert_eq!(parse_ack("publish", &json!(["ok", {"id": "s1"}])).unwrap(), json!({"id": "s1"}));
        assert_eq!(parse_ack("text", &json!(["success"])).unwrap(), Value::Null);
        assert!(matches!(
            parse_ack("publish", &json!(["error", "denied"])),
            Err(SessionError::ServerRejected { message, .. }) if message == "denied"
        ));
        assert!(matches!(
            parse_ack("publish", &json!(["timeout"])),
            Err(SessionError::Timeout { .. })
        ));
    }

    #[test]
    fn test_conference_candidate_prefix() {
        let ice = IceCandidate {
            candidate: "candidate:7 1 udp 5 10.0.0.1 9 typ host".into(),
            sdp_mid: "1".into(),
            sdp_mline_index: 1,
        };
        let wire = ConferenceCandidate::from(&ice);
        assert!(wire.candidate.starts_with("a=candidate:7"));
        assert_eq!(wire.to_ice_candidate(), ice);
        let payload = soac_payload("s1", &ConferenceSignal::Candidate { candidate: wire }).unwrap();
        assert_eq!(payload["signaling"]["type"], "candidate");
        assert_eq!(payload["signaling"]["candidate"]["sdpMLineIndex"], 1);
    }

    #[test]
    fn test_progress_notifications() {
        let ready = ServerNotification::parse("progress", &json!({"id": "s1", "status": "ready"})).unwrap();
        assert_eq!(
            ready,
            ServerNotification::Progress(ProgressMessage {
                id: "s1".into(),
                status: ProgressStatus::Ready
            })
        );
        let soac = ServerNotification::parse(
            "progress",
            &json!({"peerId": "s2", "status": "soac", "data": {"type": "answer", "sdp": "v=0"}}),
        )
        .unwrap();
        assert_eq!(
            soac,
            ServerNotification::Progress(ProgressMessage {
                id: "s2".into(),
                status: ProgressStatus::Soac(ConferenceSignal::Answer { sdp: "v=0".into() })
            })
        );
        let text = ServerNotification::parse("text", &json!({"from": "p1", "message": "hi"})).unwrap();
        assert_eq!(
            text,
            ServerNotification::Text {
                from: "p1".into(),
                message: "hi".into(),
                to: "me".into()
            }
        );
    }
}
