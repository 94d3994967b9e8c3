use super::model::ApplyResult;
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: &str = "1.0.0";

// sealed snapshots of large profiles run to a few MB
const MAX_MSG_LEN: usize = 64 * 1024 * 1024;

const KNOWN_TYPES: &[&str] = &[
    "handshake", "handshake-ack", "sync-request", "snapshot", "sync-response",
    "sync-complete", "heartbeat", "heartbeat-ack", "error",
];

/// JSON frames exchanged over the data channel, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    Handshake {
        timestamp: i64,
        #[serde(default)]
        version: String,
    },
    HandshakeAck {
        #[serde(default)]
        timestamp: i64,
    },
    SyncRequest {
        #[serde(default)]
        timestamp: i64,
    },
    /// `data` is a sealed [`Snapshot`](super::model::Snapshot)
    Snapshot {
        data: String,
        #[serde(default)]
        timestamp: i64,
    },
    SyncResponse {
        data: String,
        #[serde(default)]
        timestamp: i64,
    },
    SyncComplete {
        #[serde(default)]
        results: Option<ApplyResult>,
        #[serde(default)]
        timestamp: i64,
    },
    Heartbeat {
        #[serde(default)]
        timestamp: i64,
    },
    HeartbeatAck {
        #[serde(default)]
        timestamp: i64,
    },
    Error {
        message: String,
        #[serde(default)]
        timestamp: i64,
    },
    /// Anything with a `type` we don't know. Never sent.
    #[serde(skip)]
    Unknown { kind: String },
}

impl WireMessage {
    pub fn kind(&self) -> &str {
        match self {
            WireMessage::Handshake { .. } => "handshake",
            WireMessage::HandshakeAck { .. } => "handshake-ack",
            WireMessage::SyncRequest { .. } => "sync-request",
            WireMessage::Snapshot { .. } => "snapshot",
            WireMessage::SyncResponse { .. } => "sync-response",
            WireMessage::SyncComplete { .. } => "sync-complete",
            WireMessage::Heartbeat { .. } => "heartbeat",
            WireMessage::HeartbeatAck { .. } => "heartbeat-ack",
            WireMessage::Error { .. } => "error",
            WireMessage::Unknown { kind } => kind,
        }
    }

    pub fn handshake(now: i64) -> Self {
        WireMessage::Handshake {
            timestamp: now,
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

pub fn encode(msg: &WireMessage) -> Result<String> {
    if let WireMessage::Unknown { kind } = msg {
        return Err(SyncError::Protocol(format!("refusing to send unknown message type {}", kind)));
    }
    serde_json::to_string(msg).map_err(|e| SyncError::Protocol(format!("encode: {}", e)))
}

/// Parse one frame. Unknown `type` values come back as
/// [`WireMessage::Unknown`] rather than an error.
pub fn decode(text: &str) -> Result<WireMessage> {
    if text.len() > MAX_MSG_LEN {
        return Err(SyncError::Protocol("message too large".into()));
    }
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| SyncError::Protocol(format!("decode: {}", e)))?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| SyncError::Protocol("message has no type".into()))?;
    if !KNOWN_TYPES.contains(&kind) {
        return Ok(WireMessage::Unknown { kind: kind.to_string() });
    }
    serde_json::from_value(value).map_err(|e| SyncError::Protocol(format!("decode: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn tags_are_kebab_case() {
        let text = encode(&WireMessage::HeartbeatAck { timestamp: 7 }).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "heartbeat-ack");
        assert_eq!(v["timestamp"], 7);

        let text = encode(&WireMessage::handshake(1)).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "handshake");
        assert_eq!(v["version"], PROTOCOL_VERSION);
    }

    #[test]
    fn every_known_type_decodes() {
        for kind in KNOWN_TYPES {
            let text = match *kind {
                "snapshot" | "sync-response" => format!(r#"{{"type":"{}","data":"abc","timestamp":1}}"#, kind),
                "error" => format!(r#"{{"type":"{}","message":"boom"}}"#, kind),
                _ => format!(r#"{{"type":"{}","timestamp":1}}"#, kind),
            };
            let msg = decode(&text).unwrap();
            assert_eq!(msg.kind(), *kind);
        }
    }

    #[test]
    fn sync_complete_carries_results() {
        let results = ApplyResult { bookmarks_added: 1, ..Default::default() };
        let msg = WireMessage::SyncComplete { results: Some(results.clone()), timestamp: 3 };
        let text = encode(&msg).unwrap();
        assert!(text.contains("\"bookmarksAdded\":1"));
        assert_eq!(decode(&text).unwrap(), msg);

        let bare = decode(r#"{"type":"sync-complete"}"#).unwrap();
        assert_eq!(bare, WireMessage::SyncComplete { results: None, timestamp: 0 });
    }

    #[test]
    fn unknown_types_are_tolerated() {
        let msg = decode(r#"{"type":"file-transfer","blob":1}"#).unwrap();
        assert_eq!(msg, WireMessage::Unknown { kind: "file-transfer".into() });
        assert!(encode(&msg).is_err());
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"no":"type"}"#).is_err());
        assert!(decode(r#"{"type":"snapshot"}"#).is_err());
    }
}
