// ── Stream message schema ──
//
// Inbound: `{"type": "snapshot"|"update"|"error"|"heartbeat",
//            "data"?: object, "seq"?: number, "error"?: string}`
// Outbound: opaque text or binary payloads, queued in FIFO order.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::Error;

/// Wire text of an outbound heartbeat.
pub const HEARTBEAT_FRAME: &str = r#"{"type":"heartbeat"}"#;

/// One discrete inbound message from the stream.
///
/// `seq` is assigned by the sender and only ever compared, never
/// re-derived from arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEnvelope {
    /// Full-state replacement establishing a new baseline.
    Snapshot { data: Value, seq: u64 },
    /// Field-level changes layered onto the last snapshot/update.
    Update { data: Map<String, Value>, seq: u64 },
    /// Error reported by the sender.
    Error { message: String },
    Heartbeat,
}

/// Raw shape before validation. All fields optional so a bad frame
/// produces a descriptive protocol error instead of a serde one.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    seq: Option<u64>,
    #[serde(default, alias = "message")]
    error: Option<String>,
}

impl InboundEnvelope {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let raw: RawEnvelope = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("malformed envelope: {e}")))?;

        match raw.kind.as_str() {
            "snapshot" => {
                let seq = raw.seq.ok_or_else(|| missing("snapshot", "seq"))?;
                let data = raw.data.ok_or_else(|| missing("snapshot", "data"))?;
                Ok(Self::Snapshot { data, seq })
            }
            "update" => {
                let seq = raw.seq.ok_or_else(|| missing("update", "seq"))?;
                match raw.data {
                    Some(Value::Object(data)) => Ok(Self::Update { data, seq }),
                    Some(_) => Err(Error::Protocol("update data must be an object".into())),
                    None => Err(missing("update", "data")),
                }
            }
            "error" => Ok(Self::Error {
                message: raw.error.unwrap_or_else(|| "unspecified stream error".into()),
            }),
            "heartbeat" => Ok(Self::Heartbeat),
            other => Err(Error::Protocol(format!("unknown envelope type '{other}'"))),
        }
    }

    /// Parse a binary frame (UTF-8 JSON).
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::Protocol(format!("binary frame is not UTF-8: {e}")))?;
        Self::parse(text)
    }

    /// Sequence number, for the sequenced variants.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::Snapshot { seq, .. } | Self::Update { seq, .. } => Some(*seq),
            Self::Error { .. } | Self::Heartbeat => None,
        }
    }
}

fn missing(kind: &str, field: &str) -> Error {
    Error::Protocol(format!("{kind} envelope missing '{field}'"))
}

// ── Outbound ─────────────────────────────────────────────────────────

/// Outbound frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Binary(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(bytes))
    }
}

impl From<&Value> for Payload {
    fn from(value: &Value) -> Self {
        Self::Text(value.to_string())
    }
}

/// A message waiting in a connection's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Payload,
    pub enqueued_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            enqueued_at: Utc::now(),
        }
    }
}
