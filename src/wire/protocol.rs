use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable logical identity of a participant, stable across reconnects.
pub type PlayerId = Uuid;
/// Identity of one connection attempt, issued before authentication.
pub type ClientId = Uuid;
/// One live connection, issued by the transport layer.
pub type SessionId = u64;
/// One land instance.
pub type RoomId = Uuid;

/// Wire encodings a room can negotiate.
///
/// `Text` is the portable structured format every client can produce before
/// negotiation completes; join traffic always uses it regardless of what the
/// room negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// One JSON object per frame with a `type` discriminator.
    Text,
    /// One JSON array per frame with a leading integer opcode.
    Compact,
    /// Bincode (legacy config, fixed-width integers).
    Binary,
}

impl WireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::Text => "text",
            WireFormat::Compact => "compact",
            WireFormat::Binary => "binary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(WireFormat::Text),
            "compact" => Some(WireFormat::Compact),
            "binary" => Some(WireFormat::Binary),
            _ => None,
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dynamically typed field value carried in diffs, snapshots, actions and
/// events. Text formats render `Bytes` as `{"$bytes": "<base64>"}`; binary
/// uses the serde derive directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
}

/// Marker key for byte blobs embedded in JSON frames.
const BYTES_KEY: &str = "$bytes";

impl FieldValue {
    /// Convert to a `serde_json::Value` for the text formats.
    ///
    /// Non-finite floats have no JSON representation; callers treat the error
    /// as a per-field encode failure.
    pub fn to_json(&self) -> Result<serde_json::Value, EncodeError> {
        use serde_json::Value;
        Ok(match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Int(i) => Value::Number((*i).into()),
            FieldValue::Float(f) => Value::Number(
                serde_json::Number::from_f64(*f).ok_or(EncodeError::NonFiniteFloat)?,
            ),
            FieldValue::Str(s) => Value::String(s.clone()),
            FieldValue::Bytes(b) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(b);
                let mut obj = serde_json::Map::new();
                obj.insert(BYTES_KEY.to_string(), Value::String(encoded));
                Value::Object(obj)
            }
            FieldValue::List(items) => Value::Array(
                items
                    .iter()
                    .map(FieldValue::to_json)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            FieldValue::Map(entries) => {
                let mut obj = serde_json::Map::new();
                for (k, v) in entries {
                    obj.insert(k.clone(), v.to_json()?);
                }
                Value::Object(obj)
            }
        })
    }

    /// Rebuild from a `serde_json::Value` decoded off the wire.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, DecodeError> {
        use serde_json::Value;
        Ok(match value {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    FieldValue::Int(i)
                } else if let Some(f) = n.as_f64() {
                    FieldValue::Float(f)
                } else {
                    return Err(DecodeError::Malformed("unrepresentable number".into()));
                }
            }
            Value::String(s) => FieldValue::Str(s.clone()),
            Value::Array(items) => FieldValue::List(
                items
                    .iter()
                    .map(FieldValue::from_json)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Value::Object(obj) => {
                // Single-key {"$bytes": ...} objects are byte blobs, anything
                // else is a nested map.
                if obj.len() == 1 {
                    if let Some(Value::String(b64)) = obj.get(BYTES_KEY) {
                        let bytes = base64::engine::general_purpose::STANDARD
                            .decode(b64)
                            .map_err(|e| DecodeError::Malformed(format!("bad base64: {e}")))?;
                        return Ok(FieldValue::Bytes(bytes));
                    }
                }
                let mut entries = BTreeMap::new();
                for (k, v) in obj {
                    entries.insert(k.clone(), FieldValue::from_json(v)?);
                }
                FieldValue::Map(entries)
            }
        })
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

/// A named client request routed to the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    /// Client-chosen id echoed in responses where applicable.
    pub request_id: u64,
    pub name: String,
    pub args: BTreeMap<String, FieldValue>,
}

/// A named event payload, client- or server-originated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBody {
    pub name: String,
    pub data: BTreeMap<String, FieldValue>,
}

impl EventBody {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Messages from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Request to enter the room and bind a player identity.
    Join(JoinRequest),
    /// State mutation request for the store.
    Action(ActionEnvelope),
    /// Fire-and-forget client notification for the store.
    ClientEvent(EventBody),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub request_id: u64,
    pub player_id: PlayerId,
    /// Opaque auth info carried on the player record.
    pub account_key: Option<String>,
    pub display_name: Option<String>,
}

/// Frames from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Successful join; always encoded in the portable text format.
    JoinResponse(JoinResponse),
    /// Join rejection; always encoded in the portable text format.
    JoinError(JoinError),
    /// Incremental or full state for one scope.
    StateUpdate(StateUpdateFrame),
    /// Broadcast-only combined frame: state plus this tick's broadcast events.
    StateUpdateWithEvents(StateUpdateWithEvents),
    /// One targeted event.
    ServerEvent(EventBody),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub request_id: u64,
    pub player_id: PlayerId,
    /// Stable small integer assigned on first join, reused on reconnect.
    pub player_slot: u16,
    /// The room's negotiated steady-state encoding.
    pub encoding: WireFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinError {
    pub request_id: u64,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdateFrame {
    pub tick: u64,
    /// True for firstSync snapshots; such frames re-declare every key they
    /// reference instead of only newly assigned ones.
    pub full: bool,
    /// Key declarations (path, surrogate id) introduced by this frame.
    pub keys: Vec<(String, u32)>,
    pub values: BTreeMap<u32, FieldValue>,
    pub removed: Vec<u32>,
}

impl StateUpdateFrame {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdateWithEvents {
    pub update: StateUpdateFrame,
    pub events: Vec<EventBody>,
}

/// Encode failure. Per-field failures are skipped by the encoding pipeline;
/// whole-frame failures abort the frame.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("non-finite float has no text representation")]
    NonFiniteFloat,
    #[error("json encode failed: {0}")]
    Json(String),
    #[error("binary encode failed: {0}")]
    Binary(String),
}

/// Decode failure. Always recoverable: the frame is dropped and logged, the
/// connection stays open.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("invalid json: {0}")]
    Json(String),
    #[error("binary decode failed: {0}")]
    Binary(String),
    #[error("unknown message kind `{0}`")]
    UnknownKind(String),
    #[error("unknown opcode {0}")]
    UnknownOpcode(i64),
    #[error("malformed frame: {0}")]
    Malformed(String),
}
