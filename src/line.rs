//! Line data model shared by the transports and the reprocessor.
//!
//! A [`RawLine`] is what a transport yields: an exchange, a closed
//! [`LineType`] tag, a timestamp and an opaque payload. A [`TypedLine`] is what
//! the reprocessor emits: the same envelope, with message payloads decoded into
//! a field map coerced by the channel's [`Definition`].
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineType {
    /// Channel message. The first one per channel after a reset carries the definition.
    #[serde(rename = "msg")]
    Message,
    /// Request sent by the recorder to the exchange.
    Send,
    /// Start of a shard; invalidates every definition of the exchange.
    Start,
    /// End of a shard.
    End,
    /// Error reported by the exchange or the recorder.
    #[serde(rename = "err")]
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLine {
    pub exchange: String,
    #[serde(rename = "type")]
    pub line_type: LineType,
    pub timestamp: i64, // nanoseconds since UNIX epoch
    pub channel: Option<String>, // always set on message lines
    pub message: Vec<u8>,        // opaque payload, JSON for message lines
}

/// Type tag of a field inside a channel definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    /// Decimal string of nanoseconds since epoch.
    Timestamp,
    /// Decimal string of nanoseconds.
    Duration,
    /// Number that must be exposed as a 64-bit integer.
    Int,
    /// Any other tag; values pass through untouched.
    Other(String),
}

impl From<String> for FieldType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "timestamp" => FieldType::Timestamp,
            "duration" => FieldType::Duration,
            "int" => FieldType::Int,
            _ => FieldType::Other(tag),
        }
    }
}

impl From<FieldType> for String {
    fn from(t: FieldType) -> Self {
        match t {
            FieldType::Timestamp => "timestamp".into(),
            FieldType::Duration => "duration".into(),
            FieldType::Int => "int".into(),
            FieldType::Other(tag) => tag,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Timestamp => f.write_str("timestamp"),
            FieldType::Duration => f.write_str("duration"),
            FieldType::Int => f.write_str("int"),
            FieldType::Other(tag) => f.write_str(tag),
        }
    }
}

/// Field name -> type tag for one (exchange, channel).
pub type Definition = BTreeMap<String, FieldType>;

/// Payload of a [`TypedLine`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Non-message lines keep their payload verbatim.
    Raw(Vec<u8>),
    /// Decoded and coerced message fields.
    Fields(Map<String, Value>),
}

impl Message {
    pub fn fields(&self) -> Option<&Map<String, Value>> {
        match self {
            Message::Fields(m) => Some(m),
            Message::Raw(_) => None,
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Message::Raw(bytes) => serializer.serialize_str(&String::from_utf8_lossy(bytes)),
            Message::Fields(m) => m.serialize(serializer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypedLine {
    pub exchange: String,
    #[serde(rename = "type")]
    pub line_type: LineType,
    pub timestamp: i64,
    pub channel: Option<String>,
    pub message: Message,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<Arc<Definition>>, // set on message lines only
}
