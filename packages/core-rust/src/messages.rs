//! Message envelope, body codecs, and transport headers.
//!
//! Every body on the wire is a [`Message`]: an internally-tagged enum whose
//! `type` field selects the variant (`REQUEST`, `REPLY`, `HEARTBEAT`) and whose
//! remaining fields are the variant's struct inlined. The same shape is used
//! by both codecs, so a deployment can switch between JSON and named `MsgPack`
//! without touching message definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{Heartbeat, Reply, Request};

// ---------------------------------------------------------------------------
// Message envelope
// ---------------------------------------------------------------------------

/// Every message body the channel layer understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "REQUEST")]
    Request(Request),
    #[serde(rename = "REPLY")]
    Reply(Reply),
    #[serde(rename = "HEARTBEAT")]
    Heartbeat(Heartbeat),
}

impl Message {
    /// Short variant name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "REQUEST",
            Self::Reply(_) => "REPLY",
            Self::Heartbeat(_) => "HEARTBEAT",
        }
    }

    /// One-line description, used when a handler receives a body it did not expect.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Request(r) => format!("REQUEST id={} sources={}", r.id, r.source_refs.len()),
            Self::Reply(r) => format!("REPLY requestId={} status={}", r.request_id, r.status),
            Self::Heartbeat(h) => {
                format!("HEARTBEAT {}/{} at {}", h.service_type, h.instance_id, h.timestamp)
            }
        }
    }
}

impl From<Request> for Message {
    fn from(value: Request) -> Self {
        Self::Request(value)
    }
}

impl From<Reply> for Message {
    fn from(value: Reply) -> Self {
        Self::Reply(value)
    }
}

impl From<Heartbeat> for Message {
    fn from(value: Heartbeat) -> Self {
        Self::Heartbeat(value)
    }
}

// ---------------------------------------------------------------------------
// FromMessage
// ---------------------------------------------------------------------------

/// Conversion from the envelope into a handler's declared body type.
///
/// On mismatch the envelope is handed back so the caller can log what
/// actually arrived.
pub trait FromMessage: Sized {
    /// Name of the expected body type, for diagnostics.
    const EXPECTED: &'static str;

    /// Extracts the body, or returns the message unchanged if it is another kind.
    ///
    /// # Errors
    ///
    /// Returns the original message when it does not carry this body type.
    fn from_message(message: Message) -> Result<Self, Message>;
}

impl FromMessage for Message {
    const EXPECTED: &'static str = "any";

    fn from_message(message: Message) -> Result<Self, Message> {
        Ok(message)
    }
}

impl FromMessage for Request {
    const EXPECTED: &'static str = "REQUEST";

    fn from_message(message: Message) -> Result<Self, Message> {
        match message {
            Message::Request(r) => Ok(r),
            other => Err(other),
        }
    }
}

impl FromMessage for Reply {
    const EXPECTED: &'static str = "REPLY";

    fn from_message(message: Message) -> Result<Self, Message> {
        match message {
            Message::Reply(r) => Ok(r),
            other => Err(other),
        }
    }
}

impl FromMessage for Heartbeat {
    const EXPECTED: &'static str = "HEARTBEAT";

    fn from_message(message: Message) -> Result<Self, Message> {
        match message {
            Message::Heartbeat(h) => Ok(h),
            other => Err(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Well-known header names.
pub mod header {
    /// Reply address for a request (`queue:<name>` / `topic:<name>`).
    pub const REPLY_TO: &str = "reply-to";
    /// Body codec name (`application/json`, `application/msgpack`).
    pub const CONTENT_TYPE: &str = "content-type";
    /// Request identifier, duplicated from the body for broker-side routing/tracing.
    pub const CORRELATION_ID: &str = "correlation-id";
}

/// String key/value transport headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    /// Creates an empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Self::insert`].
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Sets `key`, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Value of `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns `true` if no headers are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Consumes the map, returning the underlying entries.
    #[must_use]
    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl From<BTreeMap<String, String>> for Headers {
    fn from(value: BTreeMap<String, String>) -> Self {
        Self(value)
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Errors raised while encoding or decoding a message body.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("empty message body")]
    Empty,
    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),
    #[error("msgpack encode: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("unknown codec: {0}")]
    Unknown(String),
}

/// Body encoding, selected once per deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Codec {
    #[default]
    Json,
    /// Named `MsgPack` (`rmp_serde::to_vec_named`), field names preserved.
    MsgPack,
}

impl Codec {
    /// Value written into the `content-type` header.
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::MsgPack => "application/msgpack",
        }
    }

    /// Resolves a `content-type` header value back to a codec.
    #[must_use]
    pub fn from_content_type(value: &str) -> Option<Self> {
        match value {
            "application/json" => Some(Self::Json),
            "application/msgpack" | "application/x-msgpack" => Some(Self::MsgPack),
            _ => None,
        }
    }

    /// Encodes a message body.
    ///
    /// # Errors
    ///
    /// Returns a `CodecError` if serialization fails.
    pub fn encode(self, message: &Message) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Json => Ok(serde_json::to_vec(message)?),
            Self::MsgPack => Ok(rmp_serde::to_vec_named(message)?),
        }
    }

    /// Decodes a message body.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Empty` for an empty body, or the underlying
    /// deserialization error.
    pub fn decode(self, body: &[u8]) -> Result<Message, CodecError> {
        if body.is_empty() {
            return Err(CodecError::Empty);
        }
        match self {
            Self::Json => Ok(serde_json::from_slice(body)?),
            Self::MsgPack => Ok(rmp_serde::from_slice(body)?),
        }
    }
}

impl FromStr for Codec {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "msgpack" => Ok(Self::MsgPack),
            other => Self::from_content_type(other).ok_or_else(|| CodecError::Unknown(s.to_string())),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::MsgPack => f.write_str("msgpack"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
