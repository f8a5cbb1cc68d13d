//! Pluggable payload encodings.
//!
//! A channel's Data and Log streams each carry one negotiated encoding,
//! selected by name in the command descriptor. Structural messages (Open,
//! Command, Reply, Fin, Close, Announce) are always JSON and never go through
//! these strategies.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtoError, Result};

/// A payload traveling over a channel's Data or Log stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Raw bytes.
    Bytes(Bytes),
    /// Structured JSON value.
    Json(Value),
    /// UTF-8 text.
    Text(String),
}

impl Payload {
    /// The payload as raw bytes, however it is represented.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Payload::Bytes(b) => b.clone(),
            Payload::Json(v) => Bytes::from(v.to_string()),
            Payload::Text(s) => Bytes::copy_from_slice(s.as_bytes()),
        }
    }

    /// The payload rendered as text (lossy for binary).
    pub fn to_text(&self) -> String {
        match self {
            Payload::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Payload::Json(v) => v.to_string(),
            Payload::Text(s) => s.clone(),
        }
    }

    /// The JSON value, if this payload is structured.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Payload::Bytes(b)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(b))
    }
}

impl From<&[u8]> for Payload {
    fn from(b: &[u8]) -> Self {
        Payload::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Payload::Json(v)
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

/// Named encode/decode strategy for channel payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Raw bytes, untouched. The default Data encoding.
    #[default]
    Binary,
    /// Compact JSON. The default Log encoding.
    Json,
    /// UTF-8 text; invalid UTF-8 is a decode error.
    Utf8,
}

impl Encoding {
    /// Encode a payload for the wire.
    ///
    /// A payload kind the strategy cannot represent is an error surfaced to
    /// the sender; it never becomes a protocol fault.
    pub fn encode(&self, payload: &Payload) -> Result<Bytes> {
        match (self, payload) {
            (Encoding::Binary, Payload::Bytes(b)) => Ok(b.clone()),
            (Encoding::Binary, Payload::Text(s)) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            (Encoding::Binary, Payload::Json(_)) => Err(ProtoError::Encoding(
                "json payload on a binary-encoded stream".to_string(),
            )),
            (Encoding::Json, Payload::Json(v)) => Ok(Bytes::from(serde_json::to_vec(v)?)),
            (Encoding::Json, Payload::Text(s)) => {
                Ok(Bytes::from(serde_json::to_vec(&Value::String(s.clone()))?))
            }
            (Encoding::Json, Payload::Bytes(_)) => Err(ProtoError::Encoding(
                "raw bytes on a json-encoded stream".to_string(),
            )),
            (Encoding::Utf8, Payload::Text(s)) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            (Encoding::Utf8, Payload::Json(_) | Payload::Bytes(_)) => Err(ProtoError::Encoding(
                "non-text payload on a utf8-encoded stream".to_string(),
            )),
        }
    }

    /// Decode wire bytes into the payload shape this strategy produces.
    pub fn decode(&self, raw: Bytes) -> Result<Payload> {
        match self {
            Encoding::Binary => Ok(Payload::Bytes(raw)),
            Encoding::Json => Ok(Payload::Json(serde_json::from_slice(&raw)?)),
            Encoding::Utf8 => String::from_utf8(raw.to_vec())
                .map(Payload::Text)
                .map_err(|err| ProtoError::Encoding(format!("invalid utf-8: {err}"))),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Encoding::Binary => "binary",
            Encoding::Json => "json",
            Encoding::Utf8 => "utf8",
        };
        f.write_str(name)
    }
}

impl FromStr for Encoding {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "binary" => Ok(Encoding::Binary),
            "json" => Ok(Encoding::Json),
            "utf8" => Ok(Encoding::Utf8),
            other => Err(ProtoError::Encoding(format!("unknown encoding '{other}'"))),
        }
    }
}
