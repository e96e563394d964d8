//! Combined-stream envelope decoding.

use serde_json::Value;

use crate::models::StreamKind;

/// Decode failures. Always recoverable: the message is dropped.
#[derive(Debug)]
pub enum DecodeError {
    Json(serde_json::Error),
    MissingKey(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(e) => write!(f, "malformed json: {}", e),
            Self::MissingKey(key) => write!(f, "missing key {:?}", key),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            Self::MissingKey(_) => None,
        }
    }
}

/// `{ "stream": "btcusdt@trade", "data": { ... } }`
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub stream: String,
    pub data: Value,
}

impl Envelope {
    pub fn kind(&self) -> StreamKind {
        StreamKind::from_stream_name(&self.stream)
    }

    /// Event type (`e`) of the payload, if any.
    pub fn event_type(&self) -> Option<&str> {
        self.data.get("e").and_then(Value::as_str)
    }

    pub fn is_error_event(&self) -> bool {
        self.event_type() == Some("error")
    }
}

pub fn decode_envelope(text: &str) -> Result<Envelope, DecodeError> {
    let mut value: Value = serde_json::from_str(text).map_err(DecodeError::Json)?;

    let stream = value
        .get("stream")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingKey("stream"))?
        .to_string();
    let data = value
        .get_mut("data")
        .map(Value::take)
        .ok_or(DecodeError::MissingKey("data"))?;

    Ok(Envelope { stream, data })
}
