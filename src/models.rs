use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stream suffix that carries individual trades.
pub const TRADE_STREAM: &str = "trade";

/// Errors raised while mapping upstream payloads onto canonical records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Instrument or stream name contains characters that cannot address a collection.
    InvalidName(String),
    /// Millisecond epoch outside the representable timestamp range.
    InvalidEventTime(u64),
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidName(name) => write!(f, "invalid collection name component: {:?}", name),
            Self::InvalidEventTime(ms) => write!(f, "event time out of range: {}ms", ms),
        }
    }
}

impl std::error::Error for ModelError {}

/// Kind of a combined-stream message, derived from the `stream` field
/// (`btcusdt@trade` -> `Trade`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKind {
    Trade,
    BookTicker,
    Other(String),
}

impl StreamKind {
    pub fn from_stream_name(stream: &str) -> Self {
        let suffix = stream.rsplit('@').next().unwrap_or(stream).to_lowercase();
        match suffix.as_str() {
            TRADE_STREAM => Self::Trade,
            "bookticker" => Self::BookTicker,
            _ => Self::Other(suffix),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Trade => TRADE_STREAM,
            Self::BookTicker => "bookticker",
            Self::Other(name) => name,
        }
    }
}

/// Trade payload as it arrives on the wire, using the upstream short keys.
///
/// Both the live stream and the historical source are normalised into this
/// shape before being turned into a [`TradeRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTrade {
    /// Event type; `"trade"` on the live stream, `"error"` for error events.
    #[serde(rename = "e", default)]
    pub event_type: Option<String>,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "t")]
    pub trade_id: u64,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q")]
    pub quantity: String,
    #[serde(rename = "T")]
    pub trade_time_ms: u64,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

/// Canonical persisted trade.
///
/// `event_time_ms` is authoritative for ordering; `parsed_time` is the same
/// instant as a UTC timestamp and is kept for readability only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub instrument: String,
    pub trade_id: u64,
    pub price: String,
    pub quantity: String,
    pub event_time_ms: u64,
    pub parsed_time: DateTime<Utc>,
    pub is_buyer_maker: bool,
    pub checked: bool,
}

impl TradeRecord {
    pub fn from_raw(raw: RawTrade, checked: bool) -> Result<Self, ModelError> {
        let parsed_time = parse_event_time(raw.trade_time_ms)?;
        Ok(Self {
            instrument: raw.symbol.trim().to_uppercase(),
            trade_id: raw.trade_id,
            price: raw.price,
            quantity: raw.quantity,
            event_time_ms: raw.trade_time_ms,
            parsed_time,
            is_buyer_maker: raw.is_buyer_maker,
            checked,
        })
    }
}

pub fn parse_event_time(ms: u64) -> Result<DateTime<Utc>, ModelError> {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .ok_or(ModelError::InvalidEventTime(ms))
}

/// Logical partition keyed by `(instrument, stream-kind)`, rendered as
/// `BTCUSDT_trade`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionName(String);

impl CollectionName {
    pub fn new(instrument: &str, stream: &str) -> Result<Self, ModelError> {
        let instrument = standardize(instrument).to_uppercase();
        let stream = standardize(stream);
        validate_component(&instrument)?;
        validate_component(&stream)?;
        Ok(Self(format!("{}_{}", instrument, stream)))
    }

    pub fn trades(instrument: &str) -> Result<Self, ModelError> {
        Self::new(instrument, TRADE_STREAM)
    }

    /// Re-hydrate a name read back from storage.
    pub fn parse(name: &str) -> Result<Self, ModelError> {
        let (instrument, stream) = name
            .rsplit_once('_')
            .ok_or_else(|| ModelError::InvalidName(name.to_string()))?;
        validate_component(instrument)?;
        validate_component(stream)?;
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn instrument(&self) -> &str {
        self.0.rsplit_once('_').map(|(i, _)| i).unwrap_or(&self.0)
    }

    pub fn stream(&self) -> &str {
        self.0.rsplit_once('_').map(|(_, s)| s).unwrap_or("")
    }

    pub fn is_trade_stream(&self) -> bool {
        self.stream() == TRADE_STREAM
    }
}

impl std::fmt::Display for CollectionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lower-case and strip surrounding whitespace/newlines from configured names.
pub fn standardize(value: &str) -> String {
    value.trim().to_lowercase()
}

fn validate_component(value: &str) -> Result<(), ModelError> {
    let valid = !value.is_empty() && value.bytes().all(|b| b.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(ModelError::InvalidName(value.to_string()))
    }
}
