//! Historical trade source used for backfill.
//!
//! The reconciliation engine only depends on [`HistoricalSource`]; the REST
//! client lives in `binance_rest`.

pub mod binance_rest;

pub use binance_rest::BinanceHistoricalClient;

use async_trait::async_trait;

use crate::models::RawTrade;

/// Error code the exchange attaches to request-weight rate limiting.
pub const RATE_LIMIT_CODE: i64 = -1003;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The source asked us to slow down. Retryable after a cooldown.
    RateLimited { code: i64, message: String },
    /// The source answered with an application-level error.
    Api {
        status: Option<u16>,
        code: Option<i64>,
        message: String,
    },
    /// Network, timeout, or body decode failure.
    Transport(String),
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited { code, message } => {
                write!(f, "rate limited (code {}): {}", code, message)
            }
            Self::Api {
                status,
                code,
                message,
            } => write!(
                f,
                "api error (status {:?}, code {:?}): {}",
                status, code, message
            ),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

/// Paginated access to past trades of one instrument.
#[async_trait]
pub trait HistoricalSource: Send + Sync {
    /// Up to `limit` trades with id `>= from_id`, ascending by id.
    async fn fetch_trades(
        &self,
        instrument: &str,
        limit: usize,
        from_id: u64,
    ) -> Result<Vec<RawTrade>, FetchError>;
}
