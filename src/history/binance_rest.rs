//! Binance REST client for historical trades and exchange info.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{FetchError, HistoricalSource, RATE_LIMIT_CODE};
use crate::config::{HistoryConfig, MAX_PAGE_SIZE};
use crate::models::RawTrade;

const API_KEY_HEADER: &str = "x-mbx-apikey";

/// One element of `GET /api/v3/historicalTrades`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoricalTrade {
    id: u64,
    price: String,
    qty: String,
    time: u64,
    is_buyer_maker: bool,
}

impl HistoricalTrade {
    fn into_raw(self, symbol: &str) -> RawTrade {
        RawTrade {
            event_type: None,
            symbol: symbol.to_string(),
            trade_id: self.id,
            price: self.price,
            quantity: self.qty,
            trade_time_ms: self.time,
            is_buyer_maker: self.is_buyer_maker,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    status: String,
}

/// Map a non-success response onto [`FetchError`].
///
/// HTTP 429/418 and error code -1003 are rate limits; everything else is an
/// API fault.
pub fn classify_error(status: u16, body: &str) -> FetchError {
    let parsed: Option<ApiErrorBody> = serde_json::from_str(body).ok();

    let rate_limited_status = status == StatusCode::TOO_MANY_REQUESTS.as_u16() || status == 418;
    match parsed {
        Some(err) if err.code == RATE_LIMIT_CODE || rate_limited_status => {
            FetchError::RateLimited {
                code: err.code,
                message: err.msg,
            }
        }
        None if rate_limited_status => FetchError::RateLimited {
            code: RATE_LIMIT_CODE,
            message: body.to_string(),
        },
        Some(err) => FetchError::Api {
            status: Some(status),
            code: Some(err.code),
            message: err.msg,
        },
        None => FetchError::Api {
            status: Some(status),
            code: None,
            message: body.to_string(),
        },
    }
}

#[derive(Clone)]
pub struct BinanceHistoricalClient {
    client: Client,
    base_url: String,
}

impl BinanceHistoricalClient {
    pub fn new(config: &HistoryConfig) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = &config.api_key {
            headers.insert(
                API_KEY_HEADER,
                key.parse().context("Invalid BINANCE_API_KEY")?,
            );
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_max_idle_per_host(4)
            .default_headers(headers)
            .build()
            .context("Failed to build BinanceHistoricalClient")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Lower-cased symbols whose status is `TRADING`.
    pub async fn trading_symbols(&self) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(self.url("/api/v3/exchangeInfo"))
            .send()
            .await
            .context("GET /api/v3/exchangeInfo failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("GET /api/v3/exchangeInfo {}: {}", status, text));
        }

        let info = resp
            .json::<ExchangeInfo>()
            .await
            .context("Failed to parse exchangeInfo")?;
        Ok(trading_symbols_from(info))
    }
}

fn trading_symbols_from(info: ExchangeInfo) -> Vec<String> {
    info.symbols
        .into_iter()
        .filter(|s| s.status == "TRADING")
        .map(|s| s.symbol.to_lowercase())
        .collect()
}

#[async_trait]
impl HistoricalSource for BinanceHistoricalClient {
    async fn fetch_trades(
        &self,
        instrument: &str,
        limit: usize,
        from_id: u64,
    ) -> Result<Vec<RawTrade>, FetchError> {
        let symbol = instrument.to_uppercase();
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        debug!(symbol = %symbol, limit, from_id, "fetching historical trades");

        let resp = self
            .client
            .get(self.url("/api/v3/historicalTrades"))
            .query(&[
                ("symbol", symbol.clone()),
                ("limit", limit.to_string()),
                ("fromId", from_id.to_string()),
            ])
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_error(status.as_u16(), &body));
        }

        let trades: Vec<HistoricalTrade> = serde_json::from_str(&body)
            .map_err(|e| FetchError::Transport(format!("invalid historicalTrades body: {}", e)))?;
        Ok(trades.into_iter().map(|t| t.into_raw(&symbol)).collect())
    }
}
