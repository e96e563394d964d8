//! Process configuration.
//!
//! Loaded from a TOML file, every field defaulted, then overridden from the
//! environment. Credentials are only ever read from the environment.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage::TradeStoreConfig;

/// Upper bound the historical endpoint accepts for `limit`.
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: TradeStoreConfig,
    pub feed: FeedConfig,
    pub history: HistoryConfig,
    pub ingest: IngestConfig,
    pub reconcile: ReconcileConfig,
    pub notify: NotifyConfig,
}

impl AppConfig {
    /// Read `path` (or start from defaults), then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                Self::from_toml(&content)
                    .with_context(|| format!("Failed to parse config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.normalize();
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.normalize();
        Ok(config)
    }

    /// Environment overrides (run after `dotenv`).
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("TRADEKEEPER_DB_PATH") {
            if !v.trim().is_empty() {
                self.store.db_path = v;
            }
        }
        if let Ok(v) = std::env::var("BINANCE_API_KEY") {
            self.history.api_key = Some(v).filter(|k| !k.is_empty());
        }
        if let Ok(v) = std::env::var("TELEGRAM_BOT_TOKEN") {
            self.notify.telegram_token = Some(v).filter(|t| !t.is_empty());
        }
        if let Ok(v) = std::env::var("TELEGRAM_CHAT_ID") {
            self.notify.telegram_chat_id = Some(v).filter(|c| !c.is_empty());
        }
        if let Ok(v) = std::env::var("TELEGRAM_API_BASE") {
            if !v.trim().is_empty() {
                self.notify.telegram_api_base = v;
            }
        }
        if let Some(n) = env_number("TRADEKEEPER_GATHER_LEN") {
            self.ingest.gather_len = n;
        }
        if let Some(n) = env_number("TRADEKEEPER_BACKLOG_HIGH_WATERMARK") {
            self.ingest.backlog_high_watermark = n;
        }
        if let Some(secs) = env_number("TRADEKEEPER_RECONCILE_INTERVAL_SECS") {
            self.reconcile.reconcile_interval = Duration::from_secs(secs);
        }
    }

    fn normalize(&mut self) {
        self.reconcile.page_size = self.reconcile.page_size.clamp(1, MAX_PAGE_SIZE);
        self.ingest.gather_len = self.ingest.gather_len.max(1);
        self.feed.streams = self
            .feed
            .streams
            .iter()
            .map(|s| crate::models::standardize(s))
            .filter(|s| !s.is_empty())
            .collect();
    }
}

// =============================================================================
// FEED
// =============================================================================

/// Either the literal `"all"` or an explicit symbol list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SymbolSpec {
    One(String),
    Many(Vec<String>),
}

impl Default for SymbolSpec {
    fn default() -> Self {
        Self::Many(vec!["btcusdt".to_string(), "ethusdt".to_string()])
    }
}

impl SymbolSpec {
    pub fn is_all(&self) -> bool {
        matches!(self, Self::One(s) if crate::models::standardize(s) == "all")
    }

    /// Standardised explicit symbols; empty when configured as `"all"`.
    pub fn symbols(&self) -> Vec<String> {
        match self {
            _ if self.is_all() => Vec::new(),
            Self::One(s) => vec![crate::models::standardize(s)],
            Self::Many(list) => list
                .iter()
                .map(|s| crate::models::standardize(s))
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Combined-stream endpoint (without the `/stream` path).
    pub endpoint: String,
    pub symbols: SymbolSpec,
    /// Stream suffixes, e.g. `trade`, `bookTicker`.
    pub streams: Vec<String>,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
    pub connect_timeout_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://stream.binance.com:9443".to_string(),
            symbols: SymbolSpec::default(),
            streams: vec!["trade".to_string()],
            // Backoff: 100ms base, 2x multiplier, 30s cap, ±30% jitter
            backoff_base_ms: 100,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.3,
            connect_timeout_ms: 10_000,
        }
    }
}

// =============================================================================
// HISTORY
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.binance.com".to_string(),
            request_timeout_secs: 10,
            api_key: None,
        }
    }
}

// =============================================================================
// PIPELINES
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Persistence tasks gathered before the batch is awaited.
    pub gather_len: usize,
    /// Buffer depth that triggers the backlog warning.
    pub backlog_high_watermark: usize,
    /// Sleep when the buffer is empty.
    #[serde(with = "duration_ms")]
    pub idle_wait: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            gather_len: 100,
            backlog_high_watermark: 1000,
            idle_wait: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Records requested per historical page.
    pub page_size: usize,
    /// Sleep between reconciliation cycles.
    #[serde(with = "duration_secs")]
    pub reconcile_interval: Duration,
    /// Pause before the single retry after a rate-limit fault.
    #[serde(with = "duration_secs")]
    pub rate_limit_cooldown: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            reconcile_interval: Duration::from_secs(12 * 3600),
            rate_limit_cooldown: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    #[serde(skip)]
    pub telegram_token: Option<String>,
    #[serde(skip)]
    pub telegram_chat_id: Option<String>,
    pub telegram_api_base: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            telegram_token: None,
            telegram_chat_id: None,
            telegram_api_base: "https://api.telegram.org".into(),
        }
    }
}

/// Numeric env override; unparsable values are reported and ignored.
fn env_number<T: std::str::FromStr>(var: &str) -> Option<T> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(
                var,
                value = %raw,
                "invalid numeric override ignored, keeping configured value"
            );
            None
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
