//! Operator notifications.
//!
//! Every notification is logged through `tracing`; channel-backed notifiers
//! additionally forward the text (Telegram). Delivery runs on a single worker
//! behind a bounded queue; failures and overflow are logged and never reach
//! the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::NotifyConfig;

const TELEGRAM_TIMEOUT_SECS: u64 = 3;

/// Messages waiting for the Telegram worker; newer ones are dropped when full.
pub const TELEGRAM_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Exception,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Exception => write!(f, "exception"),
        }
    }
}

/// Notification capability injected into both pipelines.
pub trait Notifier: Send + Sync {
    /// Log `message` and, when `to_channel` is set, forward it to the
    /// operator channel. Must not block on delivery.
    fn notify(&self, severity: Severity, message: &str, to_channel: bool);

    /// Whether `to_channel` messages leave the process.
    fn forwards_to_channel(&self) -> bool {
        false
    }

    fn info(&self, message: &str) {
        self.notify(Severity::Info, message, true);
    }

    fn warning(&self, message: &str) {
        self.notify(Severity::Warning, message, true);
    }

    fn error(&self, message: &str) {
        self.notify(Severity::Error, message, true);
    }

    fn exception(&self, message: &str) {
        self.notify(Severity::Exception, message, true);
    }
}

fn log_event(severity: Severity, message: &str) {
    match severity {
        Severity::Debug => debug!("{}", message),
        Severity::Info => info!("{}", message),
        Severity::Warning => warn!("{}", message),
        Severity::Error => error!("{}", message),
        Severity::Exception => error!(kind = "exception", "{}", message),
    }
}

/// Log-only notifier.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, severity: Severity, message: &str, _to_channel: bool) {
        log_event(severity, message);
    }
}

/// Forwards notifications to a Telegram chat.
pub struct TelegramNotifier {
    queue: mpsc::Sender<String>,
    dropped: AtomicU64,
}

impl TelegramNotifier {
    /// Spawns the delivery worker; must be called inside a tokio runtime.
    pub fn new(api_base: &str, token: &str, chat_id: String) -> anyhow::Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .context("telegram notifier needs a tokio runtime")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(TELEGRAM_TIMEOUT_SECS))
            .build()?;
        let url = format!("{}/bot{}/sendMessage", api_base.trim_end_matches('/'), token);

        let (queue, rx) = mpsc::channel(TELEGRAM_QUEUE_CAPACITY);
        handle.spawn(deliver(client, url, chat_id, rx));

        Ok(Self {
            queue,
            dropped: AtomicU64::new(0),
        })
    }

    /// Messages discarded because the queue was full or the worker had stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Messages accepted but not yet picked up by the worker.
    pub fn queued(&self) -> usize {
        self.queue.max_capacity() - self.queue.capacity()
    }
}

async fn deliver(
    client: reqwest::Client,
    url: String,
    chat_id: String,
    mut rx: mpsc::Receiver<String>,
) {
    while let Some(text) = rx.recv().await {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        match client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                info!(status = %resp.status(), "telegram rejected message {:?}", text);
            }
            Err(e) if e.is_timeout() => {
                info!("TimedOut error {} to Telegram while sending message {:?}", e, text);
            }
            Err(e) => {
                info!(error = %e, "telegram delivery failed for message {:?}", text);
            }
        }
    }
    debug!("telegram delivery worker stopped");
}

impl Notifier for TelegramNotifier {
    fn notify(&self, severity: Severity, message: &str, to_channel: bool) {
        log_event(severity, message);
        if !to_channel {
            return;
        }

        if let Err(e) = self.queue.try_send(message.to_string()) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "worker stopped",
            };
            info!(reason, "telegram message dropped {:?}", message);
        }
    }

    fn forwards_to_channel(&self) -> bool {
        true
    }
}

/// Keeps every notification in memory; used by tests and embedders that
/// want to inspect what operators would have seen.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    messages: Mutex<Vec<(Severity, String)>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(Severity, String)> {
        self.messages.lock().clone()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|(s, _)| *s == severity)
            .count()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, severity: Severity, message: &str, _to_channel: bool) {
        log_event(severity, message);
        self.messages.lock().push((severity, message.to_string()));
    }
}

/// Pick the notifier for the given credentials: Telegram when both token and
/// chat id are present, log-only otherwise.
pub fn build_notifier(config: &NotifyConfig) -> Arc<dyn Notifier> {
    match (&config.telegram_token, &config.telegram_chat_id) {
        (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
            match TelegramNotifier::new(&config.telegram_api_base, token, chat_id.clone()) {
                Ok(notifier) => Arc::new(notifier),
                Err(e) => {
                    warn!(error = %e, "telegram notifier unavailable, logging only");
                    Arc::new(TracingNotifier)
                }
            }
        }
        _ => Arc::new(TracingNotifier),
    }
}
