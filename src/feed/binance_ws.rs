//! Binance combined-stream websocket client.
//!
//! Subscribes to `{symbol}@{stream}` for every configured pair, pushes raw
//! text frames into the shared [`StreamBuffer`], and reconnects with
//! exponential backoff. Decoding is left to the ingestion pipeline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::buffer::StreamBuffer;
use super::session::{ReconnectBackoff, SessionState};
use crate::config::FeedConfig;
use crate::notify::Notifier;

/// Streams per websocket connection; larger subscriptions are split.
const MAX_STREAMS_PER_CONNECTION: usize = 200;

/// Build `{endpoint}/stream?streams=a@trade/b@trade`.
pub fn stream_url(endpoint: &str, streams: &[String]) -> String {
    format!(
        "{}/stream?streams={}",
        endpoint.trim_end_matches('/'),
        streams.join("/")
    )
}

/// Every `symbol@stream` pair, symbols and streams lower-cased.
pub fn stream_names(symbols: &[String], streams: &[String]) -> Vec<String> {
    symbols
        .iter()
        .flat_map(|symbol| {
            streams
                .iter()
                .map(move |stream| format!("{}@{}", symbol.to_lowercase(), stream))
        })
        .collect()
}

/// Standardised stream names are lower-case; the subscription wants Binance casing.
fn wire_stream_name(stream: &str) -> &str {
    match stream {
        "bookticker" => "bookTicker",
        other => other,
    }
}

pub struct BinanceStreamClient {
    config: FeedConfig,
    symbols: Vec<String>,
    buffer: Arc<StreamBuffer>,
    notifier: Arc<dyn Notifier>,
    state: RwLock<SessionState>,
}

impl BinanceStreamClient {
    pub fn new(
        config: FeedConfig,
        symbols: Vec<String>,
        buffer: Arc<StreamBuffer>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            symbols,
            buffer,
            notifier,
            state: RwLock::new(SessionState::Init),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn transition(&self, next: SessionState) {
        let mut state = self.state.write();
        if *state != next {
            debug!(from = %*state, to = %next, "feed_state_transition");
            *state = next;
        }
    }

    /// Connection URLs, one per chunk of streams.
    pub fn connection_urls(&self) -> Vec<String> {
        let streams: Vec<String> = self
            .config
            .streams
            .iter()
            .map(|s| wire_stream_name(s).to_string())
            .collect();
        stream_names(&self.symbols, &streams)
            .chunks(MAX_STREAMS_PER_CONNECTION)
            .map(|chunk| stream_url(&self.config.endpoint, chunk))
            .collect()
    }

    /// Start one connection task per URL. The buffer is closed once every
    /// connection has stopped.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let urls = self.connection_urls();
        let client = self.clone();

        tokio::spawn(async move {
            let handles: Vec<_> = urls
                .into_iter()
                .map(|url| {
                    let client = client.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move { client.connection_loop(url, shutdown).await })
                })
                .collect();

            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "feed connection task ended abnormally");
                }
            }
            client.transition(SessionState::Shutdown);
            client.buffer.close();
        })
    }

    async fn connection_loop(&self, url: String, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = ReconnectBackoff::new(&self.config);

        while !*shutdown.borrow() {
            self.transition(SessionState::Connecting);
            match self.run_connection(&url, &mut shutdown, &mut backoff).await {
                Ok(()) => break,
                Err(e) => {
                    self.transition(SessionState::Reconnecting);
                    let delay = backoff.next_delay();
                    self.notifier.warning(&format!(
                        "Websocket connection lost ({}), reconnecting in {}ms (attempt {})",
                        e,
                        delay.as_millis(),
                        backoff.failures()
                    ));
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// Returns `Ok` only on requested shutdown.
    async fn run_connection(
        &self,
        url: &str,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut ReconnectBackoff,
    ) -> Result<()> {
        debug!(url = %url, "connecting");

        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let (ws_stream, _response) = tokio::time::timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| anyhow!("connect timeout"))??;

        self.transition(SessionState::Streaming);
        backoff.reset();
        self.notifier
            .info(&format!("Websocket connection opened for {}", url));

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.buffer.push(text),
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => self.buffer.push(text),
                            Err(_) => debug!("non-utf8 binary frame dropped"),
                        },
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "server_close");
                            return Err(anyhow!("server closed connection"));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(anyhow!("stream ended")),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        info!(url = %url, "feed connection closed on shutdown");
                        return Ok(());
                    }
                }
            }
        }
    }
}
