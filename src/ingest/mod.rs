//! Ingestion Pipeline
//!
//! Pulls raw envelopes from the feed buffer and persists trades:
//! - Decode failures are dropped and the loop continues
//! - Trades are upserted on blocking tasks, at most `gather_len` in flight
//! - Backlog depth is sampled after every message (edge-triggered warning)
//! - Anything escaping the loop is fatal: `Faulted`, reported, returned

pub mod backlog;
pub mod envelope;

pub use backlog::{BacklogMonitor, BacklogTransition};
pub use envelope::{decode_envelope, DecodeError, Envelope};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::config::IngestConfig;
use crate::feed::FeedBuffer;
use crate::models::{RawTrade, StreamKind, TradeRecord, TRADE_STREAM};
use crate::notify::{Notifier, Severity};
use crate::storage::TradeStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    /// No message seen yet.
    Connecting,
    Streaming,
    BackpressureWarning,
    /// Terminal. Restarting is the supervisor's job.
    Faulted,
}

impl std::fmt::Display for IngestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Streaming => write!(f, "STREAMING"),
            Self::BackpressureWarning => write!(f, "BACKPRESSURE_WARNING"),
            Self::Faulted => write!(f, "FAULTED"),
        }
    }
}

/// Result of one [`IngestPipeline::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Processed,
    /// Buffer was empty; the pipeline idled for `idle_wait`.
    Idle,
    /// Buffer is empty and its producer has stopped.
    Closed,
}

#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    trades: AtomicU64,
    book_messages: AtomicU64,
    decode_errors: AtomicU64,
    error_events: AtomicU64,
    persisted: AtomicU64,
    persist_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSnapshot {
    pub received: u64,
    pub trades: u64,
    pub book_messages: u64,
    pub decode_errors: u64,
    pub error_events: u64,
    pub persisted: u64,
    pub persist_failures: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            received: self.received.load(Ordering::Relaxed),
            trades: self.trades.load(Ordering::Relaxed),
            book_messages: self.book_messages.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            error_events: self.error_events.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
        }
    }
}

pub struct IngestPipeline {
    store: Arc<dyn TradeStore>,
    notifier: Arc<dyn Notifier>,
    config: IngestConfig,
    state: IngestState,
    backlog: BacklogMonitor,
    in_flight: Vec<JoinHandle<()>>,
    stats: Arc<IngestStats>,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn TradeStore>,
        notifier: Arc<dyn Notifier>,
        config: IngestConfig,
    ) -> Self {
        let backlog = BacklogMonitor::new(config.backlog_high_watermark);
        let gather_len = config.gather_len.max(1);
        Self {
            store,
            notifier,
            config: IngestConfig {
                gather_len,
                ..config
            },
            state: IngestState::Connecting,
            backlog,
            in_flight: Vec::with_capacity(gather_len),
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn state(&self) -> IngestState {
        self.state
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Persistence tasks spawned but not yet awaited.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Consume messages until shutdown is signalled or the buffer closes,
    /// then drain in-flight writes.
    pub async fn run(
        &mut self,
        buffer: &dyn FeedBuffer,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        if self.state == IngestState::Faulted {
            bail!("ingestion pipeline is faulted");
        }

        self.notifier
            .info(&format!("Receiver writing trades to {}", self.store.describe()));

        let result = match self.run_loop(buffer, &mut shutdown).await {
            Ok(()) => self.flush().await,
            Err(e) => {
                // Keep whatever already made it onto a task.
                let _ = self.flush().await;
                Err(e)
            }
        };

        match result {
            Ok(drained) => {
                info!(drained, stats = ?self.stats.snapshot(), "ingestion stopped");
                Ok(())
            }
            Err(e) => {
                self.state = IngestState::Faulted;
                self.notifier
                    .exception(&format!("Uncaught exception: {:#}", e));
                Err(e)
            }
        }
    }

    async fn run_loop(
        &mut self,
        buffer: &dyn FeedBuffer,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                info!("shutdown requested, draining ingestion");
                return Ok(());
            }
            if self.step(buffer).await? == StepOutcome::Closed {
                info!("feed buffer closed");
                return Ok(());
            }
        }
    }

    /// Handle at most one message. Only persistence task failures are
    /// returned as errors; everything else is reported and swallowed.
    pub async fn step(&mut self, buffer: &dyn FeedBuffer) -> Result<StepOutcome> {
        let Some(text) = buffer.pop() else {
            if buffer.is_closed() {
                return Ok(StepOutcome::Closed);
            }
            tokio::time::sleep(self.config.idle_wait).await;
            return Ok(StepOutcome::Idle);
        };

        let started = Instant::now();
        if self.state == IngestState::Connecting {
            self.state = IngestState::Streaming;
        }
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        match decode_envelope(&text) {
            Ok(envelope) => match envelope.kind() {
                StreamKind::Trade => self.handle_trade(envelope).await?,
                _ => self.handle_book(&envelope),
            },
            Err(e @ DecodeError::Json(_)) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                self.notifier.notify(
                    Severity::Error,
                    &format!("Dropped undecodable message: {}", e),
                    false,
                );
            }
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "dropped message without envelope keys");
            }
        }

        debug!(
            elapsed_us = started.elapsed().as_micros() as u64,
            "message processed"
        );
        self.observe_backlog(buffer.len());
        Ok(StepOutcome::Processed)
    }

    async fn handle_trade(&mut self, envelope: Envelope) -> Result<()> {
        if envelope.is_error_event() {
            self.stats.error_events.fetch_add(1, Ordering::Relaxed);
            self.notifier.error(&format!(
                "Error event on {}: {}",
                envelope.stream, envelope.data
            ));
            return Ok(());
        }

        let raw: RawTrade = match serde_json::from_value(envelope.data) {
            Ok(raw) => raw,
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!(stream = %envelope.stream, error = %e, "dropped trade with missing fields");
                return Ok(());
            }
        };
        let record = match TradeRecord::from_raw(raw, false) {
            Ok(record) => record,
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                self.notifier.notify(
                    Severity::Error,
                    &format!("Dropped trade on {}: {}", envelope.stream, e),
                    false,
                );
                return Ok(());
            }
        };

        self.stats.trades.fetch_add(1, Ordering::Relaxed);
        self.spawn_persist(record);

        if self.in_flight.len() >= self.config.gather_len {
            self.flush().await?;
        }
        Ok(())
    }

    fn handle_book(&self, envelope: &Envelope) {
        self.stats.book_messages.fetch_add(1, Ordering::Relaxed);
        trace!(stream = %envelope.stream, "book message");
    }

    fn spawn_persist(&mut self, record: TradeRecord) {
        let store = self.store.clone();
        let notifier = self.notifier.clone();
        let stats = self.stats.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let result = store
                .ensure_collection(&record.instrument, TRADE_STREAM)
                .and_then(|collection| store.upsert_one(&collection, &record));
            match result {
                Ok(()) => {
                    stats.persisted.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                    notifier.error(&format!(
                        "Failed to store trade {} for {}: {}",
                        record.trade_id, record.instrument, e
                    ));
                }
            }
        });
        self.in_flight.push(handle);
    }

    /// Await every in-flight persistence task. Returns how many were awaited.
    pub async fn flush(&mut self) -> Result<usize> {
        let batch = std::mem::take(&mut self.in_flight);
        let count = batch.len();
        for joined in join_all(batch).await {
            joined.context("persistence task failed")?;
        }
        Ok(count)
    }

    fn observe_backlog(&mut self, depth: usize) {
        match self.backlog.observe(depth) {
            Some(BacklogTransition::Raised { depth }) => {
                self.state = IngestState::BackpressureWarning;
                self.notifier.warning(&format!(
                    "Buffer backlog is {} messages (threshold {})",
                    depth,
                    self.backlog.high_watermark()
                ));
            }
            Some(BacklogTransition::Cleared { depth }) => {
                self.state = IngestState::Streaming;
                self.notifier
                    .info(&format!("Buffer backlog back to {} messages", depth));
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::StreamBuffer;
    use crate::models::CollectionName;
    use crate::notify::MemoryNotifier;
    use crate::storage::{CollectionCounts, InsertReport, SqliteTradeStore, StoreError};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn trade_msg(id: u64) -> String {
        format!(
            r#"{{"stream":"btcusdt@trade","data":{{"e":"trade","E":1700000000001,"s":"BTCUSDT","t":{},"p":"50000.0","q":"0.1","T":1700000000000,"m":false,"M":true}}}}"#,
            id
        )
    }

    fn config(gather_len: usize, watermark: usize) -> IngestConfig {
        IngestConfig {
            gather_len,
            backlog_high_watermark: watermark,
            idle_wait: Duration::from_millis(300),
        }
    }

    fn pipeline(
        store: Arc<dyn TradeStore>,
        notifier: Arc<MemoryNotifier>,
        config: IngestConfig,
    ) -> IngestPipeline {
        IngestPipeline::new(store, notifier, config)
    }

    fn btc_trades() -> CollectionName {
        CollectionName::trades("btcusdt").unwrap()
    }

    #[tokio::test]
    async fn test_bad_messages_are_dropped() {
        let store = Arc::new(SqliteTradeStore::open_memory().unwrap());
        let notifier = Arc::new(MemoryNotifier::new());
        let mut pipeline = pipeline(store.clone(), notifier.clone(), config(10, 1000));

        let buffer = StreamBuffer::new();
        buffer.push("{not json".into());
        buffer.push(r#"{"data":{"t":1}}"#.into());
        buffer.push(r#"{"stream":"btcusdt@trade","data":{"e":"trade"}}"#.into());
        buffer.push(trade_msg(1));
        buffer.close();

        let (_tx, rx) = watch::channel(false);
        pipeline.run(&buffer, rx).await.unwrap();

        assert_eq!(store.counts(&btc_trades()).unwrap().total, 1);
        assert_eq!(notifier.count(Severity::Error), 1);
        let stats = pipeline.stats().snapshot();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.decode_errors, 3);
        assert_eq!(stats.persisted, 1);
        assert_eq!(pipeline.state(), IngestState::Streaming);
    }

    #[tokio::test]
    async fn test_duplicates_and_book_messages() {
        let store = Arc::new(SqliteTradeStore::open_memory().unwrap());
        let notifier = Arc::new(MemoryNotifier::new());
        let mut pipeline = pipeline(store.clone(), notifier, config(2, 1000));

        let buffer = StreamBuffer::new();
        for id in [5, 6, 5, 7, 6] {
            buffer.push(trade_msg(id));
        }
        buffer.push(r#"{"stream":"btcusdt@bookTicker","data":{"u":1,"s":"BTCUSDT","b":"1","B":"1","a":"2","A":"1"}}"#.into());
        buffer.close();

        let (_tx, rx) = watch::channel(false);
        pipeline.run(&buffer, rx).await.unwrap();

        let counts = store.counts(&btc_trades()).unwrap();
        assert_eq!(counts, CollectionCounts { total: 3, unchecked: 3 });
        assert_eq!(pipeline.stats().snapshot().book_messages, 1);
        assert_eq!(store.list_collections().unwrap(), vec![btc_trades()]);
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_gather_len() {
        let store = Arc::new(SqliteTradeStore::open_memory().unwrap());
        let notifier = Arc::new(MemoryNotifier::new());
        let mut pipeline = pipeline(store.clone(), notifier, config(3, 1000));

        let buffer = StreamBuffer::new();
        for id in 1..=7 {
            buffer.push(trade_msg(id));
        }

        for _ in 0..7 {
            assert_eq!(pipeline.step(&buffer).await.unwrap(), StepOutcome::Processed);
            assert!(pipeline.in_flight() < 3);
        }
        assert_eq!(pipeline.in_flight(), 1);
        assert_eq!(pipeline.flush().await.unwrap(), 1);
        assert_eq!(store.counts(&btc_trades()).unwrap().total, 7);
    }

    #[tokio::test]
    async fn test_error_event_is_reported_not_stored() {
        let store = Arc::new(SqliteTradeStore::open_memory().unwrap());
        let notifier = Arc::new(MemoryNotifier::new());
        let mut pipeline = pipeline(store.clone(), notifier.clone(), config(1, 1000));

        let buffer = StreamBuffer::new();
        buffer.push(r#"{"stream":"btcusdt@trade","data":{"e":"error","m":"Max subscriptions exceeded"}}"#.into());

        pipeline.step(&buffer).await.unwrap();
        pipeline.flush().await.unwrap();

        assert_eq!(notifier.count(Severity::Error), 1);
        assert_eq!(pipeline.stats().snapshot().error_events, 1);
        assert!(store.list_collections().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backlog_warning_is_edge_triggered() {
        let store = Arc::new(SqliteTradeStore::open_memory().unwrap());
        let notifier = Arc::new(MemoryNotifier::new());
        let mut pipeline = pipeline(store, notifier.clone(), config(100, 2));

        let buffer = StreamBuffer::new();
        for id in 1..=5 {
            buffer.push(trade_msg(id));
        }

        // depth after pop: 4 (raise), 3 (stay raised)
        pipeline.step(&buffer).await.unwrap();
        assert_eq!(pipeline.state(), IngestState::BackpressureWarning);
        pipeline.step(&buffer).await.unwrap();
        assert_eq!(notifier.count(Severity::Warning), 1);

        // 2 clears, 1 stays clear
        pipeline.step(&buffer).await.unwrap();
        assert_eq!(pipeline.state(), IngestState::Streaming);
        pipeline.step(&buffer).await.unwrap();
        assert_eq!(notifier.count(Severity::Warning), 1);

        for id in 6..=8 {
            buffer.push(trade_msg(id));
        }
        pipeline.step(&buffer).await.unwrap();
        assert_eq!(pipeline.state(), IngestState::BackpressureWarning);
        assert_eq!(notifier.count(Severity::Warning), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_buffer_idles() {
        let store = Arc::new(SqliteTradeStore::open_memory().unwrap());
        let notifier = Arc::new(MemoryNotifier::new());
        let mut pipeline = pipeline(store, notifier, config(1, 10));

        let buffer = StreamBuffer::new();
        let before = tokio::time::Instant::now();
        assert_eq!(pipeline.step(&buffer).await.unwrap(), StepOutcome::Idle);
        assert!(before.elapsed() >= Duration::from_millis(300));
        assert_eq!(pipeline.state(), IngestState::Connecting);

        buffer.close();
        assert_eq!(pipeline.step(&buffer).await.unwrap(), StepOutcome::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_writes() {
        let store = Arc::new(SqliteTradeStore::open_memory().unwrap());
        let notifier = Arc::new(MemoryNotifier::new());
        let mut pipeline = pipeline(store.clone(), notifier, config(100, 1000));

        let buffer = StreamBuffer::new();
        for id in 1..=5 {
            buffer.push(trade_msg(id));
        }
        for _ in 0..5 {
            pipeline.step(&buffer).await.unwrap();
        }
        assert_eq!(pipeline.in_flight(), 5);

        buffer.push(trade_msg(6));
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        pipeline.run(&buffer, rx).await.unwrap();

        assert_eq!(pipeline.in_flight(), 0);
        assert_eq!(store.counts(&btc_trades()).unwrap().total, 5);
        assert_eq!(buffer.len(), 1);
    }

    /// Panics on every write so the persistence task fails to join.
    struct PanickingStore;

    impl TradeStore for PanickingStore {
        fn ensure_collection(
            &self,
            instrument: &str,
            stream: &str,
        ) -> Result<CollectionName, StoreError> {
            Ok(CollectionName::new(instrument, stream)?)
        }

        fn upsert_one(&self, _: &CollectionName, _: &TradeRecord) -> Result<(), StoreError> {
            panic!("disk on fire");
        }

        fn insert_many(
            &self,
            _: &CollectionName,
            _: &[TradeRecord],
        ) -> Result<InsertReport, StoreError> {
            unreachable!()
        }

        fn update_checked(
            &self,
            _: &CollectionName,
            _: &BTreeSet<u64>,
            _: bool,
        ) -> Result<usize, StoreError> {
            unreachable!()
        }

        fn find_unchecked_ids(&self, _: &CollectionName) -> Result<Vec<u64>, StoreError> {
            unreachable!()
        }

        fn find_ids_in_range(
            &self,
            _: &CollectionName,
            _: u64,
            _: u64,
        ) -> Result<BTreeSet<u64>, StoreError> {
            unreachable!()
        }

        fn list_collections(&self) -> Result<Vec<CollectionName>, StoreError> {
            Ok(Vec::new())
        }

        fn counts(&self, _: &CollectionName) -> Result<CollectionCounts, StoreError> {
            unreachable!()
        }

        fn get(&self, _: &CollectionName, _: u64) -> Result<Option<TradeRecord>, StoreError> {
            unreachable!()
        }

        fn describe(&self) -> String {
            "panicking://".into()
        }
    }

    #[tokio::test]
    async fn test_uncaught_failure_faults_pipeline() {
        let notifier = Arc::new(MemoryNotifier::new());
        let mut pipeline = pipeline(Arc::new(PanickingStore), notifier.clone(), config(1, 1000));

        let buffer = StreamBuffer::new();
        buffer.push(trade_msg(1));
        buffer.close();

        let (_tx, rx) = watch::channel(false);
        assert!(pipeline.run(&buffer, rx.clone()).await.is_err());
        assert_eq!(pipeline.state(), IngestState::Faulted);
        assert_eq!(notifier.count(Severity::Exception), 1);

        // No self-restart.
        assert!(pipeline.run(&buffer, rx).await.is_err());
    }
}
