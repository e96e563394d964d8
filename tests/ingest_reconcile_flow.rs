//! End-to-end: lossy live feed into a file-backed store, then reconciliation
//! against an in-process historical source.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use tradekeeper::config::{IngestConfig, NotifyConfig, ReconcileConfig};
use tradekeeper::feed::StreamBuffer;
use tradekeeper::history::{FetchError, HistoricalSource, RATE_LIMIT_CODE};
use tradekeeper::ingest::{IngestState, StepOutcome};
use tradekeeper::models::{CollectionName, RawTrade};
use tradekeeper::notify::{build_notifier, MemoryNotifier, Notifier, Severity};
use tradekeeper::storage::TradeStoreConfig;
use tradekeeper::{IngestPipeline, ReconcileEngine, SqliteTradeStore, TradeStore};

/// Complete history for one instrument; rate-limits the first `throttled` calls.
struct Exchange {
    symbol: &'static str,
    last_id: u64,
    throttled: Mutex<usize>,
    requests: Mutex<Vec<(usize, u64)>>,
}

impl Exchange {
    fn new(symbol: &'static str, last_id: u64, throttled: usize) -> Self {
        Self {
            symbol,
            last_id,
            throttled: Mutex::new(throttled),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl HistoricalSource for Exchange {
    async fn fetch_trades(
        &self,
        instrument: &str,
        limit: usize,
        from_id: u64,
    ) -> Result<Vec<RawTrade>, FetchError> {
        assert_eq!(instrument, self.symbol.to_uppercase());
        assert!(limit <= 1000);
        self.requests.lock().push((limit, from_id));

        let mut throttled = self.throttled.lock();
        if *throttled > 0 {
            *throttled -= 1;
            return Err(FetchError::RateLimited {
                code: RATE_LIMIT_CODE,
                message: "Too much request weight used".into(),
            });
        }

        let end = (from_id + limit as u64).min(self.last_id + 1);
        Ok((from_id..end).map(|id| raw_trade(instrument, id)).collect())
    }
}

fn raw_trade(symbol: &str, id: u64) -> RawTrade {
    RawTrade {
        event_type: Some("trade".into()),
        symbol: symbol.to_uppercase(),
        trade_id: id,
        price: format!("{}.5", 40_000 + id % 100),
        quantity: "0.010".into(),
        trade_time_ms: 1_700_000_000_000 + id * 7,
        is_buyer_maker: id % 2 == 0,
    }
}

fn envelope(symbol: &str, id: u64) -> String {
    let data = serde_json::to_value(raw_trade(symbol, id)).unwrap();
    serde_json::json!({ "stream": format!("{}@trade", symbol), "data": data }).to_string()
}

fn file_store(dir: &tempfile::TempDir) -> Arc<SqliteTradeStore> {
    let config = TradeStoreConfig {
        db_path: dir
            .path()
            .join("nested/trades.db")
            .to_string_lossy()
            .into_owned(),
        ..TradeStoreConfig::default()
    };
    Arc::new(SqliteTradeStore::open(&config).unwrap())
}

#[tokio::test(start_paused = true)]
async fn test_lossy_feed_is_repaired_by_reconciliation() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir);
    let notifier = Arc::new(MemoryNotifier::new());

    // Live feed: 1..=2500 with drops, duplicates and reordering.
    let dropped: BTreeSet<u64> = [3, 4, 50, 51, 52, 777]
        .into_iter()
        .chain(1200..=2350)
        .collect();
    let buffer = StreamBuffer::new();
    for id in (1..=2500u64).filter(|id| !dropped.contains(id)) {
        buffer.push(envelope("btcusdt", id));
        if id % 97 == 0 {
            buffer.push(envelope("btcusdt", id));
        }
    }
    buffer.push(envelope("btcusdt", 10));
    buffer.push("garbage".into());
    buffer.close();

    let mut pipeline = IngestPipeline::new(
        store.clone(),
        notifier.clone(),
        IngestConfig {
            gather_len: 64,
            ..IngestConfig::default()
        },
    );
    let (_tx, rx) = watch::channel(false);
    pipeline.run(&buffer, rx).await.unwrap();

    let trades = CollectionName::trades("btcusdt").unwrap();
    let counts = store.counts(&trades).unwrap();
    assert_eq!(counts.total, 2500 - dropped.len());
    assert_eq!(counts.unchecked, counts.total);

    let exchange = Arc::new(Exchange::new("btcusdt", 2500, 1));
    let engine = ReconcileEngine::new(
        store.clone(),
        exchange.clone(),
        notifier.clone(),
        ReconcileConfig::default(),
    );

    let first = engine.run_cycle().await;
    assert_eq!(first.gaps_found(), 4);
    assert_eq!(first.gaps_closed(), 4);
    assert_eq!(first.backfilled(), dropped.len());

    let counts = store.counts(&trades).unwrap();
    assert_eq!(counts.total, 2500);
    assert_eq!(store.find_unchecked_ids(&trades).unwrap(), vec![2500]);

    // The big gap (1200..=2350) needs two pages; the first request was throttled.
    let requests = exchange.requests.lock().clone();
    assert!(requests.contains(&(1000, 1200)));
    assert!(requests.contains(&(151, 2200)));
    assert_eq!(notifier.count(Severity::Exception), 0);

    let second = engine.run_cycle().await;
    assert_eq!(second.backfilled(), 0);
    assert_eq!(store.counts(&trades).unwrap(), counts);
}

#[tokio::test(start_paused = true)]
async fn test_engine_loop_stops_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir);
    let trades = store.ensure_collection("ETHUSDT", "trade").unwrap();
    for id in [1u64, 5] {
        let record = tradekeeper::models::TradeRecord::from_raw(raw_trade("ethusdt", id), false)
            .unwrap();
        store.upsert_one(&trades, &record).unwrap();
    }

    let notifier = Arc::new(MemoryNotifier::new());
    let engine = Arc::new(ReconcileEngine::new(
        store.clone(),
        Arc::new(Exchange::new("ethusdt", 10, 0)),
        notifier.clone(),
        ReconcileConfig {
            reconcile_interval: Duration::from_secs(3600),
            ..ReconcileConfig::default()
        },
    ));

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(rx).await }
    });

    tokio::time::sleep(Duration::from_secs(10)).await;
    tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(store.find_unchecked_ids(&trades).unwrap(), vec![5]);
    assert_eq!(store.counts(&trades).unwrap().total, 5);
    assert_eq!(notifier.count(Severity::Info), 1);
    assert!(store.describe().ends_with("trades.db"));
}

#[tokio::test]
async fn test_unreachable_telegram_does_not_disturb_pipelines() {
    // Bind then release a port so the Telegram endpoint refuses connections.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let api_base = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let notifier = build_notifier(&NotifyConfig {
        telegram_token: Some("123:token".into()),
        telegram_chat_id: Some("42".into()),
        telegram_api_base: api_base,
    });
    assert!(notifier.forwards_to_channel());

    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir);

    let mut pipeline =
        IngestPipeline::new(store.clone(), notifier.clone(), IngestConfig::default());
    let buffer = StreamBuffer::new();
    buffer.push(
        r#"{"stream":"btcusdt@trade","data":{"e":"error","m":"Max subscriptions exceeded"}}"#
            .into(),
    );
    buffer.push(envelope("btcusdt", 1));
    buffer.push(envelope("btcusdt", 4));
    assert_eq!(pipeline.step(&buffer).await.unwrap(), StepOutcome::Processed);
    assert_eq!(pipeline.step(&buffer).await.unwrap(), StepOutcome::Processed);
    assert_eq!(pipeline.step(&buffer).await.unwrap(), StepOutcome::Processed);
    pipeline.flush().await.unwrap();
    assert_ne!(pipeline.state(), IngestState::Faulted);

    let engine = ReconcileEngine::new(
        store.clone(),
        Arc::new(Exchange::new("btcusdt", 4, 0)),
        notifier.clone(),
        ReconcileConfig::default(),
    );
    let summary = engine.run_cycle().await;
    assert_eq!(summary.gaps_closed(), 1);
    assert_eq!(summary.backfilled(), 2);

    // Let the delivery worker hit the closed port.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let trades = CollectionName::trades("btcusdt").unwrap();
    assert_eq!(store.counts(&trades).unwrap().total, 4);
    assert_eq!(store.find_unchecked_ids(&trades).unwrap(), vec![4]);
}
