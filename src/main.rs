//! Tradekeeper
//!
//! Usage:
//!   tradekeeper --config tradekeeper.toml receive   # live ingestion
//!   tradekeeper --config tradekeeper.toml check     # periodic reconciliation
//!   tradekeeper --config tradekeeper.toml run       # both, one store
//!
//! Environment:
//!   BINANCE_API_KEY - historical trades endpoint key
//!   TELEGRAM_BOT_TOKEN / TELEGRAM_CHAT_ID - operator channel (optional)
//!   TRADEKEEPER_DB_PATH - overrides `[store] db_path`
//!   RUST_LOG - overrides the default log filter

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tradekeeper::config::{AppConfig, FeedConfig};
use tradekeeper::feed::{BinanceStreamClient, StreamBuffer};
use tradekeeper::history::BinanceHistoricalClient;
use tradekeeper::notify::{build_notifier, Notifier};
use tradekeeper::{IngestPipeline, ReconcileEngine, SqliteTradeStore, TradeStore};

#[derive(Parser, Debug)]
#[command(name = "tradekeeper")]
#[command(about = "Persist live exchange trades and backfill sequence gaps")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "TRADEKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream trades into the store
    Receive,
    /// Reconcile stored trades against history
    Check {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Receive and check in one process
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    let args = Args::parse();
    init_tracing(args.debug);

    let config = AppConfig::load(args.config.as_deref())?;
    let notifier = build_notifier(&config.notify);
    let store: Arc<dyn TradeStore> = Arc::new(
        SqliteTradeStore::open(&config.store)
            .with_context(|| format!("Failed to open store at {}", config.store.db_path))?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    match args.command {
        Command::Receive => receive(&config, store, notifier, shutdown_rx).await?,
        Command::Check { once } => check(&config, store, notifier, shutdown_rx, once).await?,
        Command::Run => {
            tokio::try_join!(
                receive(&config, store.clone(), notifier.clone(), shutdown_rx.clone()),
                check(&config, store, notifier, shutdown_rx, false),
            )?;
        }
    }

    info!("tradekeeper stopped");
    Ok(())
}

async fn receive(
    config: &AppConfig,
    store: Arc<dyn TradeStore>,
    notifier: Arc<dyn Notifier>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let history = BinanceHistoricalClient::new(&config.history)?;
    let symbols = resolve_symbols(&config.feed, &history).await?;
    info!(count = symbols.len(), streams = ?config.feed.streams, "subscribing");

    let buffer = Arc::new(StreamBuffer::new());
    let client = BinanceStreamClient::new(
        config.feed.clone(),
        symbols,
        buffer.clone(),
        notifier.clone(),
    );
    let feed_task = client.spawn(shutdown.clone());

    let mut pipeline = IngestPipeline::new(store, notifier, config.ingest.clone());
    let result = pipeline.run(buffer.as_ref(), shutdown).await;

    if result.is_err() {
        feed_task.abort();
    } else if let Err(e) = feed_task.await {
        warn!(error = %e, "feed task ended abnormally");
    }
    result
}

async fn check(
    config: &AppConfig,
    store: Arc<dyn TradeStore>,
    notifier: Arc<dyn Notifier>,
    shutdown: watch::Receiver<bool>,
    once: bool,
) -> Result<()> {
    if config.history.api_key.is_none() {
        warn!("BINANCE_API_KEY not set, historical requests may be rejected");
    }
    let history = Arc::new(BinanceHistoricalClient::new(&config.history)?);
    let engine = ReconcileEngine::new(store, history, notifier, config.reconcile.clone());

    if once {
        engine.run_cycle().await;
    } else {
        engine.run(shutdown).await;
    }
    Ok(())
}

/// Configured symbols, or every `TRADING` symbol when configured as `"all"`.
async fn resolve_symbols(
    feed: &FeedConfig,
    history: &BinanceHistoricalClient,
) -> Result<Vec<String>> {
    let symbols = if feed.symbols.is_all() {
        history
            .trading_symbols()
            .await
            .context("Failed to discover trading symbols")?
    } else {
        feed.symbols.symbols()
    };

    if symbols.is_empty() || feed.streams.is_empty() {
        bail!("nothing to subscribe to: configure [feed] symbols and streams");
    }
    Ok(symbols)
}

fn init_tracing(debug: bool) {
    let default_filter = if debug {
        "tradekeeper=debug"
    } else {
        "tradekeeper=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate root.
    let _ = dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
