//! Tradekeeper Library
//!
//! Live trade ingestion with periodic gap reconciliation against a
//! historical source. Exposed for the binary and integration tests.

pub mod config;
pub mod feed;
pub mod history;
pub mod ingest;
pub mod models;
pub mod notify;
pub mod reconcile;
pub mod storage;

pub use config::AppConfig;
pub use ingest::IngestPipeline;
pub use reconcile::ReconcileEngine;
pub use storage::{SqliteTradeStore, TradeStore};
