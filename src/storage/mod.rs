//! Trade Store
//!
//! Collection-addressed persistence for trade records:
//! - Idempotent single-record upsert (live ingestion)
//! - Unordered, duplicate-tolerant bulk insert (backfill)
//! - Checked-flag maintenance and the unchecked-id scan used by reconciliation

pub mod sqlite;

pub use sqlite::{SqliteTradeStore, TradeStoreConfig};

use std::collections::BTreeSet;

use crate::models::{CollectionName, ModelError, TradeRecord};

/// Storage failures. Duplicate keys are never reported through this type.
#[derive(Debug)]
pub enum StoreError {
    /// The underlying engine rejected the operation.
    Engine(rusqlite::Error),
    /// The collection name could not be used to address storage.
    InvalidCollection(ModelError),
    /// A value read back from storage does not map onto a trade record.
    Corrupt(String),
    /// Filesystem preparation for the backing file failed.
    Io(std::io::Error),
    /// The blocking task running the call panicked or was cancelled.
    Task(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Engine(e) => write!(f, "store engine error: {}", e),
            Self::InvalidCollection(e) => write!(f, "invalid collection: {}", e),
            Self::Corrupt(msg) => write!(f, "corrupt stored value: {}", msg),
            Self::Io(e) => write!(f, "store io error: {}", e),
            Self::Task(msg) => write!(f, "store task failed: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Engine(e) => Some(e),
            Self::InvalidCollection(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Corrupt(_) | Self::Task(_) => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Engine(e)
    }
}

impl From<ModelError> for StoreError {
    fn from(e: ModelError) -> Self {
        Self::InvalidCollection(e)
    }
}

/// Outcome of an unordered bulk insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertReport {
    pub inserted: usize,
    /// Members skipped because their `trade_id` was already stored.
    pub duplicates: usize,
}

/// Checked/unchecked document counts for one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionCounts {
    pub total: usize,
    pub unchecked: usize,
}

impl CollectionCounts {
    pub fn checked(&self) -> usize {
        self.total.saturating_sub(self.unchecked)
    }
}

/// Store-client capability shared by the ingestion and reconciliation paths.
///
/// Implementations must be safe to call concurrently from both pipelines;
/// every write is keyed on `trade_id` so no cross-pipeline locking is needed.
pub trait TradeStore: Send + Sync {
    /// Create the collection and its indexes if missing. Safe to repeat.
    fn ensure_collection(
        &self,
        instrument: &str,
        stream: &str,
    ) -> Result<CollectionName, StoreError>;

    /// Write or overwrite the record with `record.trade_id`.
    fn upsert_one(
        &self,
        collection: &CollectionName,
        record: &TradeRecord,
    ) -> Result<(), StoreError>;

    /// Insert a batch; members whose `trade_id` already exists are skipped
    /// without aborting their siblings.
    fn insert_many(
        &self,
        collection: &CollectionName,
        records: &[TradeRecord],
    ) -> Result<InsertReport, StoreError>;

    /// Set `checked = value` for exactly the given ids. Returns rows touched.
    fn update_checked(
        &self,
        collection: &CollectionName,
        trade_ids: &BTreeSet<u64>,
        value: bool,
    ) -> Result<usize, StoreError>;

    /// All unchecked ids, ascending.
    fn find_unchecked_ids(&self, collection: &CollectionName) -> Result<Vec<u64>, StoreError>;

    /// Stored ids within `[from_id, to_id]`, ascending.
    fn find_ids_in_range(
        &self,
        collection: &CollectionName,
        from_id: u64,
        to_id: u64,
    ) -> Result<BTreeSet<u64>, StoreError>;

    /// Every collection that currently exists.
    fn list_collections(&self) -> Result<Vec<CollectionName>, StoreError>;

    fn counts(&self, collection: &CollectionName) -> Result<CollectionCounts, StoreError>;

    fn get(
        &self,
        collection: &CollectionName,
        trade_id: u64,
    ) -> Result<Option<TradeRecord>, StoreError>;

    /// Human-readable location of the backing store, used in status messages.
    fn describe(&self) -> String;
}
