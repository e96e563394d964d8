//! SQLite-backed trade store.
//!
//! One table per collection (`BTCUSDT_trade`), keyed on `trade_id`, with a
//! unique `(trade_id, parsed_time)` index and a secondary index on `checked`.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{CollectionCounts, InsertReport, StoreError, TradeStore};
use crate::models::{CollectionName, TradeRecord};

// =============================================================================
// Configuration
// =============================================================================

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeStoreConfig {
    /// Path to SQLite database file.
    pub db_path: String,
    /// Enable WAL mode so the reconciliation scan does not block live writes.
    pub wal_mode: bool,
    /// How long a writer waits on a locked database (milliseconds).
    pub busy_timeout_ms: u64,
}

impl Default for TradeStoreConfig {
    fn default() -> Self {
        Self {
            db_path: "data/tradekeeper.db".to_string(),
            wal_mode: true,
            busy_timeout_ms: 5_000,
        }
    }
}

const PRAGMAS_SQL: &str = r#"
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;
"#;

fn collection_ddl(name: &CollectionName) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS "{name}" (
    trade_id INTEGER PRIMARY KEY,
    instrument TEXT NOT NULL,
    price TEXT NOT NULL,
    quantity TEXT NOT NULL,
    event_time_ms INTEGER NOT NULL,
    parsed_time TEXT NOT NULL,
    is_buyer_maker INTEGER NOT NULL,
    checked INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS "idx_{name}_trade_time"
    ON "{name}"(trade_id, parsed_time);

CREATE INDEX IF NOT EXISTS "idx_{name}_checked"
    ON "{name}"(checked);
"#
    )
}

// =============================================================================
// Storage Implementation
// =============================================================================

/// Persistent storage for trade collections.
pub struct SqliteTradeStore {
    conn: Mutex<Connection>,
    /// Collections whose DDL already ran on this connection.
    ensured: Mutex<HashSet<CollectionName>>,
    location: String,
}

impl SqliteTradeStore {
    /// Open or create storage.
    pub fn open(config: &TradeStoreConfig) -> Result<Self, StoreError> {
        let path = Path::new(&config.db_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(StoreError::Io)?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(path, flags)?;
        if config.wal_mode {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.execute_batch(PRAGMAS_SQL)?;
        conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))?;

        info!(path = %config.db_path, "trade store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            ensured: Mutex::new(HashSet::new()),
            location: config.db_path.clone(),
        })
    }

    /// Open in-memory storage (for testing).
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(PRAGMAS_SQL)?;

        Ok(Self {
            conn: Mutex::new(conn),
            ensured: Mutex::new(HashSet::new()),
            location: ":memory:".to_string(),
        })
    }
}

impl TradeStore for SqliteTradeStore {
    fn ensure_collection(
        &self,
        instrument: &str,
        stream: &str,
    ) -> Result<CollectionName, StoreError> {
        let name = CollectionName::new(instrument, stream)?;
        if self.ensured.lock().contains(&name) {
            return Ok(name);
        }

        self.conn.lock().execute_batch(&collection_ddl(&name))?;
        self.ensured.lock().insert(name.clone());
        debug!(collection = %name, "collection ensured");
        Ok(name)
    }

    fn upsert_one(
        &self,
        collection: &CollectionName,
        record: &TradeRecord,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                r#"
                INSERT INTO "{collection}" (
                    trade_id, instrument, price, quantity, event_time_ms,
                    parsed_time, is_buyer_maker, checked
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(trade_id) DO UPDATE SET
                    instrument = excluded.instrument,
                    price = excluded.price,
                    quantity = excluded.quantity,
                    event_time_ms = excluded.event_time_ms,
                    parsed_time = excluded.parsed_time,
                    is_buyer_maker = excluded.is_buyer_maker,
                    checked = MAX(checked, excluded.checked)
                "#
            ),
            params![
                sql_id(record.trade_id),
                record.instrument,
                record.price,
                record.quantity,
                sql_id(record.event_time_ms),
                format_time(&record.parsed_time),
                record.is_buyer_maker,
                record.checked,
            ],
        )?;
        Ok(())
    }

    fn insert_many(
        &self,
        collection: &CollectionName,
        records: &[TradeRecord],
    ) -> Result<InsertReport, StoreError> {
        let mut report = InsertReport::default();
        if records.is_empty() {
            return Ok(report);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                r#"
                INSERT INTO "{collection}" (
                    trade_id, instrument, price, quantity, event_time_ms,
                    parsed_time, is_buyer_maker, checked
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT DO NOTHING
                "#
            ))?;

            for record in records {
                let changed = stmt.execute(params![
                    sql_id(record.trade_id),
                    record.instrument,
                    record.price,
                    record.quantity,
                    sql_id(record.event_time_ms),
                    format_time(&record.parsed_time),
                    record.is_buyer_maker,
                    record.checked,
                ])?;
                if changed == 0 {
                    report.duplicates += 1;
                } else {
                    report.inserted += 1;
                }
            }
        }
        tx.commit()?;

        if report.duplicates > 0 {
            debug!(
                collection = %collection,
                duplicates = report.duplicates,
                "bulk insert skipped existing ids"
            );
        }
        Ok(report)
    }

    fn update_checked(
        &self,
        collection: &CollectionName,
        trade_ids: &BTreeSet<u64>,
        value: bool,
    ) -> Result<usize, StoreError> {
        if trade_ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut touched = 0;
        {
            let mut stmt = tx.prepare(&format!(
                r#"UPDATE "{collection}" SET checked = ?1 WHERE trade_id = ?2"#
            ))?;
            for id in trade_ids {
                touched += stmt.execute(params![value, sql_id(*id)])?;
            }
        }
        tx.commit()?;
        Ok(touched)
    }

    fn find_unchecked_ids(&self, collection: &CollectionName) -> Result<Vec<u64>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"SELECT trade_id FROM "{collection}" WHERE checked = 0 ORDER BY trade_id ASC"#
        ))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .map(|r| r.map(|id| id as u64))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn find_ids_in_range(
        &self,
        collection: &CollectionName,
        from_id: u64,
        to_id: u64,
    ) -> Result<BTreeSet<u64>, StoreError> {
        if from_id > to_id {
            return Ok(BTreeSet::new());
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT trade_id FROM "{collection}"
            WHERE trade_id >= ?1 AND trade_id <= ?2
            ORDER BY trade_id ASC
            "#
        ))?;
        let ids = stmt
            .query_map(params![sql_id(from_id), sql_id(to_id)], |row| {
                row.get::<_, i64>(0)
            })?
            .map(|r| r.map(|id| id as u64))
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(ids)
    }

    fn list_collections(&self) -> Result<Vec<CollectionName>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(names
            .iter()
            .filter_map(|name| CollectionName::parse(name).ok())
            .collect())
    }

    fn counts(&self, collection: &CollectionName) -> Result<CollectionCounts, StoreError> {
        let conn = self.conn.lock();
        let (total, unchecked): (i64, i64) = conn.query_row(
            &format!(
                r#"SELECT COUNT(*), COALESCE(SUM(checked = 0), 0) FROM "{collection}""#
            ),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(CollectionCounts {
            total: total as usize,
            unchecked: unchecked as usize,
        })
    }

    fn get(
        &self,
        collection: &CollectionName,
        trade_id: u64,
    ) -> Result<Option<TradeRecord>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    r#"
                    SELECT trade_id, instrument, price, quantity, event_time_ms,
                           parsed_time, is_buyer_maker, checked
                    FROM "{collection}"
                    WHERE trade_id = ?1
                    "#
                ),
                params![sql_id(trade_id)],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, bool>(6)?,
                        row.get::<_, bool>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, instrument, price, quantity, event_time_ms, parsed, maker, checked)) = row
        else {
            return Ok(None);
        };

        let parsed_time = DateTime::parse_from_rfc3339(&parsed)
            .map_err(|e| StoreError::Corrupt(format!("parsed_time {:?}: {}", parsed, e)))?
            .with_timezone(&Utc);

        Ok(Some(TradeRecord {
            instrument,
            trade_id: id as u64,
            price,
            quantity,
            event_time_ms: event_time_ms as u64,
            parsed_time,
            is_buyer_maker: maker,
            checked,
        }))
    }

    fn describe(&self) -> String {
        format!("sqlite://{}", self.location)
    }
}

/// SQLite integers are signed; ids beyond `i64::MAX` saturate.
fn sql_id(id: u64) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

fn format_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// =============================================================================
// Tests
// =============================================================================
