//! Reconciliation engine: scan, backfill, mark checked.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::gaps::{scan_ids, Gap};
use crate::config::{ReconcileConfig, MAX_PAGE_SIZE};
use crate::history::{FetchError, HistoricalSource};
use crate::models::{CollectionName, RawTrade, TradeRecord};
use crate::notify::{Notifier, Severity};
use crate::storage::{StoreError, TradeStore};

/// Per-collection result of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionReport {
    pub collection: CollectionName,
    /// Unchecked documents scanned.
    pub scanned: usize,
    pub gaps_found: usize,
    pub gaps_closed: usize,
    /// Gaps abandoned for this cycle after a fetch fault.
    pub gaps_aborted: usize,
    pub backfilled: usize,
    pub marked_checked: usize,
    /// A store fault pushed this collection to the next cycle.
    pub deferred: bool,
}

impl CollectionReport {
    fn new(collection: CollectionName) -> Self {
        Self {
            collection,
            scanned: 0,
            gaps_found: 0,
            gaps_closed: 0,
            gaps_aborted: 0,
            backfilled: 0,
            marked_checked: 0,
            deferred: false,
        }
    }

    fn deferred(collection: CollectionName) -> Self {
        Self {
            deferred: true,
            ..Self::new(collection)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub collections: Vec<CollectionReport>,
    pub elapsed: Duration,
}

impl CycleSummary {
    pub fn scanned(&self) -> usize {
        self.collections.iter().map(|c| c.scanned).sum()
    }

    pub fn gaps_found(&self) -> usize {
        self.collections.iter().map(|c| c.gaps_found).sum()
    }

    pub fn gaps_closed(&self) -> usize {
        self.collections.iter().map(|c| c.gaps_closed).sum()
    }

    pub fn backfilled(&self) -> usize {
        self.collections.iter().map(|c| c.backfilled).sum()
    }

    pub fn deferred(&self) -> usize {
        self.collections.iter().filter(|c| c.deferred).count()
    }

    /// No collection produced anything new to diff since the last cycle.
    pub fn looks_stalled(&self) -> bool {
        self.collections
            .iter()
            .all(|c| !c.deferred && c.scanned < 2)
    }
}

#[derive(Debug, Default)]
struct GapOutcome {
    inserted: usize,
    marked_checked: usize,
    closed: bool,
    aborted: bool,
}

pub struct ReconcileEngine {
    store: Arc<dyn TradeStore>,
    source: Arc<dyn HistoricalSource>,
    notifier: Arc<dyn Notifier>,
    config: ReconcileConfig,
}

impl ReconcileEngine {
    pub fn new(
        store: Arc<dyn TradeStore>,
        source: Arc<dyn HistoricalSource>,
        notifier: Arc<dyn Notifier>,
        config: ReconcileConfig,
    ) -> Self {
        let page_size = config.page_size.clamp(1, MAX_PAGE_SIZE);
        Self {
            store,
            source,
            notifier,
            config: ReconcileConfig {
                page_size,
                ..config
            },
        }
    }

    /// Run cycles until shutdown, sleeping `reconcile_interval` in between.
    /// A cycle in progress always completes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.reconcile_interval.as_secs(),
            page_size = self.config.page_size,
            "reconciliation started"
        );

        while !*shutdown.borrow() {
            self.run_cycle().await;

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconcile_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("reconciliation stopped");
    }

    /// One pass over every trade collection. Never fails: faults are
    /// reported and isolated to their gap or collection.
    pub async fn run_cycle(&self) -> CycleSummary {
        let started = Instant::now();
        let mut summary = CycleSummary::default();

        let collections = match self.with_store(|store| store.list_collections()).await {
            Ok(collections) => collections,
            Err(e) => {
                self.notifier
                    .error(&format!("Could not list collections, skipping cycle: {}", e));
                return summary;
            }
        };

        for collection in collections.into_iter().filter(|c| c.is_trade_stream()) {
            let report = match self.reconcile_collection(&collection).await {
                Ok(report) => report,
                Err(e) => {
                    self.notifier.error(&format!(
                        "Store fault on {}, deferring to next cycle: {}",
                        collection, e
                    ));
                    CollectionReport::deferred(collection)
                }
            };
            summary.collections.push(report);
        }

        summary.elapsed = started.elapsed();
        self.report(&summary);
        summary
    }

    async fn reconcile_collection(
        &self,
        collection: &CollectionName,
    ) -> Result<CollectionReport, StoreError> {
        let mut report = CollectionReport::new(collection.clone());

        let ids = {
            let collection = collection.clone();
            self.with_store(move |store| store.find_unchecked_ids(&collection))
                .await?
        };
        report.scanned = ids.len();
        if ids.len() < 2 {
            debug!(collection = %collection, unchecked = ids.len(), "nothing to diff");
            return Ok(report);
        }

        let scan = scan_ids(&ids);
        report.gaps_found = scan.gaps.len();
        report.marked_checked += self.mark_checked(collection, scan.contiguous).await?;

        for gap in &scan.gaps {
            let outcome = self.backfill_gap(collection, gap).await?;
            report.backfilled += outcome.inserted;
            report.marked_checked += outcome.marked_checked;
            if outcome.closed {
                report.gaps_closed += 1;
            }
            if outcome.aborted {
                report.gaps_aborted += 1;
            }
        }

        debug!(collection = %collection, ?report, "collection reconciled");
        Ok(report)
    }

    /// Fill `gap` page by page. A backfilled record is stored `checked` only
    /// when its successor id is known to be stored, so whatever could not be
    /// proven stays visible to the next cycle.
    async fn backfill_gap(
        &self,
        collection: &CollectionName,
        gap: &Gap,
    ) -> Result<GapOutcome, StoreError> {
        let (first, last) = (gap.first_missing(), gap.last_missing());
        let mut outcome = GapOutcome::default();

        let mut covered = {
            let collection = collection.clone();
            self.with_store(move |store| store.find_ids_in_range(&collection, first, last))
                .await?
        };
        covered.insert(gap.upper_id());
        let mut awaiting_successor: BTreeSet<u64> = BTreeSet::new();

        let mut cursor = first;
        let mut pages = 0usize;
        loop {
            while cursor <= last && covered.contains(&cursor) {
                cursor += 1;
            }
            if cursor > last {
                break;
            }

            let limit = (self.config.page_size as u64).min(last - cursor + 1) as usize;
            let page = match self.fetch_with_retry(collection, limit, cursor).await {
                Ok(page) => page,
                Err(e) => {
                    self.report_fetch_failure(collection, gap, &e);
                    outcome.aborted = true;
                    break;
                }
            };

            if page.is_empty() {
                if pages > 0 {
                    warn!(
                        collection = %collection,
                        after_trade_id = gap.after_trade_id,
                        cursor,
                        pages,
                        "empty page, stopping backfill early"
                    );
                } else {
                    debug!(collection = %collection, cursor, "no historical trades for gap");
                }
                break;
            }
            pages += 1;

            let page_last = page.iter().map(|t| t.trade_id).max().unwrap_or(cursor);
            let mut fresh = self.take_fresh(collection, page, cursor, last, &mut covered);
            for record in fresh.iter_mut() {
                record.checked = covered.contains(&(record.trade_id + 1));
            }

            if !fresh.is_empty() {
                let unproven: Vec<u64> = fresh
                    .iter()
                    .filter(|r| !r.checked)
                    .map(|r| r.trade_id)
                    .collect();
                let target = collection.clone();
                let inserted = self
                    .with_store(move |store| store.insert_many(&target, &fresh))
                    .await?;
                outcome.inserted += inserted.inserted;
                if inserted.duplicates > 0 {
                    debug!(
                        collection = %collection,
                        duplicates = inserted.duplicates,
                        "backfill raced existing writes"
                    );
                }
                awaiting_successor.extend(unproven);
            }

            let provable: BTreeSet<u64> = awaiting_successor
                .iter()
                .copied()
                .filter(|id| covered.contains(&(id + 1)))
                .collect();
            if !provable.is_empty() {
                awaiting_successor.retain(|id| !provable.contains(id));
                outcome.marked_checked += self.mark_checked(collection, provable).await?;
            }

            if page_last < cursor {
                break;
            }
            cursor = page_last + 1;
        }

        outcome.closed = (first..=last).all(|id| covered.contains(&id));
        if covered.contains(&first) {
            let lower = BTreeSet::from([gap.after_trade_id]);
            outcome.marked_checked += self.mark_checked(collection, lower).await?;
        }

        debug!(
            collection = %collection,
            after_trade_id = gap.after_trade_id,
            length = gap.length,
            pages,
            inserted = outcome.inserted,
            closed = outcome.closed,
            "gap processed"
        );
        Ok(outcome)
    }

    /// Run a store call on the blocking pool, like ingestion's writes.
    async fn with_store<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn TradeStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn mark_checked(
        &self,
        collection: &CollectionName,
        ids: BTreeSet<u64>,
    ) -> Result<usize, StoreError> {
        let collection = collection.clone();
        self.with_store(move |store| store.update_checked(&collection, &ids, true))
            .await
    }

    /// Records from `page` that fall inside `[cursor, last]` and are not yet
    /// stored. Accepted ids are added to `covered`.
    fn take_fresh(
        &self,
        collection: &CollectionName,
        page: Vec<RawTrade>,
        cursor: u64,
        last: u64,
        covered: &mut BTreeSet<u64>,
    ) -> Vec<TradeRecord> {
        let mut fresh = Vec::with_capacity(page.len());
        for raw in page {
            let trade_id = raw.trade_id;
            if trade_id < cursor || trade_id > last || covered.contains(&trade_id) {
                continue;
            }
            match TradeRecord::from_raw(raw, false) {
                Ok(record) => {
                    covered.insert(trade_id);
                    fresh.push(record);
                }
                Err(e) => {
                    warn!(
                        collection = %collection,
                        trade_id,
                        error = %e,
                        "unusable historical trade"
                    );
                }
            }
        }
        fresh
    }

    /// One retry after `rate_limit_cooldown` on a rate-limit fault.
    async fn fetch_with_retry(
        &self,
        collection: &CollectionName,
        limit: usize,
        from_id: u64,
    ) -> Result<Vec<RawTrade>, FetchError> {
        let instrument = collection.instrument();
        match self.source.fetch_trades(instrument, limit, from_id).await {
            Err(e) if e.is_rate_limited() => {
                self.notifier.warning(&format!(
                    "Rate limited fetching {} from {} ({}), retrying in {}s",
                    instrument,
                    from_id,
                    e,
                    self.config.rate_limit_cooldown.as_secs()
                ));
                tokio::time::sleep(self.config.rate_limit_cooldown).await;
                self.source.fetch_trades(instrument, limit, from_id).await
            }
            other => other,
        }
    }

    fn report_fetch_failure(&self, collection: &CollectionName, gap: &Gap, error: &FetchError) {
        let text = format!(
            "Backfill of {} after {} ({} missing) abandoned for this cycle: {}",
            collection, gap.after_trade_id, gap.length, error
        );
        if error.is_rate_limited() {
            self.notifier.warning(&text);
        } else {
            self.notifier.error(&text);
        }
    }

    fn report(&self, summary: &CycleSummary) {
        let text = format!(
            "Reconciliation: {} collections, {} unchecked scanned, {} gaps found, {} closed, {} trades backfilled, {} deferred ({:.1}s)",
            summary.collections.len(),
            summary.scanned(),
            summary.gaps_found(),
            summary.gaps_closed(),
            summary.backfilled(),
            summary.deferred(),
            summary.elapsed.as_secs_f64()
        );

        if summary.gaps_closed() > 0 || summary.backfilled() > 0 {
            self.notifier.info(&text);
        } else {
            self.notifier.notify(Severity::Debug, &text, true);
        }

        if summary.looks_stalled() {
            self.notifier
                .warning("No new trades since the last reconciliation, receiver appears stalled");
        }
    }
}
