//! Reconciliation Engine
//!
//! Periodic background pass over every trade collection:
//! - Diff adjacent unchecked ids; unit steps are marked `checked`
//! - Each gap is backfilled from the historical source, page by page
//! - Rate limits get one retry after a cooldown; other faults abandon the gap
//! - A summary is reported every cycle, including quiet ones

pub mod engine;
pub mod gaps;

pub use engine::{CollectionReport, CycleSummary, ReconcileEngine};
pub use gaps::{scan_ids, Gap, GapScan};
