//! Sequence-gap detection over stored trade ids.

use std::collections::BTreeSet;

/// Run of missing ids strictly between two observed ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Gap {
    /// Lower observed id; the first missing id is `after_trade_id + 1`.
    pub after_trade_id: u64,
    pub length: u64,
}

impl Gap {
    pub fn first_missing(&self) -> u64 {
        self.after_trade_id + 1
    }

    pub fn last_missing(&self) -> u64 {
        self.after_trade_id + self.length
    }

    /// Observed id that bounds the gap from above.
    pub fn upper_id(&self) -> u64 {
        self.after_trade_id + self.length + 1
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GapScan {
    /// Ids whose successor is present; markable `checked` right away.
    pub contiguous: BTreeSet<u64>,
    /// Ascending by `after_trade_id`.
    pub gaps: Vec<Gap>,
}

/// Diff adjacent ids. Input may be unsorted or contain duplicates.
pub fn scan_ids(ids: &[u64]) -> GapScan {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut scan = GapScan::default();
    for window in sorted.windows(2) {
        let (lower, upper) = (window[0], window[1]);
        if upper == lower + 1 {
            scan.contiguous.insert(lower);
        } else {
            scan.gaps.push(Gap {
                after_trade_id: lower,
                length: upper - lower - 1,
            });
        }
    }
    scan
}
