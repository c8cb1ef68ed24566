use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of B-tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeStatsSnapshot {
    /// Root-to-leaf descents.
    pub searches: u64,
    /// Nodes split because their cells no longer fit one page.
    pub splits: u64,
    /// Root splits, each adding one level to a tree.
    pub root_splits: u64,
    /// Sibling windows redistributed into fewer pages.
    pub merges: u64,
    /// Roots collapsed into their only child.
    pub root_collapses: u64,
}

/// Thread-safe statistics tracking for B-tree operations.
#[derive(Default)]
pub struct BTreeStats {
    searches: AtomicU64,
    splits: AtomicU64,
    root_splits: AtomicU64,
    merges: AtomicU64,
    root_collapses: AtomicU64,
}

impl BTreeStats {
    pub(crate) fn inc_searches(&self) {
        self.searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_splits(&self, by: u64) {
        self.splits.fetch_add(by, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_splits(&self) {
        self.root_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_merges(&self, by: u64) {
        self.merges.fetch_add(by, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_collapses(&self) {
        self.root_collapses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        BTreeStatsSnapshot {
            searches: self.searches.load(AtomicOrdering::Relaxed),
            splits: self.splits.load(AtomicOrdering::Relaxed),
            root_splits: self.root_splits.load(AtomicOrdering::Relaxed),
            merges: self.merges.load(AtomicOrdering::Relaxed),
            root_collapses: self.root_collapses.load(AtomicOrdering::Relaxed),
        }
    }
}

impl fmt::Debug for BTreeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.snapshot().fmt(f)
    }
}

impl fmt::Display for BTreeStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "searches={} splits={} root_splits={} merges={} root_collapses={}",
            self.searches, self.splits, self.root_splits, self.merges, self.root_collapses
        )
    }
}
