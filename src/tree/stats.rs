//! Per-tree operation counters.

use std::sync::atomic::AtomicU64;

use crate::ordering::RELAXED;

/// Snapshot of a tree's structural activity.
///
/// Counters are relaxed and only roughly consistent with each other while
/// writers are running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Operations restarted from the root after a failed validation.
    pub restarts: u64,
    /// Leaf splits, both layouts.
    pub leaf_splits: u64,
    /// The subset of `leaf_splits` that split a hash leaf.
    pub hash_leaf_splits: u64,
    /// Inner node splits, including every extra node of a batch split.
    pub inner_splits: u64,
    /// New roots installed.
    pub root_growths: u64,
    /// Hash leaves rebuilt as sorted leaves.
    pub conversions: u64,
    /// Nodes freed (or quarantined) by epoch reclamation.
    pub reclaimed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    restarts: AtomicU64,
    leaf_splits: AtomicU64,
    hash_leaf_splits: AtomicU64,
    inner_splits: AtomicU64,
    root_growths: AtomicU64,
    conversions: AtomicU64,
}

impl StatsCounters {
    #[inline(always)]
    pub(crate) fn restart(&self) {
        self.restarts.fetch_add(1, RELAXED);
    }

    #[inline(always)]
    pub(crate) fn leaf_split(&self, hashed: bool) {
        self.leaf_splits.fetch_add(1, RELAXED);
        if hashed {
            self.hash_leaf_splits.fetch_add(1, RELAXED);
        }
    }

    #[inline(always)]
    pub(crate) fn inner_splits(&self, n: usize) {
        self.inner_splits.fetch_add(n as u64, RELAXED);
    }

    #[inline(always)]
    pub(crate) fn root_growth(&self) {
        self.root_growths.fetch_add(1, RELAXED);
    }

    #[inline(always)]
    pub(crate) fn conversion(&self) {
        self.conversions.fetch_add(1, RELAXED);
    }

    pub(crate) fn snapshot(&self, reclaimed: u64) -> TreeStats {
        TreeStats {
            restarts: self.restarts.load(RELAXED),
            leaf_splits: self.leaf_splits.load(RELAXED),
            hash_leaf_splits: self.hash_leaf_splits.load(RELAXED),
            inner_splits: self.inner_splits.load(RELAXED),
            root_growths: self.root_growths.load(RELAXED),
            conversions: self.conversions.load(RELAXED),
            reclaimed,
        }
    }
}
