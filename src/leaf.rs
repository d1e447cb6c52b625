//! Leaf nodes.
//!
//! Two layouts share level 0 of the tree:
//!
//! - [`btree::LNodeBTree`]: a sorted array, locked as a whole.
//! - [`hash::LNodeHash`]: hash buckets with per-bucket locks.
//!
//! [`LeafRef`] dispatches over both so the tree never matches on layout
//! outside this module.

use std::ops::Bound;

use crate::config::TreeConfig;
use crate::error::{InvariantViolation, Restart, Status};
use crate::key::{IndexKey, IndexValue};
use crate::node::NodeBase;
use crate::nodeversion::LockGuard;

pub mod btree;
pub mod bucket;
pub mod hash;

use btree::LNodeBTree;
use hash::LNodeHash;

/// True if `key` lies at or after the scan start.
#[inline(always)]
pub(crate) fn in_range<K: Ord>(key: K, from: Bound<K>) -> bool {
    match from {
        Bound::Unbounded => true,
        Bound::Included(start) => key >= start,
        Bound::Excluded(start) => key > start,
    }
}

/// Result of a leaf-level insert.
#[must_use]
pub(crate) enum LeafInsert<'g, V> {
    /// New key stored.
    Inserted,
    /// Existing key; its old value.
    Replaced(V),
    /// No room. The node's write lock is held by the guard.
    NeedSplit(LockGuard<'g>),
}

/// What a split did with the entry that triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placed<V> {
    /// Stored as a new key.
    Inserted,
    /// The key had reappeared before the node lock was taken; its old value.
    Replaced(V),
    /// Its candidate buckets stayed full; retry from the root.
    Deferred,
}

/// A finished leaf split.
#[derive(Debug)]
pub(crate) struct LeafSplit<K, V> {
    /// New right sibling, already linked from the left node.
    pub(crate) right: *mut NodeBase,
    /// High key of the left node; separator for the parent.
    pub(crate) split_key: K,
    pub(crate) placed: Placed<V>,
}

/// Where a range scan continues after one leaf.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScanOutcome<K> {
    pub(crate) high_key: Option<K>,
    pub(crate) sibling: *mut NodeBase,
    /// [`Status::NeedConvert`] when a hash leaf asks to become sorted leaves.
    pub(crate) status: Option<Status>,
}

/// A leaf of either layout.
pub(crate) enum LeafRef<'g, K: IndexKey, V: IndexValue> {
    Sorted(&'g LNodeBTree<K, V>),
    Hashed(&'g LNodeHash<K, V>),
}

impl<K: IndexKey, V: IndexValue> Clone for LeafRef<'_, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: IndexKey, V: IndexValue> Copy for LeafRef<'_, K, V> {}

impl<'g, K: IndexKey, V: IndexValue> LeafRef<'g, K, V> {
    #[inline(always)]
    pub(crate) const fn base(self) -> &'g NodeBase {
        match self {
            Self::Sorted(leaf) => leaf.base(),
            Self::Hashed(leaf) => leaf.base(),
        }
    }

    #[inline(always)]
    pub(crate) const fn is_hashed(self) -> bool {
        matches!(self, Self::Hashed(_))
    }

    pub(crate) fn find(self, key: K, version: u64, cfg: &TreeConfig) -> Result<Option<V>, Restart> {
        match self {
            Self::Sorted(leaf) => leaf.find(key, version, cfg),
            Self::Hashed(leaf) => leaf.find(key, version, cfg),
        }
    }

    pub(crate) fn insert(
        self,
        key: K,
        value: V,
        version: u64,
        cfg: &TreeConfig,
    ) -> Result<LeafInsert<'g, V>, Restart> {
        match self {
            Self::Sorted(leaf) => leaf.insert(key, value, version, cfg),
            Self::Hashed(leaf) => leaf.insert(key, value, version, cfg),
        }
    }

    /// Split under `guard`, placing the pending entry if it fits.
    pub(crate) fn split(
        self,
        guard: LockGuard<'g>,
        key: K,
        value: V,
        cfg: &TreeConfig,
    ) -> Result<(LeafSplit<K, V>, LockGuard<'g>), Restart> {
        match self {
            Self::Sorted(leaf) => Ok(leaf.split(guard, key, value, cfg)),
            Self::Hashed(leaf) => leaf.split(guard, key, value, cfg),
        }
    }

    pub(crate) fn update(
        self,
        key: K,
        value: V,
        version: u64,
        cfg: &TreeConfig,
    ) -> Result<Status, Restart> {
        match self {
            Self::Sorted(leaf) => leaf.update(key, value, version, cfg),
            Self::Hashed(leaf) => leaf.update(key, value, version, cfg),
        }
    }

    pub(crate) fn remove(self, key: K, version: u64, cfg: &TreeConfig) -> Result<Status, Restart> {
        match self {
            Self::Sorted(leaf) => leaf.remove(key, version, cfg),
            Self::Hashed(leaf) => leaf.remove(key, version, cfg),
        }
    }

    pub(crate) fn range_lookup(
        self,
        from: Bound<K>,
        limit: usize,
        version: u64,
        cfg: &TreeConfig,
        out: &mut Vec<(K, V)>,
    ) -> Result<ScanOutcome<K>, Restart> {
        match self {
            Self::Sorted(leaf) => leaf.range_lookup(from, limit, version, cfg, out),
            Self::Hashed(leaf) => leaf.range_lookup(from, limit, version, cfg, out),
        }
    }

    /// Unsynchronized entries in key order.
    pub(crate) fn entries(self) -> Vec<(K, V)> {
        match self {
            Self::Sorted(leaf) => leaf.entries(),
            Self::Hashed(leaf) => {
                let mut entries: Vec<(K, V)> = leaf.entries();
                entries.sort_unstable_by_key(|&(k, _)| k);
                entries
            }
        }
    }

    pub(crate) fn utilization(self) -> f64 {
        match self {
            Self::Sorted(leaf) => leaf.utilization(),
            Self::Hashed(leaf) => leaf.utilization(),
        }
    }

    pub(crate) fn sanity_check(self, cfg: &TreeConfig) -> Result<(), InvariantViolation> {
        match self {
            Self::Sorted(leaf) => leaf.sanity_check(),
            Self::Hashed(leaf) => leaf.sanity_check(cfg),
        }
    }
}
