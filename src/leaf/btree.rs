//! Sorted array leaf.
//!
//! Entries sit in ascending key order in `0..count`. Every mutation runs
//! under the node's write lock, upgraded from the version the traversal
//! read, so a successful upgrade also proves the key still belongs here.

use std::fmt as StdFmt;
use std::marker::PhantomData;
use std::ops::Bound;
use std::sync::atomic::AtomicU64;

use crate::config::TreeConfig;
use crate::error::{InvariantViolation, Restart, Status};
use crate::key::{IndexKey, IndexValue};
use crate::leaf::{LeafInsert, LeafSplit, Placed, ScanOutcome, in_range};
use crate::node::{NodeBase, NodeKind, into_raw};
use crate::nodeversion::LockGuard;
use crate::ordering::{READ_ORD, WRITE_ORD};

/// A sorted leaf.
#[repr(C)]
pub struct LNodeBTree<K, V> {
    base: NodeBase,
    keys: Box<[AtomicU64]>,
    values: Box<[AtomicU64]>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: IndexKey, V: IndexValue> StdFmt::Debug for LNodeBTree<K, V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("LNodeBTree")
            .field("base", &self.base)
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

impl<K: IndexKey, V: IndexValue> LNodeBTree<K, V> {
    pub(crate) fn new(cardinality: usize) -> Self {
        Self {
            base: NodeBase::new(NodeKind::SortedLeaf, 0),
            keys: (0..cardinality).map(|_| AtomicU64::new(0)).collect(),
            values: (0..cardinality).map(|_| AtomicU64::new(0)).collect(),
            _marker: PhantomData,
        }
    }

    /// A leaf pre-filled with ascending `entries`.
    pub(crate) fn from_sorted(cardinality: usize, entries: &[(K, V)]) -> Self {
        debug_assert!(entries.len() <= cardinality);

        let leaf = Self::new(cardinality);
        for (i, &(key, value)) in entries.iter().enumerate() {
            leaf.set_entry(i, key, value);
        }
        leaf.base.set_count(entries.len());
        leaf
    }

    #[inline(always)]
    pub(crate) const fn base(&self) -> &NodeBase {
        &self.base
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> usize {
        self.keys.len()
    }

    /// Entry count, clamped for optimistic readers.
    #[inline(always)]
    fn len(&self) -> usize {
        self.base.count().min(self.capacity())
    }

    #[inline(always)]
    fn key_at(&self, index: usize) -> K {
        K::from_word(self.keys[index].load(READ_ORD))
    }

    #[inline(always)]
    fn value_at(&self, index: usize) -> V {
        V::from_word(self.values[index].load(READ_ORD))
    }

    #[inline(always)]
    fn set_entry(&self, index: usize, key: K, value: V) {
        self.keys[index].store(key.to_word(), WRITE_ORD);
        self.values[index].store(value.to_word(), WRITE_ORD);
    }

    /// First position with `key_at(pos) >= key`, and whether it is equal.
    fn search(&self, key: K, count: usize, threshold: usize) -> (usize, bool) {
        if count < threshold {
            let pos: usize = (0..count)
                .find(|&i| self.key_at(i) >= key)
                .unwrap_or(count);
            return (pos, pos < count && self.key_at(pos) == key);
        }

        let (mut lo, mut hi) = (0usize, count);
        while lo < hi {
            let mid: usize = lo + (hi - lo) / 2;
            if self.key_at(mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        (lo, lo < count && self.key_at(lo) == key)
    }

    /// Shift `pos..count` right by one and store the entry at `pos`.
    fn insert_at(&self, pos: usize, key: K, value: V, count: usize) {
        for i in (pos..count).rev() {
            self.keys[i + 1].store(self.keys[i].load(READ_ORD), WRITE_ORD);
            self.values[i + 1].store(self.values[i].load(READ_ORD), WRITE_ORD);
        }
        self.set_entry(pos, key, value);
        self.base.set_count(count + 1);
    }

    // ========================================================================
    //  Point Operations
    // ========================================================================

    /// Upsert `key`.
    ///
    /// Returns [`LeafInsert::NeedSplit`] with the lock still held when the
    /// key is new and the leaf is full.
    pub(crate) fn insert(
        &self,
        key: K,
        value: V,
        version: u64,
        cfg: &TreeConfig,
    ) -> Result<LeafInsert<'_, V>, Restart> {
        let guard: LockGuard<'_> = self.base.version().try_upgrade_write_lock(version)?;
        let count: usize = self.len();
        let (pos, found) = self.search(key, count, cfg.binary_search_threshold);

        if found {
            let old: V = self.value_at(pos);
            self.values[pos].store(value.to_word(), WRITE_ORD);
            return Ok(LeafInsert::Replaced(old));
        }

        if count == self.capacity() {
            return Ok(LeafInsert::NeedSplit(guard));
        }

        self.insert_at(pos, key, value, count);
        Ok(LeafInsert::Inserted)
    }

    /// Split a full leaf and place the pending entry.
    ///
    /// The pending key takes part in choosing the midpoint, so both halves
    /// end with room to spare. The left half keeps keys `<= split_key`.
    pub(crate) fn split<'g>(
        &'g self,
        guard: LockGuard<'g>,
        key: K,
        value: V,
        cfg: &TreeConfig,
    ) -> (LeafSplit<K, V>, LockGuard<'g>) {
        let count: usize = self.len();
        let (pos, _) = self.search(key, count, cfg.binary_search_threshold);

        let mut merged: Vec<(K, V)> = Vec::with_capacity(count + 1);
        merged.extend((0..pos).map(|i| (self.key_at(i), self.value_at(i))));
        merged.push((key, value));
        merged.extend((pos..count).map(|i| (self.key_at(i), self.value_at(i))));

        let half: usize = merged.len() / 2;
        let split_key: K = merged[half - 1].0;

        let right = Self::from_sorted(self.capacity(), &merged[half..]);
        right.base.inherit_fence(&self.base);
        let right_ptr = into_raw(right);

        for (i, &(k, v)) in merged[..half].iter().enumerate() {
            self.set_entry(i, k, v);
        }
        self.base.set_count(half);
        self.base.set_fence(right_ptr, Some(split_key));

        let split = LeafSplit {
            right: right_ptr,
            split_key,
            placed: Placed::Inserted,
        };
        (split, guard)
    }

    /// Replace the value of an existing key.
    pub(crate) fn update(
        &self,
        key: K,
        value: V,
        version: u64,
        cfg: &TreeConfig,
    ) -> Result<Status, Restart> {
        let _guard: LockGuard<'_> = self.base.version().try_upgrade_write_lock(version)?;
        let (pos, found) = self.search(key, self.len(), cfg.binary_search_threshold);

        if !found {
            return Ok(Status::KeyNotFound);
        }

        self.values[pos].store(value.to_word(), WRITE_ORD);
        Ok(Status::UpdateSuccess)
    }

    /// Remove a key, closing the gap.
    pub(crate) fn remove(&self, key: K, version: u64, cfg: &TreeConfig) -> Result<Status, Restart> {
        let _guard: LockGuard<'_> = self.base.version().try_upgrade_write_lock(version)?;
        let count: usize = self.len();
        let (pos, found) = self.search(key, count, cfg.binary_search_threshold);

        if !found {
            return Ok(Status::KeyNotFound);
        }

        for i in pos + 1..count {
            self.keys[i - 1].store(self.keys[i].load(READ_ORD), WRITE_ORD);
            self.values[i - 1].store(self.values[i].load(READ_ORD), WRITE_ORD);
        }
        self.base.set_count(count - 1);

        Ok(Status::RemoveSuccess)
    }

    /// Lock-free point lookup.
    pub(crate) fn find(&self, key: K, version: u64, cfg: &TreeConfig) -> Result<Option<V>, Restart> {
        let (pos, found) = self.search(key, self.len(), cfg.binary_search_threshold);
        let value: Option<V> = found.then(|| self.value_at(pos));

        self.base.version().validate(version)?;
        Ok(value)
    }

    /// Append up to `limit` entries at or after `from` to `out`.
    ///
    /// Entries are only appended after the read validated.
    pub(crate) fn range_lookup(
        &self,
        from: Bound<K>,
        limit: usize,
        version: u64,
        cfg: &TreeConfig,
        out: &mut Vec<(K, V)>,
    ) -> Result<ScanOutcome<K>, Restart> {
        let count: usize = self.len();
        let start: usize = match from {
            Bound::Unbounded => 0,
            Bound::Included(k) => self.search(k, count, cfg.binary_search_threshold).0,
            Bound::Excluded(k) => {
                let (pos, found) = self.search(k, count, cfg.binary_search_threshold);
                pos + usize::from(found)
            }
        };

        let end: usize = count.min(start.saturating_add(limit));
        let found: Vec<(K, V)> = (start..end)
            .map(|i| (self.key_at(i), self.value_at(i)))
            .filter(|&(k, _)| in_range(k, from))
            .collect();

        let outcome = ScanOutcome {
            high_key: self.base.high_key(),
            sibling: self.base.sibling(),
            status: None,
        };

        self.base.version().validate(version)?;
        out.extend(found);
        Ok(outcome)
    }

    // ========================================================================
    //  Diagnostics
    // ========================================================================

    /// Unsynchronized snapshot of the entries.
    pub(crate) fn entries(&self) -> Vec<(K, V)> {
        (0..self.len())
            .map(|i| (self.key_at(i), self.value_at(i)))
            .collect()
    }

    #[expect(clippy::cast_precision_loss, reason = "ratio of small counts")]
    pub(crate) fn utilization(&self) -> f64 {
        self.len() as f64 / self.capacity() as f64
    }

    pub(crate) fn sanity_check(&self) -> Result<(), InvariantViolation> {
        let count: usize = self.base.count();
        if count > self.capacity() {
            return Err(InvariantViolation::CountOverflow {
                level: 0,
                count,
                capacity: self.capacity(),
            });
        }

        for i in 1..count {
            if self.key_at(i - 1) >= self.key_at(i) {
                return Err(InvariantViolation::KeyOrder { level: 0, index: i });
            }
        }

        if let (Some(high_key), Some(last)) = (self.base.high_key::<K>(), count.checked_sub(1)) {
            let key: K = self.key_at(last);
            if key > high_key {
                return Err(InvariantViolation::HighKeyBound {
                    level: 0,
                    key: format!("{key:?}"),
                    high_key: format!("{high_key:?}"),
                });
            }
        }

        Ok(())
    }
}
