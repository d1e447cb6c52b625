//! Inner (routing) node.
//!
//! Inner nodes hold separators and child pointers, never values. Keys are
//! kept in sorted physical order.
//!
//! # Routing Model
//!
//! ```text
//!            [K0 | K1 | K2]            <- INode, count = 3
//!          /     |    |    \
//!    leftmost   C0    C1    C2         <- children
//!
//!    leftmost: keys <= K0
//!    C0:       K0 < keys <= K1
//!    C1:       K1 < keys <= K2
//!    C2:       K2 < keys <= high_key
//! ```
//!
//! A separator is always the high key of the child on its left, which
//! matches the leaf fence rule: a node owns keys `<= high_key`.
//!
//! # Concurrency
//!
//! - **Readers** take the version, call [`INode::scan_node`], and validate.
//!   Counts are clamped to capacity and a null child means a concurrent
//!   shrink, so a torn read can only ever produce [`Restart`].
//! - **Writers** hold the node's write lock for every mutating method.

use std::fmt as StdFmt;
use std::marker::PhantomData;
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicPtr, AtomicU64};

use crate::error::{InvariantViolation, Restart, Status};
use crate::key::IndexKey;
use crate::node::{NodeBase, NodeKind, base_ref, into_raw};
use crate::ordering::{READ_ORD, WRITE_ORD};

/// One step of a traversal through an inner node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Hop<K> {
    /// The key is beyond this node's high key.
    Right(*mut NodeBase),
    /// Descend. Carries the separator left of the child, if any.
    Down(*mut NodeBase, Option<K>),
}

/// An inner node.
#[repr(C)]
pub struct INode<K> {
    base: NodeBase,
    leftmost: AtomicPtr<NodeBase>,
    keys: Box<[AtomicU64]>,
    children: Box<[AtomicPtr<NodeBase>]>,
    _marker: PhantomData<fn() -> K>,
}

impl<K: IndexKey> StdFmt::Debug for INode<K> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("INode")
            .field("base", &self.base)
            .field("leftmost", &self.leftmost.load(READ_ORD))
            .field("keys", &self.keys_snapshot())
            .finish_non_exhaustive()
    }
}

impl<K: IndexKey> INode<K> {
    /// An empty inner node at `level` (>= 1).
    pub(crate) fn new(cardinality: usize, level: u32) -> Self {
        debug_assert!(level >= 1, "inner nodes live above the leaves");

        Self {
            base: NodeBase::new(NodeKind::Inner, level),
            leftmost: AtomicPtr::new(StdPtr::null_mut()),
            keys: (0..cardinality).map(|_| AtomicU64::new(0)).collect(),
            children: (0..cardinality)
                .map(|_| AtomicPtr::new(StdPtr::null_mut()))
                .collect(),
            _marker: PhantomData,
        }
    }

    /// A root over a single split: `left <= key < right`.
    pub(crate) fn new_root(
        cardinality: usize,
        level: u32,
        left: *mut NodeBase,
        key: K,
        right: *mut NodeBase,
    ) -> Self {
        let node = Self::new(cardinality, level);
        node.leftmost.store(left, WRITE_ORD);
        node.set_entry(0, key, right);
        node.base.set_count(1);
        node
    }

    /// A node whose only child is `leftmost`. Filled by [`Self::batch_insert`].
    pub(crate) fn with_leftmost(cardinality: usize, level: u32, leftmost: *mut NodeBase) -> Self {
        let node = Self::new(cardinality, level);
        node.leftmost.store(leftmost, WRITE_ORD);
        node
    }

    #[inline(always)]
    pub(crate) const fn base(&self) -> &NodeBase {
        &self.base
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> usize {
        self.keys.len()
    }

    /// Separator count, clamped for optimistic readers.
    #[inline(always)]
    fn len(&self) -> usize {
        self.base.count().min(self.capacity())
    }

    #[inline(always)]
    fn key_at(&self, index: usize) -> K {
        K::from_word(self.keys[index].load(READ_ORD))
    }

    #[inline(always)]
    fn child_at(&self, index: usize) -> *mut NodeBase {
        self.children[index].load(READ_ORD)
    }

    #[inline(always)]
    fn set_entry(&self, index: usize, key: K, child: *mut NodeBase) {
        self.keys[index].store(key.to_word(), WRITE_ORD);
        self.children[index].store(child, WRITE_ORD);
    }

    fn keys_snapshot(&self) -> Vec<K> {
        (0..self.len()).map(|i| self.key_at(i)).collect()
    }

    /// Last position whose separator is below `key`.
    ///
    /// Linear below `threshold` separators, binary above.
    #[inline]
    pub(crate) fn find_lower_bound(&self, key: K, threshold: usize) -> Option<usize> {
        let count: usize = self.len();

        if count < threshold {
            return (0..count).take_while(|&i| self.key_at(i) < key).last();
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

        lo.checked_sub(1)
    }

    /// Route `key` one step. Unvalidated; the caller validates the version.
    pub(crate) fn scan_node(&self, key: K, threshold: usize) -> Result<Hop<K>, Restart> {
        if let Some(sibling) = self.base.move_right(key) {
            return Ok(Hop::Right(sibling));
        }

        let (child, low) = match self.find_lower_bound(key, threshold) {
            Some(i) => (self.child_at(i), Some(self.key_at(i))),
            None => (self.leftmost(), None),
        };

        if child.is_null() {
            return Err(Restart);
        }

        Ok(Hop::Down(child, low))
    }

    #[inline(always)]
    pub(crate) fn leftmost(&self) -> *mut NodeBase {
        self.leftmost.load(READ_ORD)
    }

    /// Smallest separator. Unvalidated.
    pub(crate) fn first_key(&self) -> Option<K> {
        (self.len() > 0).then(|| self.key_at(0))
    }

    /// Every child pointer in key order. Unvalidated.
    pub(crate) fn children(&self) -> Vec<*mut NodeBase> {
        std::iter::once(self.leftmost())
            .chain((0..self.len()).map(|i| self.child_at(i)))
            .collect()
    }

    /// `(separator, child)` pairs in key order, excluding the leftmost child.
    fn entries(&self) -> Vec<(K, *mut NodeBase)> {
        (0..self.len())
            .map(|i| (self.key_at(i), self.child_at(i)))
            .collect()
    }

    /// Rewrite the separators and null every slot past the new count.
    fn write_entries(&self, entries: &[(K, *mut NodeBase)]) {
        debug_assert!(entries.len() <= self.capacity());

        for (i, &(key, child)) in entries.iter().enumerate() {
            self.set_entry(i, key, child);
        }
        for slot in &self.children[entries.len()..] {
            slot.store(StdPtr::null_mut(), WRITE_ORD);
        }
        self.base.set_count(entries.len());
    }

    // ========================================================================
    //  Mutations (write lock held)
    // ========================================================================

    /// Insert a separator and its right child.
    ///
    /// [`Status::NeedSplit`] leaves the node untouched.
    pub(crate) fn insert(&self, key: K, child: *mut NodeBase) -> Status {
        let count: usize = self.len();
        if count == self.capacity() {
            return Status::NeedSplit;
        }

        let pos: usize = self.find_lower_bound(key, 0).map_or(0, |i| i + 1);
        for i in (pos..count).rev() {
            self.keys[i + 1].store(self.keys[i].load(READ_ORD), WRITE_ORD);
            self.children[i + 1].store(self.child_at(i), WRITE_ORD);
        }
        self.set_entry(pos, key, child);
        self.base.set_count(count + 1);
        Status::InsertSuccess
    }

    /// Split a full node in half.
    ///
    /// The middle separator moves up: it becomes this node's high key and
    /// its child becomes the new node's leftmost. Returns the new right
    /// node, already linked as this node's sibling, and the separator.
    pub(crate) fn split(&self) -> (*mut NodeBase, K) {
        let count: usize = self.len();
        let mid: usize = count / 2;
        let split_key: K = self.key_at(mid);

        let right = Self::with_leftmost(self.capacity(), self.base.level(), self.child_at(mid));
        let moved: Vec<(K, *mut NodeBase)> = (mid + 1..count)
            .map(|i| (self.key_at(i), self.child_at(i)))
            .collect();
        right.write_entries(&moved);
        right.base.inherit_fence(&self.base);
        let right_ptr: *mut NodeBase = into_raw(right);

        self.base.set_fence(right_ptr, Some(split_key));
        let kept: Vec<(K, *mut NodeBase)> = self.entries()[..mid].to_vec();
        self.write_entries(&kept);

        (right_ptr, split_key)
    }

    /// Insert many `(separator, child)` pairs, splitting as often as needed.
    ///
    /// `batch` must be ascending and disjoint from the existing separators.
    /// Children are spread evenly across this node and as many new right
    /// siblings as it takes; the new nodes come back with their separators,
    /// ready to be batch-inserted one level up. Empty if everything fit.
    pub(crate) fn batch_insert(&self, batch: &[(K, *mut NodeBase)]) -> Vec<(K, *mut NodeBase)> {
        let mut all: Vec<(K, *mut NodeBase)> = self.entries();
        all.extend_from_slice(batch);
        all.sort_unstable_by_key(|&(k, _)| k);

        let cap: usize = self.capacity();
        if all.len() <= cap {
            self.write_entries(&all);
            return Vec::new();
        }

        // Each node takes up to cap + 1 children, leftmost included.
        let children: usize = all.len() + 1;
        let nodes: usize = children.div_ceil(cap + 1);
        let share = |j: usize| children / nodes + usize::from(j < children % nodes);

        let mut pos: usize = share(0) - 1;
        let kept: Vec<(K, *mut NodeBase)> = all[..pos].to_vec();

        let mut created: Vec<(K, *mut NodeBase)> = Vec::with_capacity(nodes - 1);
        for j in 1..nodes {
            let (separator, leftmost) = all[pos];
            let take: usize = share(j) - 1;
            let node = Self::with_leftmost(cap, self.base.level(), leftmost);
            node.write_entries(&all[pos + 1..pos + 1 + take]);
            pos += 1 + take;
            created.push((separator, into_raw(node)));
        }

        // Chain right to left so every fence is in place before publication.
        for j in (0..created.len()).rev() {
            // SAFETY: allocated above, not yet reachable.
            let node: &NodeBase = unsafe { base_ref(created[j].1) };
            match created.get(j + 1) {
                Some(&(high_key, next)) => node.set_fence(next, Some(high_key)),
                None => node.inherit_fence(&self.base),
            }
        }

        self.write_entries(&kept);
        self.base.set_fence(created[0].1, Some(created[0].0));

        created
    }

    /// Replace `old_child` by the first of `leaves` and insert the rest.
    ///
    /// `separators[i]` is the high key of `leaves[i]`. Returns `None`
    /// without modifying anything if `old_child` is not in this node.
    pub(crate) fn batch_insert_last_level(
        &self,
        old_child: *mut NodeBase,
        leaves: &[*mut NodeBase],
        separators: &[K],
    ) -> Option<Vec<(K, *mut NodeBase)>> {
        debug_assert_eq!(leaves.len(), separators.len() + 1);

        let first: *mut NodeBase = *leaves.first()?;
        if self.leftmost.load(READ_ORD) == old_child {
            self.leftmost.store(first, WRITE_ORD);
        } else {
            let slot: usize = (0..self.len()).find(|&i| self.child_at(i) == old_child)?;
            self.children[slot].store(first, WRITE_ORD);
        }

        let batch: Vec<(K, *mut NodeBase)> = separators
            .iter()
            .copied()
            .zip(leaves[1..].iter().copied())
            .collect();
        Some(self.batch_insert(&batch))
    }

    // ========================================================================
    //  Diagnostics
    // ========================================================================

    /// Local invariants: count, ordering, high key, child levels.
    pub(crate) fn sanity_check(&self) -> Result<(), InvariantViolation> {
        let level: u32 = self.base.level();
        let count: usize = self.base.count();

        if count > self.capacity() {
            return Err(InvariantViolation::CountOverflow {
                level,
                count,
                capacity: self.capacity(),
            });
        }

        let keys: Vec<K> = self.keys_snapshot();
        if let Some(index) = (1..keys.len()).find(|&i| keys[i - 1] >= keys[i]) {
            return Err(InvariantViolation::KeyOrder { level, index });
        }

        if let (Some(high_key), Some(&last)) = (self.base.high_key::<K>(), keys.last()) {
            if last > high_key {
                return Err(InvariantViolation::HighKeyBound {
                    level,
                    key: format!("{last:?}"),
                    high_key: format!("{high_key:?}"),
                });
            }
        }

        for child in self.children() {
            if child.is_null() {
                return Err(InvariantViolation::LevelMismatch { parent: level, child: 0 });
            }

            // SAFETY: children of a reachable node are live.
            let child_level: u32 = unsafe { base_ref(child) }.level();
            if child_level + 1 != level {
                return Err(InvariantViolation::LevelMismatch {
                    parent: level,
                    child: child_level,
                });
            }
        }

        Ok(())
    }
}
