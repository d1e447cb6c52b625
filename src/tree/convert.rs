//! Hash leaf to sorted leaf conversion.
//!
//! Replacing a leaf means rewriting both pointers that lead to it: the left
//! neighbour's sibling and the parent's child slot. Locks are taken left to
//! right and bottom-up, like everywhere else:
//!
//! ```text
//!   lock L (walk right until L.sibling == H) ──► upgrade H
//!        ──► build sorted leaves ──► L.sibling = first leaf
//!        ──► lock parent, swap child slot ──► unlock H obsolete, retire
//! ```

use crate::epoch::{EpochGuard, Retired, ThreadInfo};
use crate::error::Restart;
use crate::key::{IndexKey, IndexValue};
use crate::leaf::LeafRef;
use crate::leaf::hash::{Converted, LNodeHash};
use crate::node::{NodeBase, base_ref, inner_ref, reclaim_node};
use crate::nodeversion::LockGuard;
use crate::ordering::{READ_ORD, WRITE_ORD};
use crate::tracing_helpers::debug_log;

use super::Tree;
use super::traverse::Descent;

impl<K: IndexKey, V: IndexValue> Tree<K, V> {
    /// Rebuild the hash leaf covering `key` as sorted leaves.
    ///
    /// Returns false if that leaf is already sorted.
    ///
    /// # Panics
    ///
    /// If `ti` was registered with another tree.
    pub fn convert(&self, key: K, ti: &ThreadInfo<'_>) -> bool {
        self.check_thread(ti);
        let guard = EpochGuard::new(ti);
        self.convert_with_guard(key, &guard)
    }

    pub(super) fn convert_with_guard(&self, key: K, guard: &EpochGuard<'_, '_>) -> bool {
        self.retry(|| {
            let descent: Descent<'_, K, V> = self.descend(key)?;
            match descent.leaf {
                LeafRef::Hashed(hash) => self.convert_leaf(key, descent, hash, guard).map(|()| true),
                LeafRef::Sorted(_) => Ok(false),
            }
        })
    }

    fn convert_leaf(
        &self,
        key: K,
        descent: Descent<'_, K, V>,
        hash: &LNodeHash<K, V>,
        guard: &EpochGuard<'_, '_>,
    ) -> Result<(), Restart> {
        let target: *mut NodeBase = descent.ptr;

        let left: Option<(*mut NodeBase, LockGuard<'_>)> = match descent.low {
            Some(low) => Some(self.lock_left_neighbour(low, target)?),
            None => None,
        };

        let lock: LockGuard<'_> = hash.base().version().try_upgrade_write_lock(descent.version)?;
        let converted: Converted<K> = hash.convert(&lock, &self.config)?;

        // Past this point the conversion always completes.
        if let Some((left, _)) = &left {
            // SAFETY: locked by us.
            let base: &NodeBase = unsafe { base_ref(*left) };
            base.set_fence(converted.leaves[0], base.high_key::<K>());
        }

        self.replace_child(key, descent.parents, target, &converted, lock);

        // SAFETY: unlinked above and obsolete; reclaimed after the grace period.
        guard.retire(unsafe { Retired::new(target, reclaim_node::<K, V>) });

        self.stats.conversion();
        debug_log!(leaves = converted.leaves.len(), "converted hash leaf");
        drop(left);
        Ok(())
    }

    /// Lock the leaf whose sibling is `target`, starting from the leaf
    /// covering `low` (the target's low fence).
    fn lock_left_neighbour(
        &self,
        low: K,
        target: *mut NodeBase,
    ) -> Result<(*mut NodeBase, LockGuard<'_>), Restart> {
        let start: *mut NodeBase = self.descend_to_level(low, 0)?;
        let (mut ptr, mut lock) = self.lock_covering(start, low)?;

        loop {
            // SAFETY: locked by us.
            let sibling: *mut NodeBase = unsafe { base_ref(ptr) }.sibling();

            if sibling == target {
                return Ok((ptr, lock));
            }

            if sibling.is_null() || ptr == target {
                return Err(Restart);
            }

            // SAFETY: reachable from a locked node.
            let next_lock: LockGuard<'_> =
                unsafe { base_ref(sibling) }.version().write_lock(self.config.spin)?;
            drop(lock);
            ptr = sibling;
            lock = next_lock;
        }
    }

    /// Point the parent of `target` at the converted leaves.
    ///
    /// Consumes the target's lock and leaves it obsolete.
    fn replace_child(
        &self,
        key: K,
        mut parents: Vec<*mut NodeBase>,
        target: *mut NodeBase,
        converted: &Converted<K>,
        lock: LockGuard<'_>,
    ) {
        let leaves: &[*mut NodeBase] = &converted.leaves;
        let separators: &[K] = &converted.separators;
        let mut attempt: u32 = 0;

        loop {
            let parent: *mut NodeBase = match parents.pop() {
                Some(parent) => parent,

                None if self.root.load(READ_ORD) == target => {
                    let batch: Vec<(K, *mut NodeBase)> = separators
                        .iter()
                        .copied()
                        .zip(leaves[1..].iter().copied())
                        .collect();

                    if batch.is_empty() {
                        self.root.store(leaves[0], WRITE_ORD);
                    } else {
                        self.grow_root(leaves[0], 1, batch);
                    }
                    lock.unlock_obsolete();
                    return;
                }

                None => match self.descend_to_level(key, 1) {
                    Ok(parent) => parent,
                    Err(_) => {
                        // A root growth above `target` is still in flight.
                        self.stats.restart();
                        self.config.spin.wait(attempt);
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                },
            };

            let Ok((parent, parent_lock)) = self.lock_covering(parent, key) else {
                continue;
            };

            // SAFETY: level-1 node, locked by us.
            let inner = unsafe { inner_ref::<K>(parent) };
            match inner.batch_insert_last_level(target, leaves, separators) {
                Some(created) => {
                    lock.unlock_obsolete();
                    if !created.is_empty() {
                        self.stats.inner_splits(created.len());
                    }
                    self.propagate(parents, parent, parent_lock, created);
                    return;
                }
                None => {
                    drop(parent_lock);
                    parents.clear();
                }
            }
        }
    }
}
