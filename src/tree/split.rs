//! Split propagation and root growth.
//!
//! A split publishes new right siblings at one level and then has to make
//! them reachable from the level above. Propagation runs bottom-up with lock
//! coupling: the child stays locked until its parent is locked, so the
//! parent can never be asked for a separator out of order.
//!
//! ```text
//!   child locked ──► lock parent (move right) ──► unlock child
//!                          │
//!                 insert / batch insert
//!                          │
//!              overflow? ──┴──► parent becomes the child, repeat
//! ```

use crate::error::Status;
use crate::internode::INode;
use crate::key::{IndexKey, IndexValue};
use crate::node::{NodeBase, base_ref, inner_ref, into_raw};
use crate::nodeversion::LockGuard;
use crate::ordering::{READ_ORD, WRITE_ORD};
use crate::tracing_helpers::debug_log;

use super::Tree;

impl<K: IndexKey, V: IndexValue> Tree<K, V> {
    /// Make `batch` reachable one level above `child`.
    ///
    /// `batch` holds `(separator, node)` pairs for new right siblings of
    /// `child` at `child`'s level, ascending. `child_lock` must be the
    /// write lock on `child`; it is released once the parent is locked.
    /// Never fails: a stale parent hint falls back to a search from the root.
    pub(super) fn propagate<'a>(
        &'a self,
        mut parents: Vec<*mut NodeBase>,
        mut child: *mut NodeBase,
        mut child_lock: LockGuard<'a>,
        mut batch: Vec<(K, *mut NodeBase)>,
    ) {
        let mut attempt: u32 = 0;

        while !batch.is_empty() {
            // SAFETY: `child` is locked by us.
            let level: u32 = unsafe { base_ref(child) }.level() + 1;
            let key: K = batch[0].0;

            let parent: *mut NodeBase = match parents.pop() {
                Some(parent) => parent,

                None if self.root.load(READ_ORD) == child => {
                    self.grow_root(child, level, batch);
                    drop(child_lock);
                    return;
                }

                None => match self.descend_to_level(key, level) {
                    Ok(parent) => parent,
                    Err(_) => {
                        // The root above `child` is still being installed.
                        self.stats.restart();
                        self.config.spin.wait(attempt);
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                },
            };

            let Ok((parent, parent_lock)) = self.lock_covering(parent, key) else {
                parents.clear();
                continue;
            };
            drop(child_lock);

            // SAFETY: parent of a node at `level - 1`, locked by us.
            let inner: &INode<K> = unsafe { inner_ref(parent) };
            batch = if let [(separator, node)] = batch[..] {
                self.insert_one(inner, separator, node)
            } else {
                self.insert_many(inner, &batch)
            };

            child = parent;
            child_lock = parent_lock;
        }
    }

    /// Insert one separator, splitting `inner` if it is full.
    fn insert_one(
        &self,
        inner: &INode<K>,
        separator: K,
        node: *mut NodeBase,
    ) -> Vec<(K, *mut NodeBase)> {
        if inner.insert(separator, node) == Status::InsertSuccess {
            return Vec::new();
        }

        let (right, split_key) = inner.split();
        let target: &INode<K> = if separator <= split_key {
            inner
        } else {
            // SAFETY: just created, only reachable through the locked node.
            unsafe { inner_ref(right) }
        };

        let _status: Status = target.insert(separator, node);
        debug_assert_eq!(_status, Status::InsertSuccess);

        self.stats.inner_splits(1);
        debug_log!(level = inner.base().level(), ?split_key, "inner split");

        vec![(split_key, right)]
    }

    fn insert_many(
        &self,
        inner: &INode<K>,
        batch: &[(K, *mut NodeBase)],
    ) -> Vec<(K, *mut NodeBase)> {
        let created: Vec<(K, *mut NodeBase)> = inner.batch_insert(batch);

        if !created.is_empty() {
            self.stats.inner_splits(created.len());
            debug_log!(
                level = inner.base().level(),
                entries = batch.len(),
                nodes = created.len() + 1,
                "inner batch split"
            );
        }

        created
    }

    /// Install new root levels above `old_root`.
    ///
    /// Only the holder of the old root's write lock calls this, so the
    /// root pointer cannot change underneath.
    pub(super) fn grow_root(&self, old_root: *mut NodeBase, mut level: u32, mut batch: Vec<(K, *mut NodeBase)>) {
        let card: usize = self.config.inner_cardinality;
        let mut top: *mut NodeBase = old_root;

        loop {
            let node: INode<K> = if let [(separator, right)] = batch[..] {
                batch.clear();
                INode::new_root(card, level, top, separator, right)
            } else {
                let node = INode::with_leftmost(card, level, top);
                batch = node.batch_insert(&batch);
                node
            };

            top = into_raw(node);
            self.stats.root_growth();
            debug_log!(level, "root growth");

            if batch.is_empty() {
                break;
            }
            level += 1;
        }

        self.root.store(top, WRITE_ORD);
        self.height.store(level as usize, WRITE_ORD);
    }
}
