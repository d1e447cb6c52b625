//! Root-to-leaf traversal.
//!
//! Every hop reads the node's version, routes, and validates before the
//! child pointer is dereferenced. A concurrent split is never an error: the
//! key just lies beyond the node's high key and the traversal moves right.

use crate::error::Restart;
use crate::internode::Hop;
use crate::key::{IndexKey, IndexValue};
use crate::leaf::LeafRef;
use crate::node::{NodeBase, NodeRef, base_ref};
use crate::nodeversion::LockGuard;
use crate::ordering::READ_ORD;

use super::Tree;

/// A leaf reached for a key, with the path that led there.
pub(super) struct Descent<'t, K: IndexKey, V: IndexValue> {
    pub(super) leaf: LeafRef<'t, K, V>,
    pub(super) ptr: *mut NodeBase,
    /// Version the leaf had when it was reached.
    pub(super) version: u64,
    /// Inner nodes descended from, root first. Hints only: any of them may
    /// have split since.
    pub(super) parents: Vec<*mut NodeBase>,
    /// Keys in the leaf are above this, if set.
    pub(super) low: Option<K>,
}

impl<K: IndexKey, V: IndexValue> Tree<K, V> {
    /// Descend to the leaf covering `key`.
    pub(super) fn descend(&self, key: K) -> Result<Descent<'_, K, V>, Restart> {
        let threshold: usize = self.config.binary_search_threshold;
        let mut ptr: *mut NodeBase = self.root.load(READ_ORD);
        // SAFETY: the root is live under the caller's epoch guard.
        let mut version: u64 = unsafe { base_ref(ptr) }.version().read_version()?;
        let mut parents: Vec<*mut NodeBase> = Vec::with_capacity(8);
        let mut low: Option<K> = None;

        loop {
            // SAFETY: every pointer followed was read from a validated node.
            match unsafe { NodeRef::<K, V>::from_ptr(ptr) } {
                NodeRef::Inner(inner) => {
                    let high_key: Option<K> = inner.base().high_key();
                    let hop = inner.scan_node(key, threshold);
                    inner.base().version().validate(version)?;

                    match hop? {
                        Hop::Right(sibling) => {
                            low = high_key;
                            ptr = sibling;
                        }
                        Hop::Down(child, separator) => {
                            parents.push(ptr);
                            low = separator.or(low);
                            ptr = child;
                        }
                    }
                }

                NodeRef::Leaf(leaf) => {
                    let base: &NodeBase = leaf.base();
                    let high_key: Option<K> = base.high_key();
                    let sibling: Option<*mut NodeBase> = base.move_right(key);
                    base.version().validate(version)?;

                    match sibling {
                        Some(next) => {
                            low = high_key;
                            ptr = next;
                        }
                        None => {
                            return Ok(Descent {
                                leaf,
                                ptr,
                                version,
                                parents,
                                low,
                            });
                        }
                    }
                }
            }

            // SAFETY: validated above; live under the epoch guard.
            version = unsafe { base_ref(ptr) }.version().read_version()?;
        }
    }

    /// Node at `level` covering `key`, found optimistically from the root.
    ///
    /// Restarts if the tree is not yet that tall.
    pub(super) fn descend_to_level(&self, key: K, level: u32) -> Result<*mut NodeBase, Restart> {
        let threshold: usize = self.config.binary_search_threshold;
        let mut ptr: *mut NodeBase = self.root.load(READ_ORD);

        loop {
            // SAFETY: live under the caller's epoch guard.
            let base: &NodeBase = unsafe { base_ref(ptr) };
            let version: u64 = base.version().read_version()?;

            if base.level() < level {
                return Err(Restart);
            }

            if base.level() == level {
                let sibling: Option<*mut NodeBase> = base.move_right(key);
                base.version().validate(version)?;
                match sibling {
                    Some(next) => ptr = next,
                    None => return Ok(ptr),
                }
                continue;
            }

            // SAFETY: level above `level` >= 0, so inner.
            let inner = unsafe { crate::node::inner_ref::<K>(ptr) };
            let hop = inner.scan_node(key, threshold);
            base.version().validate(version)?;

            ptr = match hop? {
                Hop::Right(next) | Hop::Down(next, _) => next,
            };
        }
    }

    /// Write-lock `ptr`, then move right with lock coupling until the
    /// locked node covers `key`.
    pub(super) fn lock_covering(
        &self,
        ptr: *mut NodeBase,
        key: K,
    ) -> Result<(*mut NodeBase, LockGuard<'_>), Restart> {
        let mut ptr: *mut NodeBase = ptr;
        // SAFETY: live under the caller's epoch guard.
        let mut lock: LockGuard<'_> = unsafe { base_ref(ptr) }.version().write_lock(self.config.spin)?;

        // SAFETY: as above; the sibling of a locked node is stable.
        while let Some(next) = unsafe { base_ref(ptr) }.move_right(key) {
            // SAFETY: reachable from a locked node.
            let next_lock: LockGuard<'_> =
                unsafe { base_ref(next) }.version().write_lock(self.config.spin)?;
            drop(lock);
            ptr = next;
            lock = next_lock;
        }

        Ok((ptr, lock))
    }

    /// Leftmost node of every level, root level first. Caller pins the
    /// nodes with an epoch guard or owns the tree.
    pub(super) fn level_heads(&self) -> Vec<*mut NodeBase> {
        let mut heads: Vec<*mut NodeBase> = Vec::new();
        let mut ptr: *mut NodeBase = self.root.load(READ_ORD);

        while !ptr.is_null() {
            heads.push(ptr);
            // SAFETY: reachable from the root.
            ptr = match unsafe { NodeRef::<K, V>::from_ptr(ptr) } {
                NodeRef::Inner(inner) => inner.leftmost(),
                NodeRef::Leaf(_) => std::ptr::null_mut(),
            };
        }

        heads
    }

    /// Every node of one level, left to right. Same pinning rule as
    /// [`Tree::level_heads`].
    pub(super) fn level_nodes(head: *mut NodeBase) -> Vec<*mut NodeBase> {
        let mut nodes: Vec<*mut NodeBase> = Vec::new();
        let mut ptr: *mut NodeBase = head;

        while !ptr.is_null() {
            nodes.push(ptr);
            // SAFETY: reachable through the sibling chain.
            ptr = unsafe { base_ref(ptr) }.sibling();
        }

        nodes
    }
}
