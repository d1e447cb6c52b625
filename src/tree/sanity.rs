//! Structural diagnostics.
//!
//! The walkers follow every level through sibling pointers without taking
//! locks. A read-only epoch guard keeps each visited node allocated; the
//! results are exact only while no writer is active.

use crate::epoch::{EpochGuardReadonly, ThreadInfo};
use crate::error::InvariantViolation;
use crate::key::{IndexKey, IndexValue};
use crate::node::{NodeBase, NodeRef, base_ref};
use crate::ordering::READ_ORD;
use crate::tracing_helpers::error_log;

use super::Tree;

impl<K: IndexKey, V: IndexValue> Tree<K, V> {
    /// Number of inner levels above the leaves; 0 for a single leaf.
    #[must_use]
    pub fn height(&self) -> usize {
        self.height.load(READ_ORD)
    }

    /// Mean fill ratio of all leaves.
    ///
    /// # Panics
    ///
    /// If `ti` was registered with another tree.
    #[must_use]
    #[expect(clippy::cast_precision_loss, reason = "leaf counts are small")]
    pub fn utilization(&self, ti: &ThreadInfo<'_>) -> f64 {
        self.check_thread(ti);
        let _guard = EpochGuardReadonly::new(ti);

        let Some(&head) = self.level_heads().last() else {
            return 0.0;
        };

        let leaves = Self::level_nodes(head);
        let total: f64 = leaves
            .iter()
            // SAFETY: reachable leaves, pinned by the guard.
            .map(|&ptr| match unsafe { NodeRef::<K, V>::from_ptr(ptr) } {
                NodeRef::Leaf(leaf) => leaf.utilization(),
                NodeRef::Inner(_) => 0.0,
            })
            .sum();

        total / leaves.len() as f64
    }

    /// Check every structural invariant of the tree.
    ///
    /// Per node: entry count within capacity, ascending keys, keys within
    /// the high key, hashed keys in a candidate bucket, child levels. Per
    /// level: sibling keys above the left neighbour's high key and no
    /// obsolete node reachable.
    ///
    /// # Errors
    ///
    /// The first violation found. It is also logged at error level.
    ///
    /// # Panics
    ///
    /// If `ti` was registered with another tree.
    pub fn sanity_check(&self, ti: &ThreadInfo<'_>) -> Result<(), InvariantViolation> {
        self.check_thread(ti);
        let _guard = EpochGuardReadonly::new(ti);

        self.check_levels().inspect_err(|_violation| {
            error_log!(violation = %_violation, "tree invariant violated");
        })
    }

    fn check_levels(&self) -> Result<(), InvariantViolation> {
        for head in self.level_heads() {
            let nodes = Self::level_nodes(head);

            for pair in nodes.windows(2) {
                Self::check_sibling_order(pair[0], pair[1])?;
            }

            for &ptr in &nodes {
                // SAFETY: reachable node, pinned by the caller's guard.
                let base: &NodeBase = unsafe { base_ref(ptr) };
                if base.version().is_obsolete() {
                    return Err(InvariantViolation::ObsoleteReachable { level: base.level() });
                }

                // SAFETY: as above.
                match unsafe { NodeRef::<K, V>::from_ptr(ptr) } {
                    NodeRef::Inner(inner) => inner.sanity_check()?,
                    NodeRef::Leaf(leaf) => leaf.sanity_check(&self.config)?,
                }
            }
        }

        Ok(())
    }

    fn check_sibling_order(left: *mut NodeBase, right: *mut NodeBase) -> Result<(), InvariantViolation> {
        // SAFETY: reachable nodes, pinned by the caller's guard.
        let (lb, rb) = unsafe { (base_ref(left), base_ref(right)) };

        if lb.level() != rb.level() {
            return Err(InvariantViolation::LevelMismatch {
                parent: lb.level(),
                child: rb.level(),
            });
        }

        let Some(high_key) = lb.high_key::<K>() else {
            return Ok(());
        };

        // SAFETY: as above.
        let right_min: Option<K> = match unsafe { NodeRef::<K, V>::from_ptr(right) } {
            NodeRef::Inner(inner) => inner.first_key(),
            NodeRef::Leaf(leaf) => leaf.entries().first().map(|&(k, _)| k),
        };

        match right_min {
            Some(min) if min <= high_key => Err(InvariantViolation::SiblingOrder {
                level: lb.level(),
                high_key: format!("{high_key:?}"),
                sibling_min: format!("{min:?}"),
            }),
            _ => Ok(()),
        }
    }
}
