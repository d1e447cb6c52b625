//! Range scans.
//!
//! A scan descends once, then walks the leaf chain through sibling
//! pointers. Each leaf is read optimistically and its entries are only
//! kept once the leaf validated; on a failed validation the scan
//! re-descends from just past the last key it already holds.

use std::ops::Bound;

use crate::epoch::{EpochGuard, ThreadInfo};
use crate::error::{Restart, Status};
use crate::key::{IndexKey, IndexValue};
use crate::leaf::{LeafRef, ScanOutcome};
use crate::node::{NodeRef, base_ref};
use crate::tracing_helpers::trace_log;

use super::Tree;

impl<K: IndexKey, V: IndexValue> Tree<K, V> {
    /// Up to `limit` values with keys `>= start`, in key order.
    ///
    /// # Panics
    ///
    /// If `ti` was registered with another tree.
    pub fn range_lookup(&self, start: K, limit: usize, ti: &ThreadInfo<'_>) -> Vec<V> {
        self.scan(start, limit, ti)
            .into_iter()
            .map(|(_, value)| value)
            .collect()
    }

    /// Up to `limit` entries with keys `>= start`, in key order.
    ///
    /// Hash leaves that have served `convert_threshold` scans are converted
    /// to sorted leaves once the scan is done.
    ///
    /// # Panics
    ///
    /// If `ti` was registered with another tree.
    pub fn scan(&self, start: K, limit: usize, ti: &ThreadInfo<'_>) -> Vec<(K, V)> {
        self.check_thread(ti);

        if limit == 0 {
            return Vec::new();
        }

        let guard = EpochGuard::new(ti);
        let mut out: Vec<(K, V)> = Vec::with_capacity(limit.min(1024));
        let mut convert: Vec<K> = Vec::new();
        let mut resume: (K, Bound<K>) = (start, Bound::Included(start));

        while out.len() < limit {
            match self.scan_from(resume.0, resume.1, limit, &mut out, &mut convert) {
                Ok(()) => break,
                Err(Restart) => {
                    self.stats.restart();
                    if let Some(&(last, _)) = out.last() {
                        resume = (last, Bound::Excluded(last));
                    }
                }
            }
        }

        for key in convert {
            let _converted: bool = self.convert_with_guard(key, &guard);
            trace_log!(?key, converted = _converted, "scan-triggered conversion");
        }

        out
    }

    /// Collect from the leaf covering `key` rightwards, keeping entries
    /// within `from`, until `out` is full or the leaf level ends.
    fn scan_from(
        &self,
        key: K,
        mut from: Bound<K>,
        limit: usize,
        out: &mut Vec<(K, V)>,
        convert: &mut Vec<K>,
    ) -> Result<(), Restart> {
        let descent = self.descend(key)?;
        let mut leaf: LeafRef<'_, K, V> = descent.leaf;
        let mut version: u64 = descent.version;

        loop {
            let before: usize = out.len();
            let outcome: ScanOutcome<K> =
                leaf.range_lookup(from, limit - before, version, &self.config, out)?;

            if outcome.status == Some(Status::NeedConvert) {
                if let Some(&(first, _)) = out.get(before) {
                    convert.push(first);
                }
            }

            if out.len() >= limit || outcome.sibling.is_null() {
                return Ok(());
            }

            if let Some(high_key) = outcome.high_key {
                from = Bound::Excluded(high_key);
            }

            // SAFETY: sibling of a validated leaf; live under the epoch guard.
            version = unsafe { base_ref(outcome.sibling) }.version().read_version()?;
            // SAFETY: as above.
            leaf = match unsafe { NodeRef::<K, V>::from_ptr(outcome.sibling) } {
                NodeRef::Leaf(next) => next,
                NodeRef::Inner(_) => return Err(Restart),
            };
        }
    }
}
