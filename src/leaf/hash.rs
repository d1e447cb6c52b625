//! Hash bucket leaf.
//!
//! A key hashes to `hash_funcs` candidate buckets and may live in any of
//! them. Point operations lock only the candidate buckets, never the node,
//! so inserts into one leaf proceed in parallel. The node lock is reserved
//! for structural changes (split and convert), which then take every
//! bucket lock.
//!
//! # Lock order
//!
//! 1. Bucket locks of one node in ascending index order.
//! 2. Across a linked pair, `left[j]` before `right[j]`.
//! 3. A thread holding bucket locks never waits for a node lock; it
//!    validates the node version instead and restarts on mismatch.
//!
//! # Linked migration
//!
//! With [`TreeConfig::linked_migration`] a split only relabels buckets:
//! `left[j]` becomes `LinkedLeft`, `right[j]` becomes `LinkedRight`, and
//! the entries that belong to the right node stay in `left[j]` until the
//! first writer touching either bucket runs [`LNodeHash::stabilize_bucket`].
//! Readers of a `LinkedRight` bucket look into `left[j]` instead.

use std::fmt as StdFmt;
use std::marker::PhantomData;
use std::ops::Bound;
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicPtr, AtomicU32};

use crate::config::{MAX_HASH_FUNCS, TreeConfig};
use crate::error::{InvariantViolation, Restart, Status};
use crate::key::{IndexKey, IndexValue, fingerprint};
use crate::leaf::bucket::{Bucket, BucketState};
use crate::leaf::btree::LNodeBTree;
use crate::leaf::{LeafInsert, LeafSplit, Placed, ScanOutcome, in_range};
use crate::node::{NodeBase, NodeKind, base_ref, into_raw};
use crate::nodeversion::LockGuard;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::tracing_helpers::trace_log;

/// Candidate buckets of one key, ascending and deduplicated.
#[derive(Debug, Clone, Copy)]
struct Candidates {
    idx: [usize; MAX_HASH_FUNCS],
    len: usize,
    fingerprint: u8,
}

impl Candidates {
    #[inline(always)]
    fn as_slice(&self) -> &[usize] {
        &self.idx[..self.len]
    }
}

/// Outcome of an upsert into locked candidate buckets.
enum Upsert<V> {
    Inserted,
    Replaced(V),
    Full,
}

/// Sorted leaves built by [`LNodeHash::convert`].
pub(crate) struct Converted<K> {
    /// Leaves in key order, chained by sibling.
    pub(crate) leaves: Vec<*mut NodeBase>,
    /// `separators[i]` is the high key of `leaves[i]`.
    pub(crate) separators: Vec<K>,
}

/// A hash leaf.
#[repr(C)]
pub struct LNodeHash<K, V> {
    base: NodeBase,
    /// Left node of a linked split; only read while buckets are `LinkedRight`.
    left_sibling: AtomicPtr<NodeBase>,
    /// Range scans served since creation.
    scan_count: AtomicU32,
    buckets: Box<[Bucket]>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: IndexKey, V: IndexValue> StdFmt::Debug for LNodeHash<K, V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("LNodeHash")
            .field("base", &self.base)
            .field("buckets", &self.buckets.len())
            .field("scan_count", &self.scan_count.load(RELAXED))
            .finish_non_exhaustive()
    }
}

impl<K: IndexKey, V: IndexValue> LNodeHash<K, V> {
    pub(crate) fn new(buckets: usize, slots: usize) -> Self {
        Self {
            base: NodeBase::new(NodeKind::HashLeaf, 0),
            left_sibling: AtomicPtr::new(StdPtr::null_mut()),
            scan_count: AtomicU32::new(0),
            buckets: (0..buckets).map(|_| Bucket::new(slots)).collect(),
            _marker: PhantomData,
        }
    }

    #[inline(always)]
    pub(crate) const fn base(&self) -> &NodeBase {
        &self.base
    }

    #[inline(always)]
    fn as_node_ptr(&self) -> *mut NodeBase {
        StdPtr::from_ref(self).cast_mut().cast::<NodeBase>()
    }

    /// Total slots.
    pub(crate) fn capacity(&self) -> usize {
        self.buckets.iter().map(Bucket::capacity).sum()
    }

    fn candidates(&self, key: K, cfg: &TreeConfig) -> Candidates {
        let bytes: [u8; 8] = key.hash_bytes();
        let buckets: u64 = self.buckets.len() as u64;
        let funcs: usize = cfg.hash_funcs.min(MAX_HASH_FUNCS);

        let mut idx = [0usize; MAX_HASH_FUNCS];
        let mut tag: u8 = 1;

        for (seed, slot) in idx.iter_mut().enumerate().take(funcs) {
            let hash: u64 = (cfg.hasher)(&bytes, seed as u64);
            if seed == 0 && cfg.fingerprint {
                tag = fingerprint(hash);
            }

            #[expect(clippy::cast_possible_truncation, reason = "reduced modulo bucket count")]
            let reduced: usize = (hash % buckets) as usize;
            *slot = reduced;
        }

        idx[..funcs].sort_unstable();
        let mut len: usize = 0;
        for i in 0..funcs {
            if len == 0 || idx[len - 1] != idx[i] {
                idx[len] = idx[i];
                len += 1;
            }
        }

        Candidates {
            idx,
            len,
            fingerprint: tag,
        }
    }

    /// Resolve a hash leaf neighbour, or `None` if `ptr` is not one.
    fn hash_neighbour<'g>(ptr: *mut NodeBase) -> Option<&'g Self> {
        if ptr.is_null() {
            return None;
        }

        // SAFETY: neighbours are kept alive by the caller's epoch guard.
        let base: &NodeBase = unsafe { base_ref(ptr) };
        // SAFETY: kind checked; repr(C) with NodeBase first.
        (base.kind() == NodeKind::HashLeaf).then(|| unsafe { &*ptr.cast::<Self>() })
    }

    // ========================================================================
    //  Bucket Locking and Migration
    // ========================================================================

    fn lock_buckets<'g>(
        &'g self,
        idx: impl IntoIterator<Item = usize>,
        cfg: &TreeConfig,
    ) -> Result<Vec<LockGuard<'g>>, Restart> {
        idx.into_iter()
            .map(|j| self.buckets[j].lock().write_lock(cfg.spin))
            .collect()
    }

    /// Finish a pending linked migration of bucket `j`, if any.
    ///
    /// Locks `left[j]` then `right[j]` and moves every entry above the left
    /// node's high key across. Returns without work if another thread got
    /// there first.
    pub(crate) fn stabilize_bucket(&self, j: usize, cfg: &TreeConfig) -> Result<(), Restart> {
        match self.buckets[j].state() {
            BucketState::Stable => Ok(()),

            BucketState::LinkedLeft => match Self::hash_neighbour(self.base.sibling()) {
                Some(right) => Self::stabilize_pair(self, right, j, cfg),
                None => Ok(()),
            },

            BucketState::LinkedRight => {
                match Self::hash_neighbour(self.left_sibling.load(READ_ORD)) {
                    Some(left) => Self::stabilize_pair(left, self, j, cfg),
                    None => Ok(()),
                }
            }
        }
    }

    fn stabilize_pair(left: &Self, right: &Self, j: usize, cfg: &TreeConfig) -> Result<(), Restart> {
        let (lb, rb) = (&left.buckets[j], &right.buckets[j]);

        let _left_guard: LockGuard<'_> = lb.lock().write_lock(cfg.spin)?;
        let _right_guard: LockGuard<'_> = rb.lock().write_lock(cfg.spin)?;

        let still_linked: bool = lb.state() == BucketState::LinkedLeft
            && rb.state() == BucketState::LinkedRight
            && left.base.sibling() == right.as_node_ptr()
            && right.left_sibling.load(READ_ORD) == left.as_node_ptr();

        if !still_linked {
            return Ok(());
        }

        // The left node cannot split again while this pair is linked.
        let Some(high_key) = left.base.high_key::<K>() else {
            return Err(Restart);
        };

        let _moved: usize = lb.migrate(rb, |word| K::from_word(word) > high_key);
        lb.set_state(BucketState::Stable);
        rb.set_state(BucketState::Stable);

        trace_log!(bucket = j, moved = _moved, "stabilized linked bucket");
        Ok(())
    }

    fn stabilize_candidates(&self, cand: &Candidates, cfg: &TreeConfig) -> Result<(), Restart> {
        if cfg.linked_migration {
            for &j in cand.as_slice() {
                self.stabilize_bucket(j, cfg)?;
            }
        }
        Ok(())
    }

    fn stabilize_all(&self, cfg: &TreeConfig) -> Result<(), Restart> {
        if cfg.linked_migration {
            for j in 0..self.buckets.len() {
                self.stabilize_bucket(j, cfg)?;
            }
        }
        Ok(())
    }

    fn all_stable(&self, cand: &Candidates) -> bool {
        cand.as_slice()
            .iter()
            .all(|&j| self.buckets[j].state() == BucketState::Stable)
    }

    /// Upsert into candidate buckets. Caller holds their locks.
    fn upsert_locked(&self, cand: &Candidates, key: K, value: V) -> Upsert<V> {
        let word: u64 = key.to_word();

        for &j in cand.as_slice() {
            let bucket: &Bucket = &self.buckets[j];
            if let Some(slot) = bucket.find(word, cand.fingerprint) {
                return Upsert::Replaced(V::from_word(bucket.replace_value(slot, value.to_word())));
            }
        }

        for &j in cand.as_slice() {
            if self.buckets[j].insert(cand.fingerprint, word, value.to_word()) {
                return Upsert::Inserted;
            }
        }

        Upsert::Full
    }

    // ========================================================================
    //  Point Operations
    // ========================================================================

    /// Upsert `key` under its candidate bucket locks.
    ///
    /// When every candidate is full the bucket locks are released and the
    /// node lock is upgraded from `version`; the guard comes back in
    /// [`LeafInsert::NeedSplit`].
    pub(crate) fn insert(
        &self,
        key: K,
        value: V,
        version: u64,
        cfg: &TreeConfig,
    ) -> Result<LeafInsert<'_, V>, Restart> {
        let cand: Candidates = self.candidates(key, cfg);
        self.stabilize_candidates(&cand, cfg)?;

        let guards: Vec<LockGuard<'_>> = self.lock_buckets(cand.as_slice().iter().copied(), cfg)?;
        self.base.version().validate(version)?;

        if !self.all_stable(&cand) {
            return Err(Restart);
        }

        match self.upsert_locked(&cand, key, value) {
            Upsert::Inserted => Ok(LeafInsert::Inserted),
            Upsert::Replaced(old) => Ok(LeafInsert::Replaced(old)),
            Upsert::Full => {
                drop(guards);
                let guard: LockGuard<'_> = self.base.version().try_upgrade_write_lock(version)?;
                Ok(LeafInsert::NeedSplit(guard))
            }
        }
    }

    /// Upsert into a node nobody else can modify (fresh split halves).
    ///
    /// The key may already be present: bucket writers do not bump the node
    /// version, so one can land between a full insert and the node lock.
    fn insert_owned(&self, key: K, value: V, cfg: &TreeConfig) -> Placed<V> {
        let cand: Candidates = self.candidates(key, cfg);

        if self.stabilize_candidates(&cand, cfg).is_err() {
            return Placed::Deferred;
        }

        let Ok(_guards) = self.lock_buckets(cand.as_slice().iter().copied(), cfg) else {
            return Placed::Deferred;
        };

        if !self.all_stable(&cand) {
            return Placed::Deferred;
        }

        match self.upsert_locked(&cand, key, value) {
            Upsert::Inserted => Placed::Inserted,
            Upsert::Replaced(old) => Placed::Replaced(old),
            Upsert::Full => Placed::Deferred,
        }
    }

    /// Lock-free point lookup.
    pub(crate) fn find(&self, key: K, version: u64, cfg: &TreeConfig) -> Result<Option<V>, Restart> {
        let cand: Candidates = self.candidates(key, cfg);
        let word: u64 = key.to_word();

        for &j in cand.as_slice() {
            let bucket: &Bucket = &self.buckets[j];
            let bucket_version: u64 = bucket.lock().read_version()?;

            let found: Option<u64> = if bucket.state() == BucketState::LinkedRight {
                let left: &Self =
                    Self::hash_neighbour(self.left_sibling.load(READ_ORD)).ok_or(Restart)?;
                let source: &Bucket = &left.buckets[j];
                let source_version: u64 = source.lock().read_version()?;
                let found = source
                    .find(word, cand.fingerprint)
                    .map(|slot| source.value_at(slot));
                source.lock().validate(source_version)?;
                found
            } else {
                bucket
                    .find(word, cand.fingerprint)
                    .map(|slot| bucket.value_at(slot))
            };

            bucket.lock().validate(bucket_version)?;

            if let Some(value) = found {
                self.base.version().validate(version)?;
                return Ok(Some(V::from_word(value)));
            }
        }

        self.base.version().validate(version)?;
        Ok(None)
    }

    /// Run `op` on the slot holding `key`, under candidate bucket locks.
    fn with_slot(
        &self,
        key: K,
        version: u64,
        cfg: &TreeConfig,
        op: impl FnOnce(&Bucket, usize),
    ) -> Result<bool, Restart> {
        let cand: Candidates = self.candidates(key, cfg);
        self.stabilize_candidates(&cand, cfg)?;

        let _guards: Vec<LockGuard<'_>> = self.lock_buckets(cand.as_slice().iter().copied(), cfg)?;
        self.base.version().validate(version)?;

        if !self.all_stable(&cand) {
            return Err(Restart);
        }

        let word: u64 = key.to_word();
        for &j in cand.as_slice() {
            let bucket: &Bucket = &self.buckets[j];
            if let Some(slot) = bucket.find(word, cand.fingerprint) {
                op(bucket, slot);
                return Ok(true);
            }
        }

        Ok(false)
    }

    pub(crate) fn update(
        &self,
        key: K,
        value: V,
        version: u64,
        cfg: &TreeConfig,
    ) -> Result<Status, Restart> {
        let found: bool = self.with_slot(key, version, cfg, |bucket, slot| {
            bucket.replace_value(slot, value.to_word());
        })?;

        Ok(if found {
            Status::UpdateSuccess
        } else {
            Status::KeyNotFound
        })
    }

    pub(crate) fn remove(&self, key: K, version: u64, cfg: &TreeConfig) -> Result<Status, Restart> {
        let found: bool = self.with_slot(key, version, cfg, Bucket::clear)?;

        Ok(if found {
            Status::RemoveSuccess
        } else {
            Status::KeyNotFound
        })
    }

    // ========================================================================
    //  Structural Operations
    // ========================================================================

    /// Lock and stabilize every bucket. Caller holds the node lock.
    fn seal(&self, cfg: &TreeConfig) -> Result<Vec<LockGuard<'_>>, Restart> {
        self.stabilize_all(cfg)?;
        self.lock_buckets(0..self.buckets.len(), cfg)
    }

    /// All entries. Caller holds every bucket lock, all stable.
    fn drain_view(&self) -> Vec<(K, V)> {
        self.buckets
            .iter()
            .flat_map(Bucket::occupied)
            .map(|(_, _, k, v)| (K::from_word(k), V::from_word(v)))
            .collect()
    }

    /// Split around the median key and place the pending entry.
    ///
    /// The pending key joins the median computation. It may still fail to
    /// fit if its candidates on the chosen side stay full; it is then
    /// [`Placed::Deferred`] and the caller retries the insert from the root.
    pub(crate) fn split<'g>(
        &'g self,
        guard: LockGuard<'g>,
        key: K,
        value: V,
        cfg: &TreeConfig,
    ) -> Result<(LeafSplit<K, V>, LockGuard<'g>), Restart> {
        let bucket_guards: Vec<LockGuard<'_>> = self.seal(cfg)?;

        let mut keys: Vec<K> = self.drain_view().into_iter().map(|(k, _)| k).collect();
        keys.push(key);
        let mid: usize = (keys.len() - 1) / 2;
        let (_, &mut split_key, _) = keys.select_nth_unstable(mid);

        let right: Self = Self::new(self.buckets.len(), self.buckets[0].capacity());

        if cfg.linked_migration {
            right.left_sibling.store(self.as_node_ptr(), WRITE_ORD);
            for (lb, rb) in self.buckets.iter().zip(right.buckets.iter()) {
                lb.set_state(BucketState::LinkedLeft);
                rb.set_state(BucketState::LinkedRight);
            }
        } else {
            for (lb, rb) in self.buckets.iter().zip(right.buckets.iter()) {
                lb.migrate(rb, |word| K::from_word(word) > split_key);
            }
        }

        right.base.inherit_fence(&self.base);
        let right_ptr: *mut NodeBase = into_raw(right);
        self.base.set_fence(right_ptr, Some(split_key));
        self.scan_count.store(0, RELAXED);

        drop(bucket_guards);

        // Only this thread can reach the right half until `guard` drops.
        let placed: Placed<V> = if key <= split_key {
            self.insert_owned(key, value, cfg)
        } else {
            // SAFETY: just allocated above.
            let right: &Self = unsafe { &*right_ptr.cast::<Self>() };
            right.insert_owned(key, value, cfg)
        };

        let split = LeafSplit {
            right: right_ptr,
            split_key,
            placed,
        };
        Ok((split, guard))
    }

    /// Rebuild the entries as a chain of sorted leaves.
    ///
    /// Caller holds the node lock and must unlink and retire this node
    /// afterwards. The last leaf inherits this node's sibling and high key.
    pub(crate) fn convert(&self, _guard: &LockGuard<'_>, cfg: &TreeConfig) -> Result<Converted<K>, Restart> {
        let bucket_guards: Vec<LockGuard<'_>> = self.seal(cfg)?;

        let mut entries: Vec<(K, V)> = self.drain_view();
        entries.sort_unstable_by_key(|&(k, _)| k);
        drop(bucket_guards);

        let fill: usize = cfg.convert_fill();
        let chunks: Vec<&[(K, V)]> = if entries.is_empty() {
            vec![&[]]
        } else {
            entries.chunks(fill).collect()
        };

        let leaves: Vec<*mut NodeBase> = chunks
            .iter()
            .map(|chunk| into_raw(LNodeBTree::<K, V>::from_sorted(cfg.leaf_cardinality, chunk)))
            .collect();

        let separators: Vec<K> = chunks[..chunks.len() - 1]
            .iter()
            .filter_map(|chunk| chunk.last().map(|&(k, _)| k))
            .collect();

        for (i, &leaf) in leaves.iter().enumerate() {
            // SAFETY: freshly allocated, unpublished.
            let base: &NodeBase = unsafe { base_ref(leaf) };
            match leaves.get(i + 1) {
                Some(&next) => base.set_fence(next, Some(separators[i])),
                None => base.inherit_fence(&self.base),
            }
        }

        Ok(Converted { leaves, separators })
    }

    // ========================================================================
    //  Range Scan
    // ========================================================================

    /// Append up to `limit` entries at or after `from`, in key order.
    ///
    /// Signals [`Status::NeedConvert`] once this leaf has served
    /// `convert_threshold` scans.
    pub(crate) fn range_lookup(
        &self,
        from: Bound<K>,
        limit: usize,
        version: u64,
        cfg: &TreeConfig,
        out: &mut Vec<(K, V)>,
    ) -> Result<ScanOutcome<K>, Restart> {
        let high_key: Option<K> = self.base.high_key();
        let sibling: *mut NodeBase = self.base.sibling();
        let mut found: Vec<(K, V)> = Vec::new();

        for (j, bucket) in self.buckets.iter().enumerate() {
            let bucket_version: u64 = bucket.lock().read_version()?;

            match bucket.state() {
                BucketState::LinkedRight => {
                    let left: &Self =
                        Self::hash_neighbour(self.left_sibling.load(READ_ORD)).ok_or(Restart)?;
                    let low: K = left.base.high_key().ok_or(Restart)?;
                    let source: &Bucket = &left.buckets[j];
                    let source_version: u64 = source.lock().read_version()?;

                    collect(source, &mut found, |k| k > low && in_range(k, from));
                    source.lock().validate(source_version)?;
                }

                BucketState::LinkedLeft => collect(bucket, &mut found, |k| {
                    high_key.is_none_or(|h| k <= h) && in_range(k, from)
                }),

                BucketState::Stable => collect(bucket, &mut found, |k| in_range(k, from)),
            }

            bucket.lock().validate(bucket_version)?;
        }

        self.base.version().validate(version)?;

        found.sort_unstable_by_key(|&(k, _)| k);
        found.truncate(limit);
        out.extend(found);

        let scans: u32 = self.scan_count.fetch_add(1, RELAXED).saturating_add(1);

        Ok(ScanOutcome {
            high_key,
            sibling,
            status: (cfg.convert_threshold != 0 && scans >= cfg.convert_threshold)
                .then_some(Status::NeedConvert),
        })
    }

    // ========================================================================
    //  Diagnostics
    // ========================================================================

    /// Unsynchronized snapshot of this node's own entries, unsorted.
    pub(crate) fn entries(&self) -> Vec<(K, V)> {
        let high_key: Option<K> = self.base.high_key();
        let mut out: Vec<(K, V)> = Vec::new();

        for (j, bucket) in self.buckets.iter().enumerate() {
            match bucket.state() {
                BucketState::LinkedRight => {
                    if let Some(left) = Self::hash_neighbour(self.left_sibling.load(READ_ORD)) {
                        let low: Option<K> = left.base.high_key();
                        collect(&left.buckets[j], &mut out, |k| low.is_some_and(|l| k > l));
                    }
                }
                _ => collect(bucket, &mut out, |k| high_key.is_none_or(|h| k <= h)),
            }
        }

        out
    }

    #[expect(clippy::cast_precision_loss, reason = "ratio of small counts")]
    pub(crate) fn utilization(&self) -> f64 {
        let used: usize = self.buckets.iter().map(Bucket::len).sum();
        used as f64 / self.capacity() as f64
    }

    pub(crate) fn sanity_check(&self, cfg: &TreeConfig) -> Result<(), InvariantViolation> {
        let high_key: Option<K> = self.base.high_key();

        for (j, bucket) in self.buckets.iter().enumerate() {
            let count: usize = bucket.len();
            if count > bucket.capacity() {
                return Err(InvariantViolation::CountOverflow {
                    level: 0,
                    count,
                    capacity: bucket.capacity(),
                });
            }

            let state: BucketState = bucket.state();
            for (slot, _, word, _) in bucket.occupied() {
                let key: K = K::from_word(word);

                if state == BucketState::Stable && high_key.is_some_and(|h| key > h) {
                    return Err(InvariantViolation::HighKeyBound {
                        level: 0,
                        key: format!("{key:?}"),
                        high_key: format!("{high_key:?}"),
                    });
                }

                if !self.candidates(key, cfg).as_slice().contains(&j) {
                    return Err(InvariantViolation::KeyOrder { level: 0, index: slot });
                }
            }
        }

        Ok(())
    }
}

/// Push the entries of `bucket` whose key passes `keep`.
fn collect<K: IndexKey, V: IndexValue>(
    bucket: &Bucket,
    out: &mut Vec<(K, V)>,
    keep: impl Fn(K) -> bool,
) {
    out.extend(
        bucket
            .occupied()
            .map(|(_, _, k, v)| (K::from_word(k), V::from_word(v)))
            .filter(|&(k, _)| keep(k)),
    );
}
