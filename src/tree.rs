//! `Tree`: the concurrent index.
//!
//! A B-link tree of [`INode`]s over sorted and hashed leaves. Readers never
//! lock; writers lock single leaves (or single buckets of a hash leaf) and
//! only take inner node locks while propagating a split.
//!
//! [`INode`]: crate::internode::INode

use std::fmt as StdFmt;
use std::marker::PhantomData;
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicPtr, AtomicUsize};

use crate::config::{LeafKind, TreeConfig};
use crate::epoch::{Epoch, EpochGuard, EpochGuardReadonly, ThreadInfo};
use crate::error::{ConfigError, Restart, Status};
use crate::key::{IndexKey, IndexValue};
use crate::leaf::{LeafInsert, Placed};
use crate::leaf::btree::LNodeBTree;
use crate::leaf::hash::LNodeHash;
use crate::node::{NodeBase, into_raw, reclaim_node};
use crate::ordering::RELAXED;
use crate::tracing_helpers::{debug_log, trace_log};

mod convert;
mod sanity;
mod scan;
mod split;
mod stats;
mod traverse;

pub use stats::TreeStats;

use stats::StatsCounters;
use traverse::Descent;

/// A concurrent ordered index.
///
/// Every operation takes the calling thread's [`ThreadInfo`], obtained once
/// per thread from [`Tree::thread_info`].
///
/// # Example
///
/// ```rust
/// use blinkhash::Tree;
///
/// let tree: Tree<u64, u64> = Tree::new();
/// let ti = tree.thread_info();
///
/// assert_eq!(tree.insert(7, 70, &ti), None);
/// assert_eq!(tree.insert(7, 71, &ti), Some(70));
/// assert_eq!(tree.lookup(7, &ti), Some(71));
/// assert!(tree.remove(7, &ti));
/// assert!(tree.is_empty());
/// ```
pub struct Tree<K: IndexKey, V: IndexValue> {
    root: AtomicPtr<NodeBase>,
    /// Level of the current root.
    height: AtomicUsize,
    epoch: Epoch,
    config: TreeConfig,
    len: AtomicUsize,
    stats: StatsCounters,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: IndexKey, V: IndexValue> StdFmt::Debug for Tree<K, V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Tree")
            .field("len", &self.len())
            .field("height", &self.height())
            .field("config", &self.config)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl<K: IndexKey, V: IndexValue> Default for Tree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: IndexKey, V: IndexValue> Tree<K, V> {
    /// A tree with [`TreeConfig::default`].
    #[must_use]
    pub fn new() -> Self {
        Self::build(TreeConfig::default())
    }

    /// A tree with a custom configuration.
    ///
    /// # Errors
    ///
    /// The first field of `config` outside its supported range.
    pub fn with_config(config: TreeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: TreeConfig) -> Self {
        let root: *mut NodeBase = Self::new_leaf(&config);

        Self {
            root: AtomicPtr::new(root),
            height: AtomicUsize::new(0),
            epoch: Epoch::new(config.gc_threshold, config.poison_on_free),
            config,
            len: AtomicUsize::new(0),
            stats: StatsCounters::default(),
            _marker: PhantomData,
        }
    }

    fn new_leaf(config: &TreeConfig) -> *mut NodeBase {
        match config.initial_leaf {
            LeafKind::Sorted => into_raw(LNodeBTree::<K, V>::new(config.leaf_cardinality)),
            LeafKind::Hashed => into_raw(LNodeHash::<K, V>::new(
                config.hash_buckets,
                config.bucket_slots,
            )),
        }
    }

    /// Register the calling thread.
    ///
    /// Keep it for the thread's lifetime; registration is not free.
    pub fn thread_info(&self) -> ThreadInfo<'_> {
        self.epoch.register()
    }

    /// The configuration the tree was built with.
    #[must_use]
    pub const fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(RELAXED)
    }

    /// True if the tree holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters since the tree was built.
    #[must_use]
    pub fn stats(&self) -> TreeStats {
        self.stats.snapshot(self.epoch.reclaimed())
    }

    #[inline]
    fn check_thread(&self, ti: &ThreadInfo<'_>) {
        assert!(
            StdPtr::eq(ti.epoch(), &self.epoch),
            "ThreadInfo belongs to a different tree"
        );
    }

    /// Run `op` until it stops asking for a restart.
    fn retry<R>(&self, mut op: impl FnMut() -> Result<R, Restart>) -> R {
        let mut attempt: u32 = 0;

        loop {
            match op() {
                Ok(result) => return result,
                Err(Restart) => {
                    trace_log!(status = %Status::NeedRestart, attempt, "restart");
                    self.stats.restart();
                    self.config.spin.wait(attempt);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    // ========================================================================
    //  Point Operations
    // ========================================================================

    /// Insert or overwrite. Returns the previous value, if any.
    ///
    /// # Panics
    ///
    /// If `ti` was registered with another tree.
    pub fn insert(&self, key: K, value: V, ti: &ThreadInfo<'_>) -> Option<V> {
        self.check_thread(ti);
        let _guard = EpochGuard::new(ti);
        self.retry(|| self.try_insert(key, value))
    }

    fn try_insert(&self, key: K, value: V) -> Result<Option<V>, Restart> {
        let Descent {
            leaf,
            ptr,
            version,
            parents,
            ..
        } = self.descend(key)?;

        match leaf.insert(key, value, version, &self.config)? {
            LeafInsert::Inserted => {
                self.len.fetch_add(1, RELAXED);
                Ok(None)
            }

            LeafInsert::Replaced(old) => Ok(Some(old)),

            LeafInsert::NeedSplit(lock) => {
                let (split, lock) = leaf.split(lock, key, value, &self.config)?;
                self.stats.leaf_split(leaf.is_hashed());
                debug_log!(
                    split_key = ?split.split_key,
                    deferred = matches!(split.placed, Placed::Deferred),
                    "leaf split"
                );

                self.propagate(parents, ptr, lock, vec![(split.split_key, split.right)]);

                match split.placed {
                    Placed::Inserted => {
                        self.len.fetch_add(1, RELAXED);
                        Ok(None)
                    }
                    Placed::Replaced(old) => Ok(Some(old)),
                    Placed::Deferred => Err(Restart),
                }
            }
        }
    }

    /// Value stored under `key`.
    ///
    /// # Panics
    ///
    /// If `ti` was registered with another tree.
    pub fn lookup(&self, key: K, ti: &ThreadInfo<'_>) -> Option<V> {
        self.check_thread(ti);
        let _guard = EpochGuardReadonly::new(ti);

        self.retry(|| {
            let descent = self.descend(key)?;
            descent.leaf.find(key, descent.version, &self.config)
        })
    }

    /// Overwrite an existing key. False if it is absent.
    ///
    /// # Panics
    ///
    /// If `ti` was registered with another tree.
    pub fn update(&self, key: K, value: V, ti: &ThreadInfo<'_>) -> bool {
        self.check_thread(ti);
        let _guard = EpochGuard::new(ti);

        let status: Status = self.retry(|| {
            let descent = self.descend(key)?;
            descent.leaf.update(key, value, descent.version, &self.config)
        });

        status == Status::UpdateSuccess
    }

    /// Remove `key`. False if it is absent.
    ///
    /// # Panics
    ///
    /// If `ti` was registered with another tree.
    pub fn remove(&self, key: K, ti: &ThreadInfo<'_>) -> bool {
        self.check_thread(ti);
        let _guard = EpochGuard::new(ti);

        let status: Status = self.retry(|| {
            let descent = self.descend(key)?;
            descent.leaf.remove(key, descent.version, &self.config)
        });

        if status == Status::RemoveSuccess {
            self.len.fetch_sub(1, RELAXED);
            true
        } else {
            false
        }
    }
}

impl<K: IndexKey, V: IndexValue> Drop for Tree<K, V> {
    fn drop(&mut self) {
        for head in self.level_heads() {
            for ptr in Self::level_nodes(head) {
                // SAFETY: &mut self; every reachable node is owned by the tree
                // and retired ones are only in the epoch's lists.
                unsafe { reclaim_node::<K, V>(ptr) };
            }
        }
        *self.root.get_mut() = StdPtr::null_mut();
    }
}
