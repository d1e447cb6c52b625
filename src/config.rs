//! Runtime configuration for a [`Tree`](crate::Tree).
//!
//! Node sizes, hashing parameters, feature toggles, and diagnostics all
//! live here and are handed to the tree at construction. Nothing is
//! process-global: two trees with different configurations can coexist.

use std::fmt as StdFmt;
use std::time::Duration;

use crate::error::ConfigError;
use crate::key::{HashFn, default_hash};

/// Upper bound on [`TreeConfig::bucket_slots`].
pub const MAX_BUCKET_SLOTS: usize = 32;

/// Upper bound on [`TreeConfig::hash_funcs`].
pub const MAX_HASH_FUNCS: usize = 4;

/// Bytes per leaf entry (one key word, one value word).
const ENTRY_BYTES: usize = 16;

/// Bytes per bucket slot: entry plus fingerprint.
const SLOT_BYTES: usize = ENTRY_BYTES + 1;

/// Approximate per-node header size used when deriving cardinalities.
const HEADER_BYTES: usize = 64;

/// Page size behind [`TreeConfig::default`].
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Which leaf representation new trees start with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeafKind {
    /// Sorted array leaf.
    Sorted,
    /// Hash-bucket leaf.
    #[default]
    Hashed,
}

/// How lock acquisition and restart loops wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinPolicy {
    /// Busy-spin with `spin_loop` hints only.
    Spin,
    /// Spin, then yield, then sleep.
    Backoff {
        /// Iterations spent spinning before yielding.
        spin_limit: u32,
        /// Iterations spent yielding before sleeping.
        yield_limit: u32,
        /// Sleep length once both limits are exceeded.
        sleep: Duration,
    },
}

impl Default for SpinPolicy {
    fn default() -> Self {
        Self::Backoff {
            spin_limit: 64,
            yield_limit: 1024,
            sleep: Duration::from_micros(10),
        }
    }
}

impl SpinPolicy {
    /// Wait once, given how many times this caller has already waited.
    #[inline]
    pub fn wait(self, attempt: u32) {
        match self {
            Self::Spin => std::hint::spin_loop(),

            Self::Backoff {
                spin_limit,
                yield_limit,
                sleep,
            } => {
                if attempt < spin_limit {
                    std::hint::spin_loop();
                } else if attempt < yield_limit {
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(sleep);
                }
            }
        }
    }
}

/// Configuration for a [`Tree`](crate::Tree).
///
/// # Example
///
/// ```rust
/// use blinkhash::{LeafKind, TreeConfig};
///
/// let config = TreeConfig::default()
///     .with_initial_leaf(LeafKind::Sorted)
///     .with_leaf_cardinality(3)
///     .with_inner_cardinality(4);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct TreeConfig {
    /// Entries per sorted leaf.
    pub leaf_cardinality: usize,
    /// Separators per inner node.
    pub inner_cardinality: usize,
    /// Buckets per hash leaf.
    pub hash_buckets: usize,
    /// Slots per bucket.
    pub bucket_slots: usize,
    /// Candidate buckets per key.
    pub hash_funcs: usize,
    /// Target occupancy of sorted leaves produced by conversion.
    pub fill_factor: f64,
    /// Defer bucket migration on hash leaf splits.
    pub linked_migration: bool,
    /// Compare fingerprints before full keys in hash buckets.
    pub fingerprint: bool,
    /// Representation of the initial root leaf.
    pub initial_leaf: LeafKind,
    /// Range scans a hash leaf serves before it converts; zero disables.
    pub convert_threshold: u32,
    /// Node sizes at or above which searches switch from linear to binary.
    pub binary_search_threshold: usize,
    /// Retired nodes a thread accumulates before it attempts reclamation.
    pub gc_threshold: usize,
    /// Waiting strategy for contended locks.
    pub spin: SpinPolicy,
    /// Poison reclaimed nodes instead of freeing them (test instrumentation).
    pub poison_on_free: bool,
    /// Seeded hash over key bytes.
    pub hasher: HashFn,
}

impl StdFmt::Debug for TreeConfig {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("TreeConfig")
            .field("leaf_cardinality", &self.leaf_cardinality)
            .field("inner_cardinality", &self.inner_cardinality)
            .field("hash_buckets", &self.hash_buckets)
            .field("bucket_slots", &self.bucket_slots)
            .field("hash_funcs", &self.hash_funcs)
            .field("fill_factor", &self.fill_factor)
            .field("linked_migration", &self.linked_migration)
            .field("fingerprint", &self.fingerprint)
            .field("initial_leaf", &self.initial_leaf)
            .field("convert_threshold", &self.convert_threshold)
            .field("gc_threshold", &self.gc_threshold)
            .finish_non_exhaustive()
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self::derive(DEFAULT_PAGE_SIZE)
    }
}

impl TreeConfig {
    /// Derive node cardinalities from a page size in bytes.
    ///
    /// # Errors
    ///
    /// [`ConfigError::PageSize`] if the page cannot hold two entries.
    pub fn from_page_size(page_size: usize) -> Result<Self, ConfigError> {
        if page_size.saturating_sub(HEADER_BYTES) / ENTRY_BYTES < 2 {
            return Err(ConfigError::PageSize(page_size));
        }

        Ok(Self::derive(page_size))
    }

    fn derive(page_size: usize) -> Self {
        let body: usize = page_size.saturating_sub(HEADER_BYTES);
        let leaf_cardinality: usize = (body / ENTRY_BYTES).max(2);

        // Each bucket also carries its lock word and state.
        let bucket_slots: usize = 8;
        let hash_buckets: usize = (body / (SLOT_BYTES * bucket_slots + 16)).max(1);

        Self {
            leaf_cardinality,
            inner_cardinality: leaf_cardinality,
            hash_buckets,
            bucket_slots,
            hash_funcs: 2,
            fill_factor: 0.8,
            linked_migration: false,
            fingerprint: true,
            initial_leaf: LeafKind::Hashed,
            convert_threshold: 4,
            binary_search_threshold: 64,
            gc_threshold: 256,
            spin: SpinPolicy::default(),
            poison_on_free: false,
            hasher: default_hash,
        }
    }

    /// Check every field against its supported range.
    ///
    /// # Errors
    ///
    /// The first out-of-range field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.leaf_cardinality < 2 {
            return Err(ConfigError::LeafCardinality(self.leaf_cardinality));
        }

        if self.inner_cardinality < 2 {
            return Err(ConfigError::InnerCardinality(self.inner_cardinality));
        }

        if self.hash_buckets == 0 {
            return Err(ConfigError::HashBuckets(self.hash_buckets));
        }

        if !(1..=MAX_BUCKET_SLOTS).contains(&self.bucket_slots) {
            return Err(ConfigError::BucketSlots(self.bucket_slots));
        }

        if !(1..=MAX_HASH_FUNCS).contains(&self.hash_funcs) {
            return Err(ConfigError::HashFuncs(self.hash_funcs));
        }

        if !(self.fill_factor > 0.0 && self.fill_factor <= 1.0) {
            return Err(ConfigError::FillFactor(self.fill_factor));
        }

        Ok(())
    }

    /// Entries per sorted leaf built by conversion, at least one.
    #[must_use]
    #[expect(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        reason = "fill factor is in (0, 1], result is at most leaf_cardinality"
    )]
    pub fn convert_fill(&self) -> usize {
        let fill: usize = (self.leaf_cardinality as f64 * self.fill_factor) as usize;
        fill.clamp(1, self.leaf_cardinality)
    }

    /// Set [`TreeConfig::leaf_cardinality`].
    #[must_use]
    pub const fn with_leaf_cardinality(mut self, n: usize) -> Self {
        self.leaf_cardinality = n;
        self
    }

    /// Set [`TreeConfig::inner_cardinality`].
    #[must_use]
    pub const fn with_inner_cardinality(mut self, n: usize) -> Self {
        self.inner_cardinality = n;
        self
    }

    /// Set [`TreeConfig::hash_buckets`].
    #[must_use]
    pub const fn with_hash_buckets(mut self, n: usize) -> Self {
        self.hash_buckets = n;
        self
    }

    /// Set [`TreeConfig::bucket_slots`].
    #[must_use]
    pub const fn with_bucket_slots(mut self, n: usize) -> Self {
        self.bucket_slots = n;
        self
    }

    /// Set [`TreeConfig::hash_funcs`].
    #[must_use]
    pub const fn with_hash_funcs(mut self, n: usize) -> Self {
        self.hash_funcs = n;
        self
    }

    /// Set [`TreeConfig::fill_factor`].
    #[must_use]
    pub const fn with_fill_factor(mut self, f: f64) -> Self {
        self.fill_factor = f;
        self
    }

    /// Set [`TreeConfig::linked_migration`].
    #[must_use]
    pub const fn with_linked_migration(mut self, on: bool) -> Self {
        self.linked_migration = on;
        self
    }

    /// Set [`TreeConfig::fingerprint`].
    #[must_use]
    pub const fn with_fingerprint(mut self, on: bool) -> Self {
        self.fingerprint = on;
        self
    }

    /// Set [`TreeConfig::initial_leaf`].
    #[must_use]
    pub const fn with_initial_leaf(mut self, kind: LeafKind) -> Self {
        self.initial_leaf = kind;
        self
    }

    /// Set [`TreeConfig::convert_threshold`].
    #[must_use]
    pub const fn with_convert_threshold(mut self, scans: u32) -> Self {
        self.convert_threshold = scans;
        self
    }

    /// Set [`TreeConfig::binary_search_threshold`].
    #[must_use]
    pub const fn with_binary_search_threshold(mut self, n: usize) -> Self {
        self.binary_search_threshold = n;
        self
    }

    /// Set [`TreeConfig::gc_threshold`].
    #[must_use]
    pub const fn with_gc_threshold(mut self, n: usize) -> Self {
        self.gc_threshold = n;
        self
    }

    /// Set [`TreeConfig::spin`].
    #[must_use]
    pub const fn with_spin(mut self, spin: SpinPolicy) -> Self {
        self.spin = spin;
        self
    }

    /// Set [`TreeConfig::poison_on_free`].
    #[must_use]
    pub const fn with_poison_on_free(mut self, on: bool) -> Self {
        self.poison_on_free = on;
        self
    }

    /// Set [`TreeConfig::hasher`].
    #[must_use]
    pub const fn with_hasher(mut self, hasher: HashFn) -> Self {
        self.hasher = hasher;
        self
    }
}
