//! Versioned lock for optimistic concurrency control.
//!
//! [`NodeVersion`] packs a version counter and two state bits into one
//! `u64`. Readers never block: they take a version, read, and validate.
//! Writers hold a [`LockGuard`].
//!
//! # Layout
//!
//! ```text
//! bits 2..64: counter | bit 1: locked | bit 0: obsolete
//! ```
//!
//! Locking adds 2 (sets the lock bit). Unlocking adds 2 again, which
//! carries the lock bit into the counter. Unlocking as obsolete adds 3,
//! leaving the obsolete bit set forever.
//!
//! # Concurrency Model
//! 1. Readers: `read_version()`, read the node, `validate()`.
//! 2. Writers: `try_upgrade_write_lock(v)` from a read version, or
//!    `write_lock()` when the caller must make progress. Drop the guard.
//!
//! Every failure is a [`Restart`]: the caller abandons its whole operation
//! and starts again from the root.

use std::marker::PhantomData;
use std::mem as StdMem;
use std::sync::atomic::AtomicU64;

use crate::config::SpinPolicy;
use crate::error::Restart;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, RELAXED, UNLOCK_ORD, VERSION_ORD, WRITE_ORD};



// ============================================================================
//  Bit Constants
// ============================================================================

/// Obsolete bit: the node was retired and must not be used.
const OBSOLETE_BIT: u64 = 0b01;

/// Lock bit: a writer holds the node.
const LOCK_BIT: u64 = 0b10;

/// Either state bit.
const STATE_MASK: u64 = LOCK_BIT | OBSOLETE_BIT;

/// Version written into reclaimed nodes when poisoning is on.
///
/// Both state bits are set, so every lock path already rejects it;
/// `read_version` additionally panics on it.
pub const POISON: u64 = 0xDEAD_BEEF_DEAD_BEEF;

// ============================================================================
//  NodeVersion
// ============================================================================

/// A versioned lock word.
///
/// # Example
///
/// ```rust
/// use blinkhash::nodeversion::NodeVersion;
///
/// let v = NodeVersion::new();
/// let before = v.read_version().unwrap();
///
/// {
///     let _guard = v.try_write_lock().unwrap();
///     assert!(v.read_version().is_err());
/// }
///
/// assert!(v.validate(before).is_err());
/// assert!(v.read_version().is_ok());
/// ```
#[derive(Debug)]
pub struct NodeVersion {
    value: AtomicU64,
}

/// Proof that the write lock is held.
///
/// Releases the lock on drop (adds 2), including during unwinding.
/// [`LockGuard::unlock_obsolete`] releases and retires the node instead.
///
/// `PhantomData<*mut ()>` keeps the guard on the thread that locked.
#[derive(Debug)]
#[must_use = "releasing a lock without using the guard is a logic error"]
pub struct LockGuard<'a> {
    version: &'a NodeVersion,
    _marker: PhantomData<*mut ()>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let value: u64 = self.version.value.load(RELAXED);
        debug_assert!(value & LOCK_BIT != 0, "unlocking a node that is not locked");

        self.version.value.store(value + LOCK_BIT, UNLOCK_ORD);
    }
}

impl LockGuard<'_> {
    /// Version value while locked.
    #[inline]
    #[must_use]
    pub fn locked_value(&self) -> u64 {
        self.version.value.load(RELAXED)
    }

    /// Release the lock and mark the node obsolete.
    ///
    /// Readers holding an older version fail validation; new readers fail
    /// `read_version`. Both restart and re-resolve through the parent.
    #[inline]
    pub fn unlock_obsolete(self) {
        let value: u64 = self.version.value.load(RELAXED);
        self.version
            .value
            .store(value + LOCK_BIT + OBSOLETE_BIT, UNLOCK_ORD);

        StdMem::forget(self);
    }
}

impl NodeVersion {
    /// A fresh, unlocked version.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Raw value.
    #[inline]
    #[must_use]
    pub fn value(&self) -> u64 {
        self.value.load(VERSION_ORD)
    }

    /// True while a writer holds the lock.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.value.load(VERSION_ORD) & LOCK_BIT != 0
    }

    /// True once the node was retired.
    #[inline]
    #[must_use]
    pub fn is_obsolete(&self) -> bool {
        self.value.load(VERSION_ORD) & OBSOLETE_BIT != 0
    }

    // ========================================================================
    //  Optimistic Reads
    // ========================================================================

    /// Take a version for an optimistic read.
    ///
    /// # Errors
    ///
    /// [`Restart`] if the node is locked or obsolete.
    ///
    /// # Panics
    ///
    /// If the node was poisoned by reclamation.
    #[inline]
    pub fn read_version(&self) -> Result<u64, Restart> {
        let value: u64 = self.value.load(VERSION_ORD);
        assert!(value != POISON, "node read after reclamation");

        if value & STATE_MASK == 0 {
            Ok(value)
        } else {
            Err(Restart)
        }
    }

    /// Check that nothing changed since `version` was read.
    ///
    /// # Errors
    ///
    /// [`Restart`] on any change, including a lock taken and not yet released.
    #[inline]
    pub fn validate(&self, version: u64) -> Result<(), Restart> {
        if self.value.load(VERSION_ORD) == version {
            Ok(())
        } else {
            Err(Restart)
        }
    }

    // ========================================================================
    //  Lock Operations
    // ========================================================================

    /// Take the lock without waiting.
    #[inline]
    #[must_use]
    pub fn try_write_lock(&self) -> Option<LockGuard<'_>> {
        let value: u64 = self.value.load(VERSION_ORD);

        if value & STATE_MASK != 0 {
            return None;
        }

        self.value
            .compare_exchange(value, value + LOCK_BIT, CAS_SUCCESS, CAS_FAILURE)
            .ok()
            .map(|_| self.guard())
    }

    /// Take the lock, waiting per `spin` while another writer holds it.
    ///
    /// # Errors
    ///
    /// [`Restart`] if the node is, or becomes, obsolete.
    pub fn write_lock(&self, spin: SpinPolicy) -> Result<LockGuard<'_>, Restart> {
        let mut attempt: u32 = 0;

        loop {
            let value: u64 = self.value.load(VERSION_ORD);
            assert!(value != POISON, "node locked after reclamation");

            if value & OBSOLETE_BIT != 0 {
                return Err(Restart);
            }

            if value & LOCK_BIT == 0
                && self
                    .value
                    .compare_exchange_weak(value, value + LOCK_BIT, CAS_SUCCESS, CAS_FAILURE)
                    .is_ok()
            {
                return Ok(self.guard());
            }

            spin.wait(attempt);
            attempt = attempt.saturating_add(1);
        }
    }

    /// Upgrade an optimistic read to the write lock.
    ///
    /// # Errors
    ///
    /// [`Restart`] if the version moved since `version` was read.
    #[inline]
    pub fn try_upgrade_write_lock(&self, version: u64) -> Result<LockGuard<'_>, Restart> {
        debug_assert!(version & STATE_MASK == 0, "upgrading from a locked version");

        self.value
            .compare_exchange(version, version + LOCK_BIT, CAS_SUCCESS, CAS_FAILURE)
            .map(|_| self.guard())
            .map_err(|_| Restart)
    }

    /// Overwrite the version with [`POISON`].
    ///
    /// Only for nodes no thread can reach any more.
    pub(crate) fn poison(&self) {
        self.value.store(POISON, WRITE_ORD);
    }

    #[inline(always)]
    const fn guard(&self) -> LockGuard<'_> {
        LockGuard {
            version: self,
            _marker: PhantomData,
        }
    }
}

impl Default for NodeVersion {
    fn default() -> Self {
        Self::new()
    }
}
