//! Named memory orderings for node, bucket, and epoch access.
//!
//! Every atomic access in the crate goes through one of these so the pairing
//! between writers and optimistic readers stays visible at the call site.

use std::sync::atomic::Ordering;

/// Reading node or bucket fields during an optimistic read.
/// Pairs with the writer's `WRITE_ORD` stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Writing node or bucket fields while the lock is held.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Successful compare-and-swap on a lock word or the root pointer.
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Failed compare-and-swap: only the current value is needed.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Loads and stores inside a locked region, or on counters nobody validates.
pub const RELAXED: Ordering = Ordering::Relaxed;

/// Version loads taken before and after an optimistic read.
pub const VERSION_ORD: Ordering = Ordering::Acquire;

/// Version store that releases a lock.
pub const UNLOCK_ORD: Ordering = Ordering::Release;

/// Epoch announcements and the oldest-epoch scan.
///
/// The local-epoch store and the unlink/scan pair form a store-load pattern,
/// which needs sequential consistency on both sides.
pub const EPOCH_ORD: Ordering = Ordering::SeqCst;
