//! Hash leaf bucket.
//!
//! A bucket is a small unordered slot array with its own version lock, so
//! writers to different buckets of one leaf never serialize. Each slot is
//! `(fingerprint, key, value)`; a zero fingerprint marks the slot empty.
//!
//! Writers publish a slot by storing key and value first and the
//! fingerprint last. Readers go through the bucket's version like any
//! other optimistic read.

use std::fmt as StdFmt;
use std::sync::atomic::{AtomicU8, AtomicU64};

use crate::nodeversion::NodeVersion;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};

/// Migration state of a bucket during a linked hash leaf split.
///
/// For a split pair `(left, right)` and bucket index `j`,
/// `left[j]` is `LinkedLeft` exactly when `right[j]` is `LinkedRight`.
/// While linked, `right[j]` is empty and its entries still sit in `left[j]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BucketState {
    /// Holds exactly its own entries.
    Stable = 0,
    /// Also holds entries that belong to the right sibling.
    LinkedLeft = 1,
    /// Entries still live in the left sibling's bucket.
    LinkedRight = 2,
}

impl BucketState {
    #[inline(always)]
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::LinkedLeft,
            2 => Self::LinkedRight,
            _ => Self::Stable,
        }
    }
}

/// One slot.
struct Slot {
    fingerprint: AtomicU8,
    key: AtomicU64,
    value: AtomicU64,
}

impl Slot {
    const fn empty() -> Self {
        Self {
            fingerprint: AtomicU8::new(0),
            key: AtomicU64::new(0),
            value: AtomicU64::new(0),
        }
    }
}

/// A bucket of a hash leaf.
pub struct Bucket {
    lock: NodeVersion,
    state: AtomicU8,
    slots: Box<[Slot]>,
}

impl StdFmt::Debug for Bucket {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Bucket")
            .field("version", &self.lock.value())
            .field("state", &self.state())
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Bucket {
    pub(crate) fn new(slots: usize) -> Self {
        Self {
            lock: NodeVersion::new(),
            state: AtomicU8::new(BucketState::Stable as u8),
            slots: (0..slots).map(|_| Slot::empty()).collect(),
        }
    }

    #[inline(always)]
    pub(crate) const fn lock(&self) -> &NodeVersion {
        &self.lock
    }

    #[inline(always)]
    pub(crate) fn state(&self) -> BucketState {
        BucketState::from_u8(self.state.load(READ_ORD))
    }

    /// Caller holds the bucket lock.
    #[inline(always)]
    pub(crate) fn set_state(&self, state: BucketState) {
        self.state.store(state as u8, WRITE_ORD);
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Occupied slots. Unvalidated.
    pub(crate) fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.fingerprint.load(READ_ORD) != 0)
            .count()
    }

    /// Slot holding `key`, checking the fingerprint before the key.
    #[inline]
    pub(crate) fn find(&self, key: u64, fingerprint: u8) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.fingerprint.load(READ_ORD) == fingerprint && slot.key.load(READ_ORD) == key
        })
    }

    #[inline(always)]
    pub(crate) fn value_at(&self, index: usize) -> u64 {
        self.slots[index].value.load(READ_ORD)
    }

    /// Swap the value in an occupied slot. Caller holds the bucket lock.
    #[inline]
    pub(crate) fn replace_value(&self, index: usize, value: u64) -> u64 {
        let old: u64 = self.slots[index].value.load(RELAXED);
        self.slots[index].value.store(value, WRITE_ORD);
        old
    }

    /// Store into the first empty slot. Caller holds the bucket lock.
    pub(crate) fn insert(&self, fingerprint: u8, key: u64, value: u64) -> bool {
        debug_assert_ne!(fingerprint, 0, "zero fingerprint marks an empty slot");

        let Some(slot) = self
            .slots
            .iter()
            .find(|slot| slot.fingerprint.load(RELAXED) == 0)
        else {
            return false;
        };

        slot.key.store(key, WRITE_ORD);
        slot.value.store(value, WRITE_ORD);
        slot.fingerprint.store(fingerprint, WRITE_ORD);
        true
    }

    /// Empty a slot. Caller holds the bucket lock.
    #[inline]
    pub(crate) fn clear(&self, index: usize) {
        self.slots[index].fingerprint.store(0, WRITE_ORD);
    }

    /// Occupied slots as `(index, fingerprint, key, value)`. Unvalidated.
    pub(crate) fn occupied(&self) -> impl Iterator<Item = (usize, u8, u64, u64)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let fingerprint: u8 = slot.fingerprint.load(READ_ORD);
            (fingerprint != 0).then(|| {
                (
                    index,
                    fingerprint,
                    slot.key.load(READ_ORD),
                    slot.value.load(READ_ORD),
                )
            })
        })
    }

    /// Move every entry whose key satisfies `moves` into `dest`.
    ///
    /// Caller holds both bucket locks; `dest` must have room.
    pub(crate) fn migrate(&self, dest: &Self, mut moves: impl FnMut(u64) -> bool) -> usize {
        let mut moved: usize = 0;

        for (index, fingerprint, key, value) in self.occupied() {
            if moves(key) {
                let ok: bool = dest.insert(fingerprint, key, value);
                debug_assert!(ok, "migration target bucket overflowed");
                self.clear(index);
                moved += 1;
            }
        }

        moved
    }
}
