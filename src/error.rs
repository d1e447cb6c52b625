//! Status signals and error types.
//!
//! Most signals never leave the crate: [`Restart`] drives the optimistic
//! retry loops and [`Status`] names the outcome of a node-level operation.
//! [`InvariantViolation`] and [`ConfigError`] are the two public errors.

use std::error::Error;
use std::fmt as StdFmt;

// ============================================================================
//  Restart
// ============================================================================

/// A version check failed; the whole operation must restart from the root.
///
/// Zero-sized so optimistic paths can use `?` on it without cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restart;

impl StdFmt::Display for Restart {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.write_str("need restart")
    }
}

impl Error for Restart {}

// ============================================================================
//  Status
// ============================================================================

/// Outcome of an operation on a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The entry was inserted.
    InsertSuccess,
    /// The entry's value was replaced.
    UpdateSuccess,
    /// The entry was removed.
    RemoveSuccess,
    /// A version changed underneath the operation.
    NeedRestart,
    /// The node is at capacity.
    NeedSplit,
    /// The hash leaf should become sorted leaves.
    NeedConvert,
    /// The target key is absent.
    KeyNotFound,
}

impl Status {
    /// Name of the signal as it appears in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::InsertSuccess => "InsertSuccess",
            Self::UpdateSuccess => "UpdateSuccess",
            Self::RemoveSuccess => "RemoveSuccess",
            Self::NeedRestart => "NeedRestart",
            Self::NeedSplit => "NeedSplit",
            Self::NeedConvert => "NeedConvert",
            Self::KeyNotFound => "KeyNotFound",
        }
    }

    /// True for the three success signals.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(
            self,
            Self::InsertSuccess | Self::UpdateSuccess | Self::RemoveSuccess
        )
    }
}

impl StdFmt::Display for Status {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
//  InvariantViolation
// ============================================================================

/// A structural invariant found broken by [`Tree::sanity_check`].
///
/// Any of these means the index is corrupt; callers should treat it as fatal.
///
/// [`Tree::sanity_check`]: crate::Tree::sanity_check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Keys inside one node are not strictly ascending.
    KeyOrder {
        /// Level of the offending node.
        level: u32,
        /// Position of the first out-of-order key.
        index: usize,
    },
    /// A node holds a key above its high key.
    HighKeyBound {
        /// Level of the offending node.
        level: u32,
        /// Debug rendering of the key.
        key: String,
        /// Debug rendering of the high key.
        high_key: String,
    },
    /// A sibling holds a key not above its left neighbour's high key.
    SiblingOrder {
        /// Level of the offending pair.
        level: u32,
        /// Debug rendering of the left neighbour's high key.
        high_key: String,
        /// Debug rendering of the sibling's smallest key.
        sibling_min: String,
    },
    /// A node's entry count exceeds its capacity.
    CountOverflow {
        /// Level of the offending node.
        level: u32,
        /// Recorded entry count.
        count: usize,
        /// Node capacity.
        capacity: usize,
    },
    /// A child's level is not one below its parent's.
    LevelMismatch {
        /// Level of the parent.
        parent: u32,
        /// Level found on the child.
        child: u32,
    },
    /// A reachable node is marked obsolete.
    ObsoleteReachable {
        /// Level of the node.
        level: u32,
    },
}

impl StdFmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::KeyOrder { level, index } => {
                write!(f, "keys out of order at level {level}, index {index}")
            }

            Self::HighKeyBound {
                level,
                key,
                high_key,
            } => write!(
                f,
                "key {key} exceeds high key {high_key} at level {level}"
            ),

            Self::SiblingOrder {
                level,
                high_key,
                sibling_min,
            } => write!(
                f,
                "sibling minimum {sibling_min} not above high key {high_key} at level {level}"
            ),

            Self::CountOverflow {
                level,
                count,
                capacity,
            } => write!(
                f,
                "count {count} exceeds capacity {capacity} at level {level}"
            ),

            Self::LevelMismatch { parent, child } => {
                write!(f, "child at level {child} under parent at level {parent}")
            }

            Self::ObsoleteReachable { level } => {
                write!(f, "obsolete node reachable at level {level}")
            }
        }
    }
}

impl Error for InvariantViolation {}

// ============================================================================
//  ConfigError
// ============================================================================

/// A [`TreeConfig`](crate::TreeConfig) value outside its supported range.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Sorted leaves must hold at least two entries so a split has two halves.
    LeafCardinality(usize),
    /// Inner nodes must hold at least two separators.
    InnerCardinality(usize),
    /// A hash leaf needs at least one bucket.
    HashBuckets(usize),
    /// Bucket slot count must be in `1..=MAX_BUCKET_SLOTS`.
    BucketSlots(usize),
    /// Hash function count must be in `1..=MAX_HASH_FUNCS`.
    HashFuncs(usize),
    /// Fill factor must be in `(0, 1]`.
    FillFactor(f64),
    /// Page size too small to hold a node header and two entries.
    PageSize(usize),
}

impl StdFmt::Display for ConfigError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::LeafCardinality(n) => write!(f, "leaf cardinality {n} is below 2"),
            Self::InnerCardinality(n) => write!(f, "inner cardinality {n} is below 2"),
            Self::HashBuckets(n) => write!(f, "hash leaf bucket count {n} is zero"),
            Self::BucketSlots(n) => write!(f, "bucket slot count {n} is out of range"),
            Self::HashFuncs(n) => write!(f, "hash function count {n} is out of range"),
            Self::FillFactor(x) => write!(f, "fill factor {x} is outside (0, 1]"),
            Self::PageSize(n) => write!(f, "page size {n} cannot hold two entries"),
        }
    }
}

impl Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names() {
        assert_eq!(Status::NeedRestart.to_string(), "NeedRestart");
        assert_eq!(Status::KeyNotFound.to_string(), "KeyNotFound");
        assert_eq!(Status::NeedConvert.to_string(), "NeedConvert");
    }

    #[test]
    fn test_status_success() {
        assert!(Status::InsertSuccess.is_success());
        assert!(Status::RemoveSuccess.is_success());
        assert!(!Status::NeedSplit.is_success());
        assert!(!Status::KeyNotFound.is_success());
    }

    #[test]
    fn test_violation_display() {
        let err = InvariantViolation::KeyOrder { level: 1, index: 3 };
        assert_eq!(err.to_string(), "keys out of order at level 1, index 3");

        let err = ConfigError::FillFactor(1.5);
        assert_eq!(err.to_string(), "fill factor 1.5 is outside (0, 1]");
    }
}
