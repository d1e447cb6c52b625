//! Common node header and typed views.
//!
//! Every node struct is `#[repr(C)]` with a [`NodeBase`] as its first
//! field, so a `*mut NodeBase` can be cast to the concrete node once
//! [`NodeBase::kind`] is known. Kind and level never change after
//! construction and are safe to read without validation.
//!
//! # Fences
//!
//! A node with a sibling owns keys `<= high_key`; the sibling owns keys
//! `> high_key`. The rightmost node of a level has a null sibling and its
//! high key word is meaningless. Both fields change together, under the
//! node's write lock.

use std::fmt as StdFmt;
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize};

use crate::internode::INode;
use crate::key::{IndexKey, IndexValue, Word};
use crate::leaf::LeafRef;
use crate::leaf::btree::LNodeBTree;
use crate::leaf::hash::LNodeHash;
use crate::nodeversion::NodeVersion;
use crate::ordering::{READ_ORD, WRITE_ORD};

/// Concrete type behind a [`NodeBase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    /// [`INode`].
    Inner,
    /// [`LNodeBTree`].
    SortedLeaf,
    /// [`LNodeHash`].
    HashLeaf,
}

/// Header shared by every node.
#[repr(C)]
pub struct NodeBase {
    version: NodeVersion,
    kind: NodeKind,
    level: u32,
    count: AtomicUsize,
    sibling: AtomicPtr<NodeBase>,
    high_key: AtomicU64,
}

impl StdFmt::Debug for NodeBase {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("NodeBase")
            .field("version", &self.version.value())
            .field("kind", &self.kind)
            .field("level", &self.level)
            .field("count", &self.count())
            .field("sibling", &self.sibling())
            .finish_non_exhaustive()
    }
}

impl NodeBase {
    pub(crate) const fn new(kind: NodeKind, level: u32) -> Self {
        Self {
            version: NodeVersion::new(),
            kind,
            level,
            count: AtomicUsize::new(0),
            sibling: AtomicPtr::new(StdPtr::null_mut()),
            high_key: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub(crate) const fn version(&self) -> &NodeVersion {
        &self.version
    }

    #[inline(always)]
    pub(crate) const fn kind(&self) -> NodeKind {
        self.kind
    }

    /// 0 for leaves.
    #[inline(always)]
    pub(crate) const fn level(&self) -> u32 {
        self.level
    }

    /// Entry count. Unvalidated; may exceed capacity under a racing writer.
    #[inline(always)]
    pub(crate) fn count(&self) -> usize {
        self.count.load(READ_ORD)
    }

    #[inline(always)]
    pub(crate) fn set_count(&self, count: usize) {
        self.count.store(count, WRITE_ORD);
    }

    #[inline(always)]
    pub(crate) fn sibling(&self) -> *mut NodeBase {
        self.sibling.load(READ_ORD)
    }

    /// High key, or `None` for the rightmost node of a level.
    #[inline]
    pub(crate) fn high_key<K: Word>(&self) -> Option<K> {
        if self.sibling().is_null() {
            None
        } else {
            Some(K::from_word(self.high_key.load(READ_ORD)))
        }
    }

    /// Set sibling and high key together. Caller holds the write lock.
    ///
    /// The high key is stored first so a reader that sees the new sibling
    /// also sees the fence that goes with it.
    #[inline]
    pub(crate) fn set_fence<K: Word>(&self, sibling: *mut NodeBase, high_key: Option<K>) {
        self.high_key
            .store(high_key.map_or(0, Word::to_word), WRITE_ORD);
        self.sibling.store(sibling, WRITE_ORD);
    }

    /// Copy another node's sibling and high key.
    #[inline]
    pub(crate) fn inherit_fence(&self, from: &Self) {
        self.high_key
            .store(from.high_key.load(READ_ORD), WRITE_ORD);
        self.sibling.store(from.sibling(), WRITE_ORD);
    }

    /// Sibling to move right to, if `key` is beyond this node's high key.
    #[inline]
    pub(crate) fn move_right<K: IndexKey>(&self, key: K) -> Option<*mut NodeBase> {
        let sibling: *mut NodeBase = self.sibling();

        if sibling.is_null() {
            return None;
        }

        let high_key: K = K::from_word(self.high_key.load(READ_ORD));
        (high_key < key).then_some(sibling)
    }
}

// ============================================================================
//  Typed Views
// ============================================================================

/// A node resolved to its concrete type.
pub(crate) enum NodeRef<'g, K: IndexKey, V: IndexValue> {
    Inner(&'g INode<K>),
    Leaf(LeafRef<'g, K, V>),
}

impl<'g, K: IndexKey, V: IndexValue> NodeRef<'g, K, V> {
    /// Resolve `ptr` by its kind tag.
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null and point to a live node of this tree, kept
    /// alive for `'g` by an epoch guard.
    #[inline]
    pub(crate) unsafe fn from_ptr(ptr: *mut NodeBase) -> Self {
        // SAFETY: caller guarantees a live node; kind is immutable.
        let kind: NodeKind = unsafe { (*ptr).kind() };

        // SAFETY: repr(C) with NodeBase first; kind selects the layout.
        unsafe {
            match kind {
                NodeKind::Inner => Self::Inner(&*ptr.cast::<INode<K>>()),
                NodeKind::SortedLeaf => {
                    Self::Leaf(LeafRef::Sorted(&*ptr.cast::<LNodeBTree<K, V>>()))
                }
                NodeKind::HashLeaf => Self::Leaf(LeafRef::Hashed(&*ptr.cast::<LNodeHash<K, V>>())),
            }
        }
    }
}

/// Resolve a node that is known to be inner.
///
/// # Safety
///
/// As [`NodeRef::from_ptr`], and the node's level is above 0.
#[inline(always)]
pub(crate) unsafe fn inner_ref<'g, K: IndexKey>(ptr: *mut NodeBase) -> &'g INode<K> {
    // SAFETY: caller guarantees an inner node.
    unsafe {
        debug_assert_eq!((*ptr).kind(), NodeKind::Inner);
        &*ptr.cast::<INode<K>>()
    }
}

/// Resolve a header without knowing its type.
///
/// # Safety
///
/// As [`NodeRef::from_ptr`].
#[inline(always)]
pub(crate) unsafe fn base_ref<'g>(ptr: *mut NodeBase) -> &'g NodeBase {
    // SAFETY: caller guarantees a live node.
    unsafe { &*ptr }
}

// ============================================================================
//  Allocation
// ============================================================================

/// Move a node onto the heap and erase its type.
pub(crate) fn into_raw<T>(node: T) -> *mut NodeBase {
    Box::into_raw(Box::new(node)).cast::<NodeBase>()
}

/// Free a node of any kind.
///
/// # Safety
///
/// - `ptr` came from [`into_raw`] on a node of this `K`, `V` tree.
/// - No thread can reach `ptr` any more.
pub(crate) unsafe fn reclaim_node<K: IndexKey, V: IndexValue>(ptr: *mut NodeBase) {
    // SAFETY: caller guarantees ptr is live and exclusively owned.
    let kind: NodeKind = unsafe { (*ptr).kind() };

    // SAFETY: kind selects the allocation's real type.
    unsafe {
        match kind {
            NodeKind::Inner => drop(Box::from_raw(ptr.cast::<INode<K>>())),
            NodeKind::SortedLeaf => drop(Box::from_raw(ptr.cast::<LNodeBTree<K, V>>())),
            NodeKind::HashLeaf => drop(Box::from_raw(ptr.cast::<LNodeHash<K, V>>())),
        }
    }
}
