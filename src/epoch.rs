//! Epoch-based reclamation.
//!
//! Optimistic readers dereference nodes without taking locks, so a node
//! that was unlinked cannot be freed while a reader might still hold its
//! pointer. Retired nodes wait in per-thread [`DeletionList`]s until every
//! registered thread has moved past the epoch in which they were retired.
//!
//! # Protocol
//!
//! ```text
//! enter_epoch            local_epoch = current_epoch
//! mark_for_deletion      push (node, current_epoch) onto the thread's list
//! exit_epoch_and_cleanup every 64 calls: current_epoch += 1
//!                        past gc_threshold: free batches stamped < min(local_epoch)
//! ```
//!
//! A thread outside any guard is quiescent (`local_epoch == u64::MAX`) and
//! never holds back reclamation.

use std::cell::{Cell, RefCell};
use std::fmt as StdFmt;
use std::marker::PhantomData;
use std::mem as StdMem;
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, fence};

use parking_lot::Mutex;

use crate::node::NodeBase;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, EPOCH_ORD, READ_ORD, RELAXED, WRITE_ORD};
use crate::tracing_helpers::{debug_log, trace_log};

/// Retired nodes per [`LabelDelete`] batch.
pub const ENTRY_NUM: usize = 32;

/// Exit calls between global epoch advances.
const ADVANCE_INTERVAL: u64 = 64;

/// Local epoch of a thread outside every guard.
const QUIESCENT: u64 = u64::MAX;

// ============================================================================
//  Retired
// ============================================================================

/// A type-erased node waiting for its grace period.
pub(crate) struct Retired {
    ptr: *mut NodeBase,
    reclaim: unsafe fn(*mut NodeBase),
}

// SAFETY: a retired node is unreachable; only the reclaimer touches it.
unsafe impl Send for Retired {}

impl Retired {
    /// # Safety
    ///
    /// `reclaim(ptr)` must be sound once no thread can reach `ptr`.
    pub(crate) const unsafe fn new(ptr: *mut NodeBase, reclaim: unsafe fn(*mut NodeBase)) -> Self {
        Self { ptr, reclaim }
    }

    fn free(self) {
        // SAFETY: construction contract; the grace period has elapsed.
        unsafe { (self.reclaim)(self.ptr) }
    }
}

impl StdFmt::Debug for Retired {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_tuple("Retired").field(&self.ptr).finish()
    }
}

// ============================================================================
//  LabelDelete / DeletionList
// ============================================================================

/// A batch of up to [`ENTRY_NUM`] retired nodes.
///
/// Stamped with the epoch of the most recent retirement, so the whole
/// batch becomes free together.
#[derive(Debug)]
pub struct LabelDelete {
    nodes: Vec<Retired>,
    epoch: u64,
}

impl LabelDelete {
    fn new() -> Self {
        Self {
            nodes: Vec::with_capacity(ENTRY_NUM),
            epoch: 0,
        }
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.nodes.len() >= ENTRY_NUM
    }

    /// Epoch stamp of the batch.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Nodes in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the batch holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Per-thread retirement list.
#[derive(Debug, Default)]
pub struct DeletionList {
    /// Batches still waiting, newest last.
    batches: Vec<LabelDelete>,
    /// Emptied batches kept for reuse.
    free: Vec<LabelDelete>,
    /// Retirements since the last collection attempt.
    threshold_counter: usize,
    /// Calls to `exit_epoch_and_cleanup`.
    exit_calls: u64,
}

impl DeletionList {
    fn add(&mut self, retired: Retired, epoch: u64) {
        self.threshold_counter += 1;

        if self.batches.last().is_none_or(LabelDelete::is_full) {
            let batch: LabelDelete = self.free.pop().unwrap_or_else(LabelDelete::new);
            self.batches.push(batch);
        }

        if let Some(batch) = self.batches.last_mut() {
            batch.nodes.push(retired);
            batch.epoch = epoch;
        }
    }

    /// Retired nodes still waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.batches.iter().map(LabelDelete::len).sum()
    }

    /// True if nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Batches held for reuse.
    #[must_use]
    pub fn free_batches(&self) -> usize {
        self.free.len()
    }

    /// Hand every batch stamped before `oldest` to `dispose`.
    fn collect(&mut self, oldest: u64, mut dispose: impl FnMut(Retired)) -> usize {
        let mut freed: usize = 0;
        let mut kept: Vec<LabelDelete> = Vec::with_capacity(self.batches.len());

        for mut batch in self.batches.drain(..) {
            if batch.epoch < oldest {
                freed += batch.nodes.len();
                batch.nodes.drain(..).for_each(&mut dispose);
                self.free.push(batch);
            } else {
                kept.push(batch);
            }
        }

        self.batches = kept;
        freed
    }
}

// ============================================================================
//  Participant
// ============================================================================

/// One registered thread's slot. Never freed before the [`Epoch`].
struct Participant {
    local_epoch: AtomicU64,
    active: AtomicBool,
    next: AtomicPtr<Participant>,
}

// ============================================================================
//  Epoch
// ============================================================================

/// Global epoch state for one tree.
pub struct Epoch {
    current_epoch: AtomicU64,
    /// Lock-free registry; entries are reused, never unlinked.
    participants: AtomicPtr<Participant>,
    gc_threshold: usize,
    poison_on_free: bool,
    /// Garbage left by exited threads.
    orphans: Mutex<Vec<LabelDelete>>,
    /// Poisoned nodes, held until the epoch drops.
    quarantine: Mutex<Vec<Retired>>,
    reclaimed: AtomicU64,
}

impl StdFmt::Debug for Epoch {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Epoch")
            .field("current_epoch", &self.current())
            .field("gc_threshold", &self.gc_threshold)
            .field("poison_on_free", &self.poison_on_free)
            .field("reclaimed", &self.reclaimed())
            .finish_non_exhaustive()
    }
}

impl Epoch {
    /// Start at epoch 0 with no registered threads.
    #[must_use]
    pub fn new(gc_threshold: usize, poison_on_free: bool) -> Self {
        Self {
            current_epoch: AtomicU64::new(0),
            participants: AtomicPtr::new(StdPtr::null_mut()),
            gc_threshold,
            poison_on_free,
            orphans: Mutex::new(Vec::new()),
            quarantine: Mutex::new(Vec::new()),
            reclaimed: AtomicU64::new(0),
        }
    }

    /// Current global epoch.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.current_epoch.load(EPOCH_ORD)
    }

    /// Nodes freed (or quarantined) so far.
    #[must_use]
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(RELAXED)
    }

    /// Register the calling thread.
    #[must_use]
    pub fn register(&self) -> ThreadInfo<'_> {
        ThreadInfo {
            epoch: self,
            participant: self.acquire_participant(),
            deletion: RefCell::new(DeletionList::default()),
            depth: Cell::new(0),
            _marker: PhantomData,
        }
    }

    fn acquire_participant(&self) -> &Participant {
        let mut cur: *mut Participant = self.participants.load(READ_ORD);

        while !cur.is_null() {
            // SAFETY: participants live until the epoch drops.
            let participant: &Participant = unsafe { &*cur };

            if participant
                .active
                .compare_exchange(false, true, CAS_SUCCESS, CAS_FAILURE)
                .is_ok()
            {
                trace_log!("reusing epoch participant");
                return participant;
            }

            cur = participant.next.load(READ_ORD);
        }

        let node: *mut Participant = Box::into_raw(Box::new(Participant {
            local_epoch: AtomicU64::new(QUIESCENT),
            active: AtomicBool::new(true),
            next: AtomicPtr::new(StdPtr::null_mut()),
        }));

        let mut head: *mut Participant = self.participants.load(READ_ORD);
        loop {
            // SAFETY: node is unpublished and exclusively ours.
            unsafe { (*node).next.store(head, RELAXED) };

            match self
                .participants
                .compare_exchange_weak(head, node, CAS_SUCCESS, CAS_FAILURE)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }

        // SAFETY: published; lives until the epoch drops.
        unsafe { &*node }
    }

    /// Publish the current epoch as the thread's watermark.
    pub fn enter_epoch(&self, ti: &ThreadInfo<'_>) {
        debug_assert!(StdPtr::eq(self, ti.epoch), "thread registered with another epoch");

        let depth: u32 = ti.depth.get();
        ti.depth.set(depth + 1);

        if depth == 0 {
            ti.participant
                .local_epoch
                .store(self.current_epoch.load(EPOCH_ORD), EPOCH_ORD);
            fence(EPOCH_ORD);
        }
    }

    /// Queue `retired` for freeing once its grace period has passed.
    pub(crate) fn mark_for_deletion(&self, retired: Retired, ti: &ThreadInfo<'_>) {
        // Orders the unlink that preceded this call before the stamp read.
        fence(EPOCH_ORD);
        let epoch: u64 = self.current_epoch.load(EPOCH_ORD);

        ti.deletion.borrow_mut().add(retired, epoch);
    }

    /// Leave the epoch, advancing the clock and collecting when due.
    pub fn exit_epoch_and_cleanup(&self, ti: &ThreadInfo<'_>) {
        if !self.leave(ti) {
            return;
        }

        let mut list = ti.deletion.borrow_mut();
        list.exit_calls += 1;

        if list.exit_calls % ADVANCE_INTERVAL == 0 {
            let _epoch: u64 = self.current_epoch.fetch_add(1, EPOCH_ORD) + 1;
            trace_log!(epoch = _epoch, "advanced global epoch");
        }

        if list.threshold_counter <= self.gc_threshold {
            return;
        }

        let oldest: u64 = self.oldest_epoch();
        let _freed: usize = list.collect(oldest, |retired| self.dispose(retired));

        // Survivors keep counting toward the next attempt.
        list.threshold_counter = list.len();
        drop(list);

        self.drain_orphans(oldest);

        debug_log!(freed = _freed, oldest, "epoch cleanup");
    }

    /// Leave the epoch without any cleanup work.
    pub fn exit_epoch(&self, ti: &ThreadInfo<'_>) {
        self.leave(ti);
    }

    /// Returns true when the outermost guard was left.
    fn leave(&self, ti: &ThreadInfo<'_>) -> bool {
        let depth: u32 = ti.depth.get();
        debug_assert!(depth > 0, "epoch exit without enter");

        ti.depth.set(depth.saturating_sub(1));

        if depth > 1 {
            return false;
        }

        ti.participant.local_epoch.store(QUIESCENT, EPOCH_ORD);
        true
    }

    /// Minimum local epoch over registered threads.
    fn oldest_epoch(&self) -> u64 {
        let mut oldest: u64 = QUIESCENT;
        let mut cur: *mut Participant = self.participants.load(READ_ORD);

        while !cur.is_null() {
            // SAFETY: participants live until the epoch drops.
            let participant: &Participant = unsafe { &*cur };
            oldest = oldest.min(participant.local_epoch.load(EPOCH_ORD));
            cur = participant.next.load(READ_ORD);
        }

        oldest
    }

    fn drain_orphans(&self, oldest: u64) {
        let Some(mut orphans) = self.orphans.try_lock() else {
            return;
        };

        orphans.retain_mut(|batch| {
            if batch.epoch < oldest {
                batch.nodes.drain(..).for_each(|retired| self.dispose(retired));
                false
            } else {
                true
            }
        });
    }

    fn dispose(&self, retired: Retired) {
        self.reclaimed.fetch_add(1, RELAXED);

        if self.poison_on_free {
            // SAFETY: the grace period has elapsed; no reader holds it.
            unsafe { (*retired.ptr).version().poison() };
            self.quarantine.lock().push(retired);
        } else {
            retired.free();
        }
    }

    /// Batches handed over by exited threads.
    #[must_use]
    pub fn orphan_batches(&self) -> usize {
        self.orphans.lock().len()
    }

    /// Number of registered participant slots.
    #[must_use]
    pub fn participants(&self) -> usize {
        let mut count: usize = 0;
        let mut cur: *mut Participant = self.participants.load(READ_ORD);

        while !cur.is_null() {
            count += 1;
            // SAFETY: participants live until the epoch drops.
            cur = unsafe { (*cur).next.load(READ_ORD) };
        }

        count
    }
}

impl Drop for Epoch {
    fn drop(&mut self) {
        // Every ThreadInfo borrowed self and is gone.
        for mut batch in StdMem::take(self.orphans.get_mut()) {
            batch.nodes.drain(..).for_each(Retired::free);
        }

        for retired in StdMem::take(self.quarantine.get_mut()) {
            retired.free();
        }

        let mut cur: *mut Participant = *self.participants.get_mut();
        while !cur.is_null() {
            // SAFETY: allocated by acquire_participant, unreachable now.
            let participant: Box<Participant> = unsafe { Box::from_raw(cur) };
            cur = participant.next.load(RELAXED);
        }
    }
}

// ============================================================================
//  ThreadInfo
// ============================================================================

/// A thread's registration with a tree's epoch.
///
/// Create one per worker thread with [`Tree::thread_info`] and pass it to
/// every operation. Not `Send`: the deletion list is thread-local state.
///
/// Dropping it marks the thread quiescent and hands any garbage that is
/// not yet free to the epoch's orphan list.
///
/// [`Tree::thread_info`]: crate::Tree::thread_info
pub struct ThreadInfo<'t> {
    epoch: &'t Epoch,
    participant: &'t Participant,
    deletion: RefCell<DeletionList>,
    depth: Cell<u32>,
    _marker: PhantomData<*mut ()>,
}

impl StdFmt::Debug for ThreadInfo<'_> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("ThreadInfo")
            .field("local_epoch", &self.local_epoch())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl<'t> ThreadInfo<'t> {
    /// The epoch this thread is registered with.
    #[must_use]
    pub const fn epoch(&self) -> &'t Epoch {
        self.epoch
    }

    /// This thread's watermark, `u64::MAX` while outside every guard.
    #[must_use]
    pub fn local_epoch(&self) -> u64 {
        self.participant.local_epoch.load(EPOCH_ORD)
    }

    /// Retired nodes this thread is still holding.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.deletion.borrow().len()
    }

    /// Emptied batches kept for reuse.
    #[must_use]
    pub fn free_batches(&self) -> usize {
        self.deletion.borrow().free_batches()
    }
}

impl Drop for ThreadInfo<'_> {
    fn drop(&mut self) {
        self.participant.local_epoch.store(QUIESCENT, EPOCH_ORD);

        let list: &mut DeletionList = self.deletion.get_mut();
        if !list.is_empty() {
            let oldest: u64 = self.epoch.oldest_epoch();
            list.collect(oldest, |retired| self.epoch.dispose(retired));
        }

        if !list.is_empty() {
            let leftover: Vec<LabelDelete> = StdMem::take(&mut list.batches);
            debug_log!(batches = leftover.len(), "orphaning retired nodes");
            self.epoch.orphans.lock().extend(leftover);
        }

        self.participant.active.store(false, WRITE_ORD);
    }
}

// ============================================================================
//  Guards
// ============================================================================

/// Scope of a mutating operation: enter on creation, exit and clean up on drop.
#[must_use = "the epoch is left as soon as the guard drops"]
pub struct EpochGuard<'a, 't> {
    ti: &'a ThreadInfo<'t>,
}

impl<'a, 't> EpochGuard<'a, 't> {
    /// Enter the epoch.
    pub fn new(ti: &'a ThreadInfo<'t>) -> Self {
        ti.epoch.enter_epoch(ti);
        Self { ti }
    }

    /// Retire a node through this guard's thread.
    pub(crate) fn retire(&self, retired: Retired) {
        self.ti.epoch.mark_for_deletion(retired, self.ti);
    }
}

impl Drop for EpochGuard<'_, '_> {
    fn drop(&mut self) {
        self.ti.epoch.exit_epoch_and_cleanup(self.ti);
    }
}

/// Scope of a read-only operation: enter on creation, leave without
/// cleanup on drop.
#[must_use = "the epoch is left as soon as the guard drops"]
pub struct EpochGuardReadonly<'a, 't> {
    ti: &'a ThreadInfo<'t>,
}

impl<'a, 't> EpochGuardReadonly<'a, 't> {
    /// Enter the epoch.
    pub fn new(ti: &'a ThreadInfo<'t>) -> Self {
        ti.epoch.enter_epoch(ti);
        Self { ti }
    }
}

impl Drop for EpochGuardReadonly<'_, '_> {
    fn drop(&mut self) {
        self.ti.epoch.exit_epoch(self.ti);
    }
}
