//! The thread registry: one profiling slot per profiled thread.
//!
//! Slots live in a fixed-size table and are handed out in creation order by a
//! single atomic counter. After a slot is bound to its thread (through a
//! thread-local reference), only that thread writes to it. The finalizer reads
//! all counters once the threads have exited.
//!
//! A slot's lifetime ends when its binding is dropped: normally when the
//! thread body returns, otherwise when the thread's locals are destroyed,
//! which also happens for threads that leave through `pthread_exit`.
//!
//! Every counter is an atomic so those reads are well defined, but the owner
//! never needs a read-modify-write: with a single writer, a relaxed load
//! followed by a relaxed store is enough.

use crate::accumulator::WaitSample;
use crate::clock;
use crate::format::LOG_MAX_CTRS;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::error::Error;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

pub const MAX_PROFILED_THREADS: usize = 128;

/// Index of a slot, equal to the thread's creation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub(crate) usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Unused = 0,
    /// Allocated at thread creation, thread body not running yet.
    Reserved = 1,
    /// Bound to its thread, body running.
    Active = 2,
    /// Body returned; the slot is frozen.
    Finished = 3,
}

impl SlotState {
    fn from_u8(value: u8) -> SlotState {
        match value {
            1 => SlotState::Reserved,
            2 => SlotState::Active,
            3 => SlotState::Finished,
            _ => SlotState::Unused,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegistryError {
    Full { capacity: usize },
    AlreadyBound { current: SlotId },
    UnknownSlot(SlotId),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Full { capacity } => {
                write!(f, "thread registry is full ({} threads)", capacity)
            }
            RegistryError::AlreadyBound { current } => {
                write!(f, "thread is already bound to slot {}", current)
            }
            RegistryError::UnknownSlot(id) => write!(f, "slot {} was never allocated", id),
        }
    }
}

impl Error for RegistryError {}

#[derive(Debug)]
pub struct ThreadSlot {
    state: AtomicU8,
    core: AtomicI32,

    pub(crate) mutex_spin: AtomicU64,
    pub(crate) rwlock_spin: AtomicU64,
    pub(crate) barrier_spin: AtomicU64,

    // Spin accumulated since the last barrier, consumed by the reduction.
    pub(crate) mutex_spin_local: AtomicU64,
    pub(crate) rwlock_spin_local: AtomicU64,

    pub(crate) tsc_start: AtomicU64,
    pub(crate) tsc_end: AtomicU64,

    // Published at the last barrier.
    pub(crate) arrival_no_spinning: AtomicU64,

    pub(crate) pmc: [AtomicU64; LOG_MAX_CTRS],

    // Filled once, when the thread body returns.
    samples: Mutex<Vec<WaitSample>>,
}

impl Default for ThreadSlot {
    fn default() -> Self {
        ThreadSlot {
            state: AtomicU8::new(SlotState::Unused as u8),
            core: AtomicI32::new(-1),
            mutex_spin: AtomicU64::new(0),
            rwlock_spin: AtomicU64::new(0),
            barrier_spin: AtomicU64::new(0),
            mutex_spin_local: AtomicU64::new(0),
            rwlock_spin_local: AtomicU64::new(0),
            tsc_start: AtomicU64::new(0),
            tsc_end: AtomicU64::new(0),
            arrival_no_spinning: AtomicU64::new(0),
            pmc: Default::default(),
            samples: Mutex::new(Vec::new()),
        }
    }
}

/// Add `delta` to a counter that only the calling thread writes.
#[inline(always)]
pub(crate) fn bump(counter: &AtomicU64, delta: u64) {
    counter.store(
        counter.load(Ordering::Relaxed).wrapping_add(delta),
        Ordering::Relaxed,
    );
}

impl ThreadSlot {
    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SlotState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Core the owning thread should pin itself to.
    pub fn core_hint(&self) -> Option<usize> {
        let core = self.core.load(Ordering::Relaxed);
        if core < 0 {
            None
        } else {
            Some(core as usize)
        }
    }

    pub(crate) fn freeze_samples(&self, samples: Vec<WaitSample>) {
        *self.samples.lock() = samples;
    }

    /// Copy of the wait samples frozen when the thread finished.
    pub fn samples(&self) -> Vec<WaitSample> {
        self.samples.lock().clone()
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        let mut pmc = [0; LOG_MAX_CTRS];
        for (value, counter) in pmc.iter_mut().zip(self.pmc.iter()) {
            *value = counter.load(Ordering::Relaxed);
        }
        SlotSnapshot {
            state: self.state(),
            core: self.core_hint(),
            mutex_spin: self.mutex_spin.load(Ordering::Relaxed),
            rwlock_spin: self.rwlock_spin.load(Ordering::Relaxed),
            barrier_spin: self.barrier_spin.load(Ordering::Relaxed),
            tsc_start: self.tsc_start.load(Ordering::Relaxed),
            tsc_end: self.tsc_end.load(Ordering::Relaxed),
            arrival_no_spinning: self.arrival_no_spinning.load(Ordering::Relaxed),
            pmc,
        }
    }
}

/// Plain copy of a slot's counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub state: SlotState,
    pub core: Option<usize>,
    pub mutex_spin: u64,
    pub rwlock_spin: u64,
    pub barrier_spin: u64,
    pub tsc_start: u64,
    pub tsc_end: u64,
    pub arrival_no_spinning: u64,
    pub pmc: [u64; LOG_MAX_CTRS],
}

impl SlotSnapshot {
    /// Cycles between the first and last reading of the thread's lifetime.
    pub fn lifetime(&self) -> u64 {
        self.tsc_end.saturating_sub(self.tsc_start)
    }

    pub fn total_spin(&self) -> u64 {
        self.mutex_spin
            .wrapping_add(self.rwlock_spin)
            .wrapping_add(self.barrier_spin)
    }
}

pub struct ThreadRegistry {
    slots: Box<[Arc<ThreadSlot>]>,
    nthreads: AtomicUsize,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        ThreadRegistry::with_capacity(MAX_PROFILED_THREADS)
    }
}

impl ThreadRegistry {
    pub fn new() -> ThreadRegistry {
        ThreadRegistry::default()
    }

    pub fn with_capacity(capacity: usize) -> ThreadRegistry {
        ThreadRegistry {
            slots: (0..capacity).map(|_| Arc::new(ThreadSlot::default())).collect(),
            nthreads: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots handed out so far.
    pub fn len(&self) -> usize {
        self.nthreads.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve the next slot in creation order.
    pub fn allocate_slot(&self, core_hint: Option<usize>) -> Result<SlotId, RegistryError> {
        self.allocate_slot_with(|_| core_hint)
    }

    /// Like [`ThreadRegistry::allocate_slot`], with the core hint derived
    /// from the index that was reserved.
    pub fn allocate_slot_with<F>(&self, core_hint: F) -> Result<SlotId, RegistryError>
    where
        F: FnOnce(SlotId) -> Option<usize>,
    {
        let capacity = self.capacity();
        let idx = self
            .nthreads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < capacity {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .map_err(|_| RegistryError::Full { capacity })?;

        let slot = &self.slots[idx];
        slot.core.store(
            core_hint(SlotId(idx)).map_or(-1, |core| core as i32),
            Ordering::Relaxed,
        );
        slot.set_state(SlotState::Reserved);
        Ok(SlotId(idx))
    }

    pub fn slot(&self, id: SlotId) -> Option<&Arc<ThreadSlot>> {
        if id.0 < self.len() {
            self.slots.get(id.0)
        } else {
            None
        }
    }

    /// Bind slot `id` to the calling thread. Every later interception on
    /// this thread records into that slot. A thread is bound at most once.
    pub fn bind_current_thread(&self, id: SlotId) -> Result<(), RegistryError> {
        let slot = self.slot(id).ok_or(RegistryError::UnknownSlot(id))?.clone();

        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if let Some(ctx) = current.as_ref() {
                return Err(RegistryError::AlreadyBound { current: ctx.id });
            }
            slot.set_state(SlotState::Active);
            *current = Some(ThreadContext::new(id, slot));
            Ok(())
        })
    }

    /// Visit every allocated slot in creation order.
    ///
    /// Only meant for finalization: the threads owning these slots must have
    /// terminated, otherwise the values read may be mid-update.
    pub fn for_each_active<F: FnMut(SlotId, &ThreadSlot)>(&self, mut f: F) {
        for (idx, slot) in self.slots[..self.len()].iter().enumerate() {
            f(SlotId(idx), slot);
        }
    }

    /// The allocated slots, in creation order.
    pub fn slots(&self) -> &[Arc<ThreadSlot>] {
        &self.slots[..self.len()]
    }
}

/// The calling thread's binding: its slot plus state that never leaves the
/// thread while the body runs.
pub struct ThreadContext {
    pub(crate) id: SlotId,
    pub(crate) slot: Arc<ThreadSlot>,
    pub(crate) samples: Vec<WaitSample>,
}

impl ThreadContext {
    pub(crate) fn new(id: SlotId, slot: Arc<ThreadSlot>) -> ThreadContext {
        ThreadContext {
            id,
            slot,
            samples: Vec::new(),
        }
    }

    /// End the thread's lifetime at `tsc_end`: freeze its samples and the
    /// slot. Only the first call has an effect.
    pub(crate) fn finish(&mut self, tsc_end: u64) {
        if self.slot.state() != SlotState::Active {
            return;
        }
        self.slot.tsc_end.store(tsc_end, Ordering::Relaxed);
        self.slot.freeze_samples(mem::take(&mut self.samples));
        self.slot.set_state(SlotState::Finished);
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn slot(&self) -> &ThreadSlot {
        &self.slot
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        self.finish(clock::now());
    }
}

thread_local! {
    static CURRENT: RefCell<Option<ThreadContext>> = RefCell::new(None);
}

/// Run `f` against the calling thread's binding. Returns `None` for threads
/// that were never bound, and during thread teardown.
#[inline]
pub fn with_current<R, F: FnOnce(&mut ThreadContext) -> R>(f: F) -> Option<R> {
    CURRENT
        .try_with(|current| match current.try_borrow_mut() {
            Ok(mut current) => current.as_mut().map(f),
            Err(_) => None,
        })
        .ok()
        .flatten()
}

/// Remove the calling thread's binding, returning it.
pub(crate) fn take_current() -> Option<ThreadContext> {
    CURRENT
        .try_with(|current| current.try_borrow_mut().ok().and_then(|mut c| c.take()))
        .ok()
        .flatten()
}
