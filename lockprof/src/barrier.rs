//! Barrier rendezvous tracking and the wasted-cycles reduction.
//!
//! Every barrier the profiler knows about has a [`BarrierState`]: its number
//! of parties, a ticket counter and two arrival cells per registry slot. Each
//! call to the barrier takes a ticket, whether the calling thread is profiled
//! or not. With a fixed number of parties, `ticket / parties` is the
//! generation of the rendezvous the call belongs to, since no party can take a
//! ticket of generation `g + 1` before every party of generation `g` arrived.
//!
//! Right before entering the real barrier, a profiled thread publishes how
//! early it arrived (`t0` minus the lock spin it accumulated since its
//! previous barrier) into its cell for the generation's parity. Once the real
//! barrier returns, every party has published, and the serial participant
//! scans the cells tagged with that generation to find the latest arrival.
//! The cell of parity `g % 2` is only written again at generation `g + 2`,
//! which cannot begin before the serial participant arrived at `g + 1`.
//!
//! Pthread barriers are opaque, so the preload layer keeps their states in a
//! [`BarrierTable`] keyed by address, filled at `pthread_barrier_init`.

use crate::registry::{SlotId, ThreadContext};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Barriers tracked at the same time by a [`BarrierTable`].
pub const MAX_TRACKED_BARRIERS: usize = 32;

#[derive(Debug, Default)]
struct ArrivalCell {
    /// Generation plus one of the rendezvous this cell describes, 0 if empty.
    tag: AtomicU64,
    arrival_no_spinning: AtomicU64,
    spin: AtomicU64,
}

/// The rendezvous of a barrier a call belongs to, counted from 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Generation(u64);

impl Generation {
    pub fn index(self) -> u64 {
        self.0
    }

    fn tag(self) -> u64 {
        self.0 + 1
    }

    fn cell(self) -> usize {
        (self.0 % 2) as usize
    }
}

#[derive(Debug)]
pub struct BarrierState {
    parties: AtomicU64,
    tickets: AtomicU64,
    cells: Box<[[ArrivalCell; 2]]>,
}

impl BarrierState {
    /// State for a barrier of `parties` threads, with room for `slots`
    /// profiled threads. A barrier of 0 parties is not tracked.
    pub fn new(parties: usize, slots: usize) -> BarrierState {
        BarrierState {
            parties: AtomicU64::new(parties as u64),
            tickets: AtomicU64::new(0),
            cells: (0..slots).map(|_| Default::default()).collect(),
        }
    }

    pub fn parties(&self) -> u64 {
        self.parties.load(Ordering::Acquire)
    }

    /// Forget every rendezvous and start over with `parties` threads.
    pub(crate) fn reset(&self, parties: usize) {
        for cell in self.cells.iter().flatten() {
            cell.tag.store(0, Ordering::Relaxed);
        }
        self.tickets.store(0, Ordering::Relaxed);
        self.parties.store(parties as u64, Ordering::Release);
    }

    /// Take a ticket for the next wait on this barrier.
    pub fn arrive(&self) -> Option<Generation> {
        let parties = self.parties();
        if parties == 0 {
            return None;
        }
        let ticket = self.tickets.fetch_add(1, Ordering::AcqRel);
        Some(Generation(ticket / parties))
    }

    /// Publish the calling thread's arrival at `generation` and reset its
    /// since-barrier spin. Must run before the real barrier is entered.
    pub fn publish(&self, generation: Generation, ctx: &ThreadContext, t0: u64) {
        let slot = &ctx.slot;
        let spin = slot
            .mutex_spin_local
            .load(Ordering::Relaxed)
            .wrapping_add(slot.rwlock_spin_local.load(Ordering::Relaxed));
        let arrival = t0.wrapping_sub(spin);

        slot.arrival_no_spinning.store(arrival, Ordering::Relaxed);
        slot.mutex_spin_local.store(0, Ordering::Relaxed);
        slot.rwlock_spin_local.store(0, Ordering::Relaxed);

        match self.cells.get(ctx.id.index()) {
            Some(cells) => {
                let cell = &cells[generation.cell()];
                cell.arrival_no_spinning.store(arrival, Ordering::Relaxed);
                cell.spin.store(spin, Ordering::Relaxed);
                cell.tag.store(generation.tag(), Ordering::Release);
            }
            None => warn!("slot {} has no arrival cell on this barrier", ctx.id),
        }
    }

    /// Find the critical-path thread of `generation`: the profiled party
    /// with the largest published `arrival_no_spinning`, among the first
    /// `nslots` slots. Ties go to the first slot in creation order. Returns
    /// that slot and the spin it published.
    ///
    /// Only valid once every party of `generation` has arrived, which the
    /// real barrier guarantees to its serial participant.
    pub fn reduce(&self, generation: Generation, nslots: usize) -> Option<(SlotId, u64)> {
        let cell_idx = generation.cell();
        let mut critical: Option<(SlotId, u64, u64)> = None;

        for (idx, cells) in self.cells.iter().take(nslots).enumerate() {
            let cell = &cells[cell_idx];
            if cell.tag.load(Ordering::Acquire) != generation.tag() {
                continue;
            }
            let arrival = cell.arrival_no_spinning.load(Ordering::Relaxed);
            let later = match critical {
                Some((_, latest, _)) => arrival > latest,
                None => true,
            };
            if later {
                critical = Some((SlotId(idx), arrival, cell.spin.load(Ordering::Relaxed)));
            }
        }

        critical.map(|(id, _, spin)| (id, spin))
    }
}

struct BarrierEntry {
    /// Address of the barrier, 0 if the entry is free.
    key: AtomicUsize,
    state: BarrierState,
}

/// Barrier states looked up by the address of the barrier object.
///
/// Lookups never block: entries are claimed with a compare-and-swap on
/// their key, and a barrier's state is only reset while the barrier is being
/// initialized, when no thread may wait on it.
pub struct BarrierTable {
    entries: Box<[BarrierEntry]>,
}

impl BarrierTable {
    pub fn new(slots: usize) -> BarrierTable {
        BarrierTable::with_capacity(MAX_TRACKED_BARRIERS, slots)
    }

    pub fn with_capacity(barriers: usize, slots: usize) -> BarrierTable {
        BarrierTable {
            entries: (0..barriers)
                .map(|_| BarrierEntry {
                    key: AtomicUsize::new(0),
                    state: BarrierState::new(0, slots),
                })
                .collect(),
        }
    }

    /// Start tracking the barrier at `key` with `parties` threads. A barrier
    /// initialized again at the same address starts over. Returns `None` if
    /// the table is full.
    pub fn register(&self, key: usize, parties: usize) -> Option<&BarrierState> {
        if key == 0 {
            return None;
        }

        let entry = match self.entry(key) {
            Some(entry) => entry,
            None => self.entries.iter().find(|entry| {
                entry
                    .key
                    .compare_exchange(0, key, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })?,
        };
        entry.state.reset(parties);
        Some(&entry.state)
    }

    pub fn get(&self, key: usize) -> Option<&BarrierState> {
        self.entry(key).map(|entry| &entry.state)
    }

    /// Stop tracking the barrier at `key`, freeing its entry.
    pub fn release(&self, key: usize) -> bool {
        match self.entry(key) {
            Some(entry) => {
                entry.state.reset(0);
                entry.key.store(0, Ordering::Release);
                true
            }
            None => false,
        }
    }

    fn entry(&self, key: usize) -> Option<&BarrierEntry> {
        if key == 0 {
            return None;
        }
        self.entries
            .iter()
            .find(|entry| entry.key.load(Ordering::Acquire) == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::{Accumulator, AggregateAccumulator, Primitive};
    use crate::registry::ThreadRegistry;
    use std::sync::Arc;

    fn contexts(registry: &ThreadRegistry, n: usize) -> Vec<ThreadContext> {
        (0..n)
            .map(|_| {
                let id = registry.allocate_slot(None).unwrap();
                ThreadContext::new(id, Arc::clone(registry.slot(id).unwrap()))
            })
            .collect()
    }

    // Every context arrives at `barrier`: `(t0, mutex spin before it)`.
    fn arrive(
        barrier: &BarrierState,
        ctxs: &mut [ThreadContext],
        arrivals: &[(u64, u64)],
    ) -> Generation {
        let acc = AggregateAccumulator::new();
        let mut generation = None;
        for (ctx, &(t0, spin)) in ctxs.iter_mut().zip(arrivals) {
            acc.on_wait(ctx, Primitive::Mutex, 0, spin);
            let g = barrier.arrive().unwrap();
            barrier.publish(g, ctx, t0);
            assert!(generation.map_or(true, |prev| prev == g));
            generation = Some(g);
        }
        generation.unwrap()
    }

    #[test]
    fn critical_path_is_latest_arrival() {
        let registry = ThreadRegistry::new();
        let mut ctxs = contexts(&registry, 4);
        let barrier = BarrierState::new(4, registry.capacity());

        // arrival_no_spinning = t0 - spin: 900, 950, 1000, 800.
        let g = arrive(&barrier, &mut ctxs, &[(1000, 100), (1000, 50), (1100, 100), (900, 100)]);

        assert_eq!(barrier.reduce(g, registry.len()), Some((SlotId(2), 100)));
    }

    #[test]
    fn ties_go_to_first_slot() {
        let registry = ThreadRegistry::new();
        let mut ctxs = contexts(&registry, 3);
        let barrier = BarrierState::new(3, registry.capacity());
        let g = arrive(&barrier, &mut ctxs, &[(400, 200), (500, 200), (500, 200)]);

        assert_eq!(barrier.reduce(g, registry.len()), Some((SlotId(1), 200)));
    }

    #[test]
    fn generations_follow_the_tickets() {
        let barrier = BarrierState::new(2, 4);
        let generations: Vec<_> = (0..5).map(|_| barrier.arrive().unwrap().index()).collect();
        assert_eq!(generations, vec![0, 0, 1, 1, 2]);

        barrier.reset(3);
        assert_eq!(barrier.arrive(), Some(Generation(0)));
        assert_eq!(BarrierState::new(0, 4).arrive(), None);
    }

    #[test]
    fn since_barrier_spin_resets() {
        let registry = ThreadRegistry::new();
        let mut ctxs = contexts(&registry, 2);
        let barrier = BarrierState::new(2, registry.capacity());

        let first = arrive(&barrier, &mut ctxs, &[(1000, 40), (900, 10)]);
        assert_eq!(barrier.reduce(first, registry.len()), Some((SlotId(0), 40)));

        // No lock spin before the second rendezvous.
        let second = arrive(&barrier, &mut ctxs, &[(2000, 0), (2100, 0)]);
        assert_eq!(second.index(), first.index() + 1);
        assert_eq!(barrier.reduce(second, registry.len()), Some((SlotId(1), 0)));

        // Cumulative totals keep everything.
        assert_eq!(ctxs[0].slot().snapshot().mutex_spin, 40);
    }

    #[test]
    fn barriers_with_different_parties_do_not_mix() {
        let registry = ThreadRegistry::new();
        let mut ctxs = contexts(&registry, 3);
        let pair = BarrierState::new(2, registry.capacity());
        let all = BarrierState::new(3, registry.capacity());

        // Slots 0 and 1 meet at the pair barrier.
        let g = arrive(&pair, &mut ctxs[..2], &[(100, 10), (120, 5)]);
        assert_eq!(pair.reduce(g, registry.len()), Some((SlotId(1), 5)));

        // Then all three meet. Slot 2 spun most but arrived early; slot 1
        // arrived last and is on the critical path.
        let g = arrive(&all, &mut ctxs, &[(200, 0), (1500, 30), (600, 250)]);
        assert_eq!(g.index(), 0);
        assert_eq!(all.reduce(g, registry.len()), Some((SlotId(1), 30)));

        // A second rendezvous at the pair barrier only sees its own parties.
        let g = arrive(&pair, &mut ctxs[..2], &[(2000, 0), (1900, 0)]);
        assert_eq!(g.index(), 1);
        assert_eq!(pair.reduce(g, registry.len()), Some((SlotId(0), 0)));
    }

    #[test]
    fn unprofiled_parties_take_tickets() {
        let registry = ThreadRegistry::new();
        let mut ctxs = contexts(&registry, 1);
        let barrier = BarrierState::new(2, registry.capacity());

        // An unprofiled thread takes its ticket without publishing.
        let g = barrier.arrive().unwrap();
        let _ = arrive(&barrier, &mut ctxs, &[(500, 70)]);
        assert_eq!(barrier.reduce(g, registry.len()), Some((SlotId(0), 70)));

        // The next rendezvous has not been published yet.
        assert_eq!(barrier.reduce(Generation(1), registry.len()), None);
    }

    #[test]
    fn table_tracks_barriers_by_address() {
        let table = BarrierTable::with_capacity(2, 4);
        assert!(table.get(0x1000).is_none());
        assert!(table.register(0, 2).is_none());

        table.register(0x1000, 2).unwrap();
        table.register(0x2000, 3).unwrap();
        assert!(table.register(0x3000, 4).is_none());
        assert_eq!(table.get(0x2000).unwrap().parties(), 3);

        // Initializing again at the same address starts over.
        table.get(0x1000).unwrap().arrive().unwrap();
        table.register(0x1000, 4).unwrap();
        let state = table.get(0x1000).unwrap();
        assert_eq!(state.parties(), 4);
        assert_eq!(state.arrive(), Some(Generation(0)));

        assert!(table.release(0x2000));
        assert!(!table.release(0x2000));
        assert!(table.get(0x2000).is_none());
        assert!(table.register(0x3000, 4).is_some());
    }
}
