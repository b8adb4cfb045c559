//! Wait-time accumulation.
//!
//! Two accumulators exist: [`AggregateAccumulator`] keeps cumulative blocked
//! cycles per primitive kind, [`TraceAccumulator`] does the same and also keeps
//! every individual wait as a [`WaitSample`]. Which one runs is decided once,
//! from the configured [`Mode`]. Both hold the process-wide wasted-cycles total
//! that the barrier reduction (see [`crate::barrier`]) charges.

use crate::config::Mode;
use crate::registry::{bump, ThreadContext};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// The synchronization primitives whose waits are measured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Primitive {
    Mutex,
    ReadLock,
    WriteLock,
    Barrier,
}

impl Primitive {
    /// Code stored in trace records.
    pub fn code(self) -> u64 {
        match self {
            Primitive::Mutex => 0,
            Primitive::ReadLock => 1,
            Primitive::WriteLock => 2,
            Primitive::Barrier => 3,
        }
    }

    pub fn from_code(code: u64) -> Option<Primitive> {
        match code {
            0 => Some(Primitive::Mutex),
            1 => Some(Primitive::ReadLock),
            2 => Some(Primitive::WriteLock),
            3 => Some(Primitive::Barrier),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Primitive::Mutex => "mutex",
            Primitive::ReadLock => "rdlock",
            Primitive::WriteLock => "wrlock",
            Primitive::Barrier => "barrier",
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One measured wait, kept in trace mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitSample {
    pub kind: Primitive,
    /// Cycle clock reading when the wait started.
    pub start: u64,
    /// Cycles spent inside the primitive.
    pub cycles: u64,
}

pub trait Accumulator: Send + Sync {
    fn mode(&self) -> Mode;

    /// Account for a completed mutex or rwlock wait on the calling thread.
    fn on_wait(&self, ctx: &mut ThreadContext, kind: Primitive, t0: u64, t1: u64);

    /// Account for a completed barrier wait on the calling thread.
    fn on_barrier(&self, ctx: &mut ThreadContext, t0: u64, t1: u64);

    /// Add the spin of a barrier's critical-path thread to the wasted total.
    fn charge_wasted(&self, spin: u64);

    /// Total wasted synchronization cycles charged so far.
    fn wasted(&self) -> u64;
}

pub fn new_accumulator(mode: Mode) -> Box<dyn Accumulator> {
    match mode {
        Mode::Aggregate => Box::new(AggregateAccumulator::new()),
        Mode::Trace => Box::new(TraceAccumulator::new()),
    }
}

/// Cumulative per-primitive totals plus the wasted-cycles total.
#[derive(Debug, Default)]
pub struct AggregateAccumulator {
    wasted: AtomicU64,
}

impl AggregateAccumulator {
    pub fn new() -> AggregateAccumulator {
        AggregateAccumulator::default()
    }
}

impl Accumulator for AggregateAccumulator {
    fn mode(&self) -> Mode {
        Mode::Aggregate
    }

    #[inline]
    fn on_wait(&self, ctx: &mut ThreadContext, kind: Primitive, t0: u64, t1: u64) {
        let slot = &ctx.slot;
        let delta = t1.wrapping_sub(t0);
        match kind {
            Primitive::Mutex => {
                bump(&slot.mutex_spin, delta);
                bump(&slot.mutex_spin_local, delta);
            }
            Primitive::ReadLock | Primitive::WriteLock => {
                bump(&slot.rwlock_spin, delta);
                bump(&slot.rwlock_spin_local, delta);
            }
            Primitive::Barrier => bump(&slot.barrier_spin, delta),
        }
    }

    fn on_barrier(&self, ctx: &mut ThreadContext, t0: u64, t1: u64) {
        bump(&ctx.slot.barrier_spin, t1.wrapping_sub(t0));
    }

    fn charge_wasted(&self, spin: u64) {
        self.wasted.fetch_add(spin, Ordering::Relaxed);
    }

    fn wasted(&self) -> u64 {
        self.wasted.load(Ordering::Relaxed)
    }
}

/// Everything [`AggregateAccumulator`] does, plus a sample for every wait.
#[derive(Debug, Default)]
pub struct TraceAccumulator {
    totals: AggregateAccumulator,
}

impl TraceAccumulator {
    pub fn new() -> TraceAccumulator {
        TraceAccumulator::default()
    }
}

impl Accumulator for TraceAccumulator {
    fn mode(&self) -> Mode {
        Mode::Trace
    }

    fn on_wait(&self, ctx: &mut ThreadContext, kind: Primitive, t0: u64, t1: u64) {
        self.totals.on_wait(ctx, kind, t0, t1);
        ctx.samples.push(WaitSample {
            kind,
            start: t0,
            cycles: t1.wrapping_sub(t0),
        });
    }

    fn on_barrier(&self, ctx: &mut ThreadContext, t0: u64, t1: u64) {
        self.totals.on_barrier(ctx, t0, t1);
        ctx.samples.push(WaitSample {
            kind: Primitive::Barrier,
            start: t0,
            cycles: t1.wrapping_sub(t0),
        });
    }

    fn charge_wasted(&self, spin: u64) {
        self.totals.charge_wasted(spin);
    }

    fn wasted(&self) -> u64 {
        self.totals.wasted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{SlotState, ThreadRegistry};
    use std::sync::Arc;

    fn context(registry: &ThreadRegistry) -> ThreadContext {
        let id = registry.allocate_slot(None).unwrap();
        let slot = Arc::clone(registry.slot(id).unwrap());
        slot.set_state(SlotState::Active);
        ThreadContext::new(id, slot)
    }

    #[test]
    fn waits_accumulate_per_kind() {
        let registry = ThreadRegistry::new();
        let mut ctx = context(&registry);
        let acc = AggregateAccumulator::new();

        acc.on_wait(&mut ctx, Primitive::Mutex, 100, 150);
        acc.on_wait(&mut ctx, Primitive::Mutex, 200, 210);
        acc.on_wait(&mut ctx, Primitive::ReadLock, 300, 305);
        acc.on_wait(&mut ctx, Primitive::WriteLock, 400, 420);
        acc.on_barrier(&mut ctx, 500, 540);

        let snapshot = ctx.slot().snapshot();
        assert_eq!(snapshot.mutex_spin, 60);
        assert_eq!(snapshot.rwlock_spin, 25);
        assert_eq!(snapshot.barrier_spin, 40);
        assert!(ctx.samples.is_empty());
    }

    #[test]
    fn wasted_cycles_add_up() {
        let acc = new_accumulator(Mode::Trace);
        acc.charge_wasted(30);
        acc.charge_wasted(12);
        assert_eq!(acc.wasted(), 42);
        assert_eq!(acc.mode(), Mode::Trace);
    }

    #[test]
    fn trace_keeps_every_wait() {
        let registry = ThreadRegistry::new();
        let mut ctx = context(&registry);
        let slot = Arc::clone(&ctx.slot);
        let acc = TraceAccumulator::new();

        acc.on_wait(&mut ctx, Primitive::WriteLock, 10, 25);
        acc.on_barrier(&mut ctx, 30, 90);
        ctx.finish(100);

        assert_eq!(
            slot.samples(),
            vec![
                WaitSample { kind: Primitive::WriteLock, start: 10, cycles: 15 },
                WaitSample { kind: Primitive::Barrier, start: 30, cycles: 60 },
            ]
        );
        assert_eq!(slot.snapshot().rwlock_spin, 15);
        assert_eq!(slot.snapshot().barrier_spin, 60);
    }

    #[test]
    fn primitive_codes() {
        for kind in [
            Primitive::Mutex,
            Primitive::ReadLock,
            Primitive::WriteLock,
            Primitive::Barrier,
        ] {
            assert_eq!(Primitive::from_code(kind.code()), Some(kind));
        }
        assert_eq!(Primitive::from_code(4), None);
    }
}
