use crate::accumulator::{new_accumulator, Accumulator, Primitive};
use crate::barrier::{BarrierState, BarrierTable};
use crate::clock;
use crate::config::{Config, Mode};
use crate::counters::{ContentionPool, CounterHandle, CounterSource};
use crate::format::LOG_MAX_CTRS;
use crate::registry::{self, RegistryError, SlotId, ThreadRegistry};
use parking_lot::Mutex;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// The profiling engine: the thread registry, the accumulator picked by the
/// configured mode, and the collaborators that contribute counter values.
///
/// Interception strategies drive it through [`Profiler::register_thread`] and
/// [`Profiler::run_thread`] at thread creation, and through
/// [`Profiler::measure`] and [`Profiler::barrier_wait`] around every call that
/// may block. Threads that were never registered pass through untouched.
pub struct Profiler {
    pub(crate) config: Config,
    pub(crate) registry: ThreadRegistry,
    barriers: BarrierTable,
    pub(crate) accumulator: Box<dyn Accumulator>,
    counters: Option<Box<dyn CounterSource>>,
    pub(crate) pool: Mutex<Option<Box<dyn ContentionPool>>>,
    pool_resumed: AtomicBool,
    pub(crate) finalized: AtomicBool,
}

impl Profiler {
    pub fn new(config: Config) -> Profiler {
        let registry = ThreadRegistry::new();
        Profiler {
            accumulator: new_accumulator(config.mode),
            config,
            barriers: BarrierTable::new(registry.capacity()),
            registry,
            counters: None,
            pool: Mutex::new(None),
            pool_resumed: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
        }
    }

    /// Count hardware events on every profiled thread, using the layout from
    /// the configuration.
    pub fn with_counters(mut self, source: Box<dyn CounterSource>) -> Profiler {
        self.counters = Some(source);
        self
    }

    pub fn with_pool(self, pool: Box<dyn ContentionPool>) -> Profiler {
        *self.pool.lock() = Some(pool);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.accumulator.mode()
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    /// Barriers known by address, for interception strategies that cannot
    /// attach a [`BarrierState`] to the barrier itself.
    pub fn barriers(&self) -> &BarrierTable {
        &self.barriers
    }

    /// State for a new barrier of `parties` threads, sized for this
    /// profiler's registry.
    pub fn new_barrier(&self, parties: usize) -> BarrierState {
        BarrierState::new(parties, self.registry.capacity())
    }

    /// Wasted synchronization cycles charged so far.
    pub fn wasted(&self) -> u64 {
        self.accumulator.wasted()
    }

    /// Start the contention pool, if there is one. Its workers stay paused
    /// until the first thread is registered.
    pub fn launch(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(pool) = self.pool.lock().as_mut() {
            pool.launch()
                .map_err(|e| format!("failed to launch contention pool: {}", e))?;
            info!("contention pool launched");
        }
        Ok(())
    }

    /// Reserve a slot for a thread about to be created. Called on the
    /// creating thread, before the real creation call.
    pub fn register_thread(&self) -> Result<SlotId, RegistryError> {
        let id = self
            .registry
            .allocate_slot_with(|id| self.config.core_hint(id.index()))?;

        if !self.pool_resumed.swap(true, Ordering::AcqRel) {
            if let Some(pool) = self.pool.lock().as_mut() {
                if let Err(e) = pool.resume() {
                    error!("failed to resume contention pool: {}", e);
                }
            }
        }

        Ok(id)
    }

    /// Bind slot `id` to the calling thread and start its lifetime. The
    /// lifetime ends when the returned guard is dropped.
    pub fn enter_thread(&self, id: SlotId) -> Result<ThreadGuard, RegistryError> {
        self.registry.bind_current_thread(id)?;
        let slot = self.registry.slot(id).ok_or(RegistryError::UnknownSlot(id))?;

        if let Some(core) = slot.core_hint() {
            if let Err(e) = pin_to_core(core) {
                warn!("thread {} could not be pinned to core {}: {}", id, core, e);
            }
        }

        let counters = self.open_counters(id);
        slot.tsc_start.store(clock::now(), Ordering::Relaxed);

        Ok(ThreadGuard { counters })
    }

    /// Run a registered thread's body. This is what the creation trampoline
    /// executes on the new thread.
    pub fn run_thread<R, F: FnOnce() -> R>(&self, id: SlotId, body: F) -> R {
        match self.enter_thread(id) {
            Ok(guard) => {
                let result = body();
                drop(guard);
                result
            }
            Err(e) => {
                error!("thread {} runs unprofiled: {}", id, e);
                body()
            }
        }
    }

    /// Time a mutex or rwlock acquisition. `f` performs the real call and its
    /// result is returned unchanged.
    #[inline(always)]
    pub fn measure<R, F: FnOnce() -> R>(&self, kind: Primitive, f: F) -> R {
        let t0 = clock::now();
        let result = f();
        let t1 = clock::now();
        registry::with_current(|ctx| self.accumulator.on_wait(ctx, kind, t0, t1));
        result
    }

    /// Time a wait on the barrier described by `barrier`. `wait` performs
    /// the real call; `is_serial` tells, from its result, whether this thread
    /// is the barrier's serial participant, which then performs the reduction
    /// for everyone. The serial participant does not need to be profiled.
    #[inline]
    pub fn barrier_wait<R, W, S>(&self, barrier: &BarrierState, wait: W, is_serial: S) -> R
    where
        W: FnOnce() -> R,
        S: FnOnce(&R) -> bool,
    {
        let t0 = clock::now();
        let generation = barrier.arrive();
        if let Some(generation) = generation {
            registry::with_current(|ctx| barrier.publish(generation, ctx, t0));
        }
        let result = wait();
        let t1 = clock::now();

        registry::with_current(|ctx| self.accumulator.on_barrier(ctx, t0, t1));
        if let Some(generation) = generation {
            if is_serial(&result) {
                if let Some((critical, spin)) = barrier.reduce(generation, self.registry.len()) {
                    trace!(
                        "barrier generation {}: thread {} on the critical path, {} cycles wasted",
                        generation.index(),
                        critical,
                        spin
                    );
                    self.accumulator.charge_wasted(spin);
                }
            }
        }
        result
    }

    fn open_counters(&self, id: SlotId) -> Option<(Box<dyn CounterHandle>, [u64; LOG_MAX_CTRS])> {
        let source = self.counters.as_ref()?;
        if self.config.counters.is_empty() {
            return None;
        }

        let opened = source.open().and_then(|mut handle| {
            handle.configure(&self.config.counters)?;
            let start = handle.read()?;
            Ok((handle, start))
        });
        match opened {
            Ok(counters) => Some(counters),
            Err(e) => {
                warn!("thread {} has no hardware counters: {}", id, e);
                None
            }
        }
    }
}

/// Ends a profiled thread's lifetime when dropped: records `tsc_end` and the
/// counter deltas, then freezes the slot.
#[must_use]
pub struct ThreadGuard {
    counters: Option<(Box<dyn CounterHandle>, [u64; LOG_MAX_CTRS])>,
}

impl Drop for ThreadGuard {
    #[inline]
    fn drop(&mut self) {
        let tsc_end = clock::now();
        let mut ctx = match registry::take_current() {
            Some(ctx) => ctx,
            None => return,
        };
        let slot = &ctx.slot;

        if let Some((handle, start)) = self.counters.as_mut() {
            match handle.read() {
                Ok(end) => {
                    for ((counter, end), start) in slot.pmc.iter().zip(end).zip(*start) {
                        counter.store(end.wrapping_sub(start), Ordering::Relaxed);
                    }
                }
                Err(e) => warn!("thread {}: reading hardware counters failed: {}", ctx.id, e),
            }
        }

        ctx.finish(tsc_end);
    }
}

#[cfg(target_os = "linux")]
fn pin_to_core(core: usize) -> std::io::Result<()> {
    use libc::{cpu_set_t, sched_setaffinity, CPU_SET, CPU_SETSIZE, CPU_ZERO};
    use std::mem;

    if core >= CPU_SETSIZE as usize {
        return Err(std::io::Error::from_raw_os_error(libc::EINVAL));
    }

    unsafe {
        let mut set: cpu_set_t = mem::zeroed();
        CPU_ZERO(&mut set);
        CPU_SET(core, &mut set);
        if sched_setaffinity(0, mem::size_of::<cpu_set_t>(), &set) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_core: usize) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "thread affinity is only supported on Linux",
    ))
}

static GLOBAL: OnceLock<Profiler> = OnceLock::new();

/// Install `profiler` as the process-wide instance and launch its contention
/// pool. Fails if an instance is already installed.
pub fn init(profiler: Profiler) -> Result<&'static Profiler, Box<dyn Error + Send + Sync>> {
    GLOBAL
        .set(profiler)
        .map_err(|_| "a profiler is already installed in this process")?;
    let profiler = GLOBAL.get().ok_or("profiler installation failed")?;
    profiler.launch()?;
    Ok(profiler)
}

pub fn global() -> Option<&'static Profiler> {
    GLOBAL.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SlotState;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn unregistered_threads_pass_through() {
        let profiler = Profiler::new(Config::default());
        let value = profiler.measure(Primitive::Mutex, || 42);
        let serial = profiler.barrier_wait(&profiler.new_barrier(1), || true, |&leader| leader);
        assert_eq!(value, 42);
        assert!(serial);
        assert!(profiler.registry().is_empty());
        assert_eq!(profiler.wasted(), 0);
    }

    #[test]
    fn thread_lifetime_is_recorded() {
        let profiler = Arc::new(Profiler::new(Config::default()));
        let id = profiler.register_thread().unwrap();

        let p = profiler.clone();
        let result = thread::spawn(move || {
            p.run_thread(id, || {
                p.measure(Primitive::Mutex, || thread::yield_now());
                7
            })
        })
        .join()
        .unwrap();
        assert_eq!(result, 7);

        let slot = profiler.registry().slot(id).unwrap();
        let snapshot = slot.snapshot();
        assert_eq!(snapshot.state, SlotState::Finished);
        assert!(snapshot.tsc_end >= snapshot.tsc_start);
        assert!(snapshot.total_spin() <= snapshot.lifetime());
    }

    #[test]
    fn lifetime_ends_when_thread_exits_without_its_guard() {
        let profiler = Arc::new(Profiler::new(Config::default()));
        let id = profiler.register_thread().unwrap();

        // Leaving the thread without dropping the guard is what
        // `pthread_exit` does to the trampoline.
        let p = profiler.clone();
        thread::spawn(move || {
            let guard = p.enter_thread(id).unwrap();
            p.measure(Primitive::Mutex, || thread::sleep(Duration::from_millis(2)));
            std::mem::forget(guard);
        })
        .join()
        .unwrap();

        let snapshot = profiler.registry().slot(id).unwrap().snapshot();
        assert_eq!(snapshot.state, SlotState::Finished);
        assert!(snapshot.mutex_spin > 0);
        assert!(snapshot.mutex_spin <= snapshot.lifetime());
    }

    #[test]
    fn core_hints_follow_the_core_map() {
        let profiler = Profiler::new(Config::default().with_cores(vec![3, 5]));
        let hints: Vec<_> = (0..3)
            .map(|_| {
                let id = profiler.register_thread().unwrap();
                profiler.registry().slot(id).unwrap().core_hint()
            })
            .collect();
        assert_eq!(hints, vec![Some(3), Some(5), Some(3)]);
    }
}
