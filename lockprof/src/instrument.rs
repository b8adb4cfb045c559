//! Explicit instrumentation: synchronization types that report their waits to
//! a [`Profiler`], for programs that opt in by using them instead of relying on
//! symbol interposition.
//!
//! Threads must be started through [`spawn`] to be profiled. Waits on other
//! threads still work, they are just not recorded.

use crate::accumulator::Primitive;
use crate::barrier::BarrierState;
use crate::profiler::Profiler;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::error::Error;
use std::sync::{Arc, Barrier, BarrierWaitResult};
use std::thread::{self, JoinHandle};

/// Spawn a profiled thread running `f`.
pub fn spawn<F, T>(
    profiler: &Arc<Profiler>,
    f: F,
) -> Result<JoinHandle<T>, Box<dyn Error + Send + Sync>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let id = profiler.register_thread()?;
    let profiler = Arc::clone(profiler);
    let handle = thread::Builder::new()
        .name(format!("lockprof-{}", id))
        .spawn(move || profiler.run_thread(id, f))?;
    Ok(handle)
}

pub struct ProfiledMutex<T> {
    profiler: Arc<Profiler>,
    inner: Mutex<T>,
}

impl<T> ProfiledMutex<T> {
    pub fn new(profiler: Arc<Profiler>, value: T) -> ProfiledMutex<T> {
        ProfiledMutex {
            profiler,
            inner: Mutex::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.profiler.measure(Primitive::Mutex, || self.inner.lock())
    }

    /// Never blocks, so nothing is recorded.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

pub struct ProfiledRwLock<T> {
    profiler: Arc<Profiler>,
    inner: RwLock<T>,
}

impl<T> ProfiledRwLock<T> {
    pub fn new(profiler: Arc<Profiler>, value: T) -> ProfiledRwLock<T> {
        ProfiledRwLock {
            profiler,
            inner: RwLock::new(value),
        }
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.profiler.measure(Primitive::ReadLock, || self.inner.read())
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.profiler.measure(Primitive::WriteLock, || self.inner.write())
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// A barrier whose leader performs the wasted-cycles reduction. The leader
/// may be a thread that was not spawned through [`spawn`].
pub struct ProfiledBarrier {
    profiler: Arc<Profiler>,
    state: BarrierState,
    inner: Barrier,
}

impl ProfiledBarrier {
    pub fn new(profiler: Arc<Profiler>, n: usize) -> ProfiledBarrier {
        // `Barrier` lets a single thread through when `n` is 0.
        let state = profiler.new_barrier(n.max(1));
        ProfiledBarrier {
            profiler,
            state,
            inner: Barrier::new(n),
        }
    }

    pub fn wait(&self) -> BarrierWaitResult {
        self.profiler.barrier_wait(
            &self.state,
            || self.inner.wait(),
            |result| result.is_leader(),
        )
    }
}
