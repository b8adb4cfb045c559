//! The exported pthread entry points.
//!
//! Every hook forwards to the real implementation and hands its return code
//! back unchanged. Calls made before the profiler is installed, or from
//! threads it did not create, are forwarded without being recorded.
//!
//! Barriers are tracked from `pthread_barrier_init` to
//! `pthread_barrier_destroy`. Waits on a barrier initialized before the
//! profiler was installed only count as barrier spin.

use crate::real::{real, StartRoutine};
use libc::{c_int, c_uint, c_void, pthread_attr_t, pthread_barrier_t, pthread_barrierattr_t};
use libc::{pthread_cond_t, pthread_condattr_t, pthread_mutex_t, pthread_rwlock_t, pthread_t};
use libc::timespec;
use lockprof::{Primitive, SlotId};

const PTHREAD_BARRIER_SERIAL_THREAD: c_int = -1;

/// Owned by the new thread; consumed exactly once by [`trampoline`].
struct Trampoline {
    id: SlotId,
    start_routine: StartRoutine,
    arg: *mut c_void,
}

extern "C" fn trampoline(payload: *mut c_void) -> *mut c_void {
    // SAFETY: `payload` is the box leaked by `pthread_create` below.
    let Trampoline {
        id,
        start_routine,
        arg,
    } = *unsafe { Box::from_raw(payload.cast::<Trampoline>()) };

    match lockprof::global() {
        Some(profiler) => profiler.run_thread(id, || start_routine(arg)),
        None => start_routine(arg),
    }
}

/// # Safety
///
/// Same contract as `pthread_create(3)`.
#[no_mangle]
pub unsafe extern "C" fn pthread_create(
    thread: *mut pthread_t,
    attr: *const pthread_attr_t,
    start_routine: StartRoutine,
    arg: *mut c_void,
) -> c_int {
    let real = real();
    let profiler = match lockprof::global() {
        Some(profiler) => profiler,
        None => return real.create(thread, attr, start_routine, arg),
    };

    let id = match profiler.register_thread() {
        Ok(id) => id,
        Err(e) => crate::fatal(format_args!("{}", e)),
    };
    let payload = Box::into_raw(Box::new(Trampoline {
        id,
        start_routine,
        arg,
    }));

    let rc = real.create(thread, attr, trampoline, payload.cast());
    if rc != 0 {
        // The thread never started, so the payload is still ours.
        drop(Box::from_raw(payload));
        warn!("pthread_create failed ({}), slot {} stays unused", rc, id);
    }
    rc
}

/// # Safety
///
/// Same contract as `pthread_mutex_lock(3)`.
#[no_mangle]
pub unsafe extern "C" fn pthread_mutex_lock(mutex: *mut pthread_mutex_t) -> c_int {
    let real = real();
    match lockprof::global() {
        Some(profiler) => profiler.measure(Primitive::Mutex, || real.mutex_lock(mutex)),
        None => real.mutex_lock(mutex),
    }
}

/// # Safety
///
/// Same contract as `pthread_mutex_unlock(3)`.
#[no_mangle]
pub unsafe extern "C" fn pthread_mutex_unlock(mutex: *mut pthread_mutex_t) -> c_int {
    real().mutex_unlock(mutex)
}

/// # Safety
///
/// Same contract as `pthread_rwlock_rdlock(3)`.
#[no_mangle]
pub unsafe extern "C" fn pthread_rwlock_rdlock(rwlock: *mut pthread_rwlock_t) -> c_int {
    let real = real();
    match lockprof::global() {
        Some(profiler) => profiler.measure(Primitive::ReadLock, || real.rwlock_rdlock(rwlock)),
        None => real.rwlock_rdlock(rwlock),
    }
}

/// # Safety
///
/// Same contract as `pthread_rwlock_wrlock(3)`.
#[no_mangle]
pub unsafe extern "C" fn pthread_rwlock_wrlock(rwlock: *mut pthread_rwlock_t) -> c_int {
    let real = real();
    match lockprof::global() {
        Some(profiler) => profiler.measure(Primitive::WriteLock, || real.rwlock_wrlock(rwlock)),
        None => real.rwlock_wrlock(rwlock),
    }
}

/// # Safety
///
/// Same contract as `pthread_barrier_init(3)`.
#[no_mangle]
pub unsafe extern "C" fn pthread_barrier_init(
    barrier: *mut pthread_barrier_t,
    attr: *const pthread_barrierattr_t,
    count: c_uint,
) -> c_int {
    let rc = real().barrier_init(barrier, attr, count);
    if rc == 0 {
        if let Some(profiler) = lockprof::global() {
            if profiler
                .barriers()
                .register(barrier as usize, count as usize)
                .is_none()
            {
                warn!("too many live barriers, {:p} is not reduced", barrier);
            }
        }
    }
    rc
}

/// # Safety
///
/// Same contract as `pthread_barrier_destroy(3)`.
#[no_mangle]
pub unsafe extern "C" fn pthread_barrier_destroy(barrier: *mut pthread_barrier_t) -> c_int {
    let rc = real().barrier_destroy(barrier);
    if rc == 0 {
        if let Some(profiler) = lockprof::global() {
            profiler.barriers().release(barrier as usize);
        }
    }
    rc
}

/// # Safety
///
/// Same contract as `pthread_barrier_wait(3)`.
#[no_mangle]
pub unsafe extern "C" fn pthread_barrier_wait(barrier: *mut pthread_barrier_t) -> c_int {
    let real = real();
    let profiler = match lockprof::global() {
        Some(profiler) => profiler,
        None => return real.barrier_wait(barrier),
    };
    match profiler.barriers().get(barrier as usize) {
        Some(state) => profiler.barrier_wait(
            state,
            || real.barrier_wait(barrier),
            |&rc| rc == PTHREAD_BARRIER_SERIAL_THREAD,
        ),
        None => profiler.measure(Primitive::Barrier, || real.barrier_wait(barrier)),
    }
}

fn unsupported_condvar() -> ! {
    crate::fatal(format_args!("condition variables are not supported"))
}

/// Condition variables have no place in the wait accounting, so a program
/// using them cannot be profiled. Every entry point terminates the process,
/// so statically initialized condition variables are caught on first use.
///
/// # Safety
///
/// Never returns.
#[no_mangle]
pub unsafe extern "C" fn pthread_cond_init(
    _cond: *mut pthread_cond_t,
    _attr: *const pthread_condattr_t,
) -> c_int {
    unsupported_condvar()
}

/// # Safety
///
/// Never returns.
#[no_mangle]
pub unsafe extern "C" fn pthread_cond_wait(
    _cond: *mut pthread_cond_t,
    _mutex: *mut pthread_mutex_t,
) -> c_int {
    unsupported_condvar()
}

/// # Safety
///
/// Never returns.
#[no_mangle]
pub unsafe extern "C" fn pthread_cond_timedwait(
    _cond: *mut pthread_cond_t,
    _mutex: *mut pthread_mutex_t,
    _abstime: *const timespec,
) -> c_int {
    unsupported_condvar()
}

/// # Safety
///
/// Never returns.
#[no_mangle]
pub unsafe extern "C" fn pthread_cond_signal(_cond: *mut pthread_cond_t) -> c_int {
    unsupported_condvar()
}

/// # Safety
///
/// Never returns.
#[no_mangle]
pub unsafe extern "C" fn pthread_cond_broadcast(_cond: *mut pthread_cond_t) -> c_int {
    unsupported_condvar()
}
