//! The genuine pthread implementations, found with `dlsym(RTLD_NEXT, ..)`.

use libc::{c_char, c_int, c_uint, c_void, pthread_attr_t, pthread_barrier_t};
use libc::{pthread_barrierattr_t, pthread_mutex_t, pthread_rwlock_t, pthread_t};
use std::mem;
use std::sync::OnceLock;

pub(crate) type StartRoutine = extern "C" fn(*mut c_void) -> *mut c_void;

type PthreadCreateFn =
    unsafe extern "C" fn(*mut pthread_t, *const pthread_attr_t, StartRoutine, *mut c_void) -> c_int;
type PthreadMutexFn = unsafe extern "C" fn(*mut pthread_mutex_t) -> c_int;
type PthreadRwlockFn = unsafe extern "C" fn(*mut pthread_rwlock_t) -> c_int;
type PthreadBarrierInitFn =
    unsafe extern "C" fn(*mut pthread_barrier_t, *const pthread_barrierattr_t, c_uint) -> c_int;
type PthreadBarrierFn = unsafe extern "C" fn(*mut pthread_barrier_t) -> c_int;

/// The primitives the hooks forward to.
pub(crate) trait RealPthread: Send + Sync {
    unsafe fn create(
        &self,
        thread: *mut pthread_t,
        attr: *const pthread_attr_t,
        start_routine: StartRoutine,
        arg: *mut c_void,
    ) -> c_int;
    unsafe fn mutex_lock(&self, mutex: *mut pthread_mutex_t) -> c_int;
    unsafe fn mutex_unlock(&self, mutex: *mut pthread_mutex_t) -> c_int;
    unsafe fn rwlock_rdlock(&self, rwlock: *mut pthread_rwlock_t) -> c_int;
    unsafe fn rwlock_wrlock(&self, rwlock: *mut pthread_rwlock_t) -> c_int;
    unsafe fn barrier_init(
        &self,
        barrier: *mut pthread_barrier_t,
        attr: *const pthread_barrierattr_t,
        count: c_uint,
    ) -> c_int;
    unsafe fn barrier_destroy(&self, barrier: *mut pthread_barrier_t) -> c_int;
    unsafe fn barrier_wait(&self, barrier: *mut pthread_barrier_t) -> c_int;
}

/// The next definition of every symbol after this library in lookup order.
struct NextInChain {
    create: PthreadCreateFn,
    mutex_lock: PthreadMutexFn,
    mutex_unlock: PthreadMutexFn,
    rwlock_rdlock: PthreadRwlockFn,
    rwlock_wrlock: PthreadRwlockFn,
    barrier_init: PthreadBarrierInitFn,
    barrier_destroy: PthreadBarrierFn,
    barrier_wait: PthreadBarrierFn,
}

/// Look up `name` (NUL-terminated) past this library.
///
/// # Safety
///
/// `F` must be the function pointer type of the symbol.
unsafe fn next_symbol<F: Copy>(name: &'static [u8]) -> Result<F, String> {
    debug_assert_eq!(name.last(), Some(&0));
    debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<*mut c_void>());

    let sym = libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char);
    if sym.is_null() {
        let printable = String::from_utf8_lossy(&name[..name.len() - 1]);
        return Err(format!("cannot resolve the real `{}`", printable));
    }
    Ok(mem::transmute_copy::<*mut c_void, F>(&sym))
}

impl NextInChain {
    fn resolve() -> Result<NextInChain, String> {
        unsafe {
            Ok(NextInChain {
                create: next_symbol(b"pthread_create\0")?,
                mutex_lock: next_symbol(b"pthread_mutex_lock\0")?,
                mutex_unlock: next_symbol(b"pthread_mutex_unlock\0")?,
                rwlock_rdlock: next_symbol(b"pthread_rwlock_rdlock\0")?,
                rwlock_wrlock: next_symbol(b"pthread_rwlock_wrlock\0")?,
                barrier_init: next_symbol(b"pthread_barrier_init\0")?,
                barrier_destroy: next_symbol(b"pthread_barrier_destroy\0")?,
                barrier_wait: next_symbol(b"pthread_barrier_wait\0")?,
            })
        }
    }
}

impl RealPthread for NextInChain {
    unsafe fn create(
        &self,
        thread: *mut pthread_t,
        attr: *const pthread_attr_t,
        start_routine: StartRoutine,
        arg: *mut c_void,
    ) -> c_int {
        (self.create)(thread, attr, start_routine, arg)
    }

    #[inline(always)]
    unsafe fn mutex_lock(&self, mutex: *mut pthread_mutex_t) -> c_int {
        (self.mutex_lock)(mutex)
    }

    #[inline(always)]
    unsafe fn mutex_unlock(&self, mutex: *mut pthread_mutex_t) -> c_int {
        (self.mutex_unlock)(mutex)
    }

    #[inline(always)]
    unsafe fn rwlock_rdlock(&self, rwlock: *mut pthread_rwlock_t) -> c_int {
        (self.rwlock_rdlock)(rwlock)
    }

    #[inline(always)]
    unsafe fn rwlock_wrlock(&self, rwlock: *mut pthread_rwlock_t) -> c_int {
        (self.rwlock_wrlock)(rwlock)
    }

    unsafe fn barrier_init(
        &self,
        barrier: *mut pthread_barrier_t,
        attr: *const pthread_barrierattr_t,
        count: c_uint,
    ) -> c_int {
        (self.barrier_init)(barrier, attr, count)
    }

    unsafe fn barrier_destroy(&self, barrier: *mut pthread_barrier_t) -> c_int {
        (self.barrier_destroy)(barrier)
    }

    #[inline(always)]
    unsafe fn barrier_wait(&self, barrier: *mut pthread_barrier_t) -> c_int {
        (self.barrier_wait)(barrier)
    }
}

static REAL: OnceLock<Box<dyn RealPthread>> = OnceLock::new();

/// The real primitives. Resolved on first use, which may come before the
/// library's constructor ran; failing to resolve them is fatal.
#[inline]
pub(crate) fn real() -> &'static dyn RealPthread {
    REAL.get_or_init(|| match NextInChain::resolve() {
        Ok(next) => Box::new(next) as Box<dyn RealPthread>,
        Err(e) => crate::fatal(format_args!("{}", e)),
    })
    .as_ref()
}
