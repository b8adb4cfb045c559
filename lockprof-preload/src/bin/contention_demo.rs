//! A small pthread program to run under the preload library: four threads
//! looping over private work and a shared critical section, meeting at a
//! barrier every fourth iteration.
//!
//! With `condvar` as first argument it initializes a condition variable
//! instead, which the profiler refuses. With `condwait` it waits on a
//! statically initialized one.

use std::cell::UnsafeCell;
use std::hint::black_box;
use std::mem;
use std::sync::Arc;
use std::thread;

const THREADS: usize = 4;
const ITERATIONS: usize = 10;

struct RawMutex(UnsafeCell<libc::pthread_mutex_t>);
struct RawRwLock(UnsafeCell<libc::pthread_rwlock_t>);
struct RawBarrier(UnsafeCell<libc::pthread_barrier_t>);

// The pthread objects do their own synchronization.
unsafe impl Sync for RawMutex {}
unsafe impl Sync for RawRwLock {}
unsafe impl Sync for RawBarrier {}
unsafe impl Send for RawBarrier {}

static LOCK: RawMutex = RawMutex(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));
static TABLE: RawRwLock = RawRwLock(UnsafeCell::new(libc::PTHREAD_RWLOCK_INITIALIZER));
static mut SHARED: u64 = 0;

fn busy_work(n: u64) -> u64 {
    (0..n).fold(0u64, |acc, i| black_box(acc.wrapping_mul(31).wrapping_add(i)))
}

fn contend() {
    let barrier = Arc::new(RawBarrier(UnsafeCell::new(unsafe { mem::zeroed() })));
    let rc = unsafe {
        libc::pthread_barrier_init(barrier.0.get(), std::ptr::null(), THREADS as libc::c_uint)
    };
    assert_eq!(rc, 0, "pthread_barrier_init failed");

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                for i in 0..ITERATIONS {
                    let private = busy_work(10_000 * (t as u64 + 1));
                    unsafe {
                        libc::pthread_rwlock_rdlock(TABLE.0.get());
                        let seed = black_box(private);
                        libc::pthread_rwlock_unlock(TABLE.0.get());

                        libc::pthread_mutex_lock(LOCK.0.get());
                        SHARED = SHARED.wrapping_add(busy_work(50_000) ^ seed);
                        libc::pthread_mutex_unlock(LOCK.0.get());
                    }
                    if i % 4 == 3 {
                        unsafe { libc::pthread_barrier_wait(barrier.0.get()) };
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("worker panicked");
    }
    unsafe { libc::pthread_barrier_destroy(barrier.0.get()) };
    println!("done: {}", unsafe { SHARED });
}

fn condvar() {
    let mut cond: libc::pthread_cond_t = unsafe { mem::zeroed() };
    let rc = unsafe { libc::pthread_cond_init(&mut cond, std::ptr::null()) };
    println!("pthread_cond_init returned {}", rc);
}

fn condwait() {
    let mut cond: libc::pthread_cond_t = libc::PTHREAD_COND_INITIALIZER;
    let mut mutex: libc::pthread_mutex_t = libc::PTHREAD_MUTEX_INITIALIZER;
    // A deadline in the past: times out at once when nothing intercepts it.
    let deadline = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe {
        libc::pthread_mutex_lock(&mut mutex);
        let rc = libc::pthread_cond_timedwait(&mut cond, &mut mutex, &deadline);
        libc::pthread_mutex_unlock(&mut mutex);
        rc
    };
    println!("pthread_cond_timedwait returned {}", rc);
}

fn main() {
    match std::env::args().nth(1).as_deref() {
        Some("condvar") => condvar(),
        Some("condwait") => condwait(),
        _ => contend(),
    }
}
