//! Synchronization contention profiling.
//!
//! `lockprof` measures how many cycles each thread of a program spends blocked
//! in mutexes, read-write locks and barriers, estimates the cycles wasted on the
//! critical path at every barrier, and writes the results to a compressed,
//! versioned binary log.
//!
//! The engine does not decide how calls get intercepted. The
//! `lockprof-preload` library interposes on the pthread functions of an
//! unmodified program; [`instrument`] provides drop-in types for programs that
//! opt in explicitly. Both drive the same [`Profiler`]:
//!
//! ```no_run
//! use lockprof::instrument::{spawn, ProfiledMutex};
//! use lockprof::{Config, Profiler};
//! use std::sync::Arc;
//!
//! let profiler = Arc::new(Profiler::new(Config::from_env().unwrap()));
//! let counter = Arc::new(ProfiledMutex::new(profiler.clone(), 0u64));
//!
//! let workers: Vec<_> = (0..4)
//!     .map(|_| {
//!         let counter = counter.clone();
//!         spawn(&profiler, move || *counter.lock() += 1).unwrap()
//!     })
//!     .collect();
//! for worker in workers {
//!     worker.join().unwrap();
//! }
//!
//! profiler.finalize().unwrap();
//! ```

#[macro_use]
extern crate log;

pub mod accumulator;
pub mod barrier;
pub mod clock;
pub mod config;
pub mod counters;
mod error;
mod finalize;
pub mod format;
pub mod instrument;
mod log_file;
mod profiler;
pub mod registry;
pub mod testing_common;

pub use crate::accumulator::{Accumulator, Primitive, WaitSample};
pub use crate::barrier::{BarrierState, BarrierTable};
pub use crate::config::{Config, Mode, Output};
pub use crate::error::LogError;
pub use crate::finalize::{
    shutdown, Report, ThreadSummary, RECORD_BARRIER, RECORD_END_SKEW, RECORD_LIFETIME,
    RECORD_MUTEX, RECORD_RWLOCK, RECORD_START_SKEW, RECORD_TRACE,
};
pub use crate::format::{
    EventRecord, LogHeader, PerfCounterMap, PmcSample, ProcessHeader, LOG_MAX_CTRS,
    LOG_MAX_PROCS, LOG_VERSION_CURRENT,
};
pub use crate::log_file::{Events, LogReader, LogWriter, Sink, Source};
pub use crate::profiler::{global, init, Profiler, ThreadGuard};
pub use crate::registry::{SlotId, SlotState, ThreadRegistry};
