//! Profile an unmodified program's pthread synchronization:
//!
//! ```text
//! LD_PRELOAD=liblockprof_preload.so LOCKPROF_FILE=run.log ./program
//! ```
//!
//! The library installs the `lockprof` engine from its constructor, routes
//! `pthread_create`, mutex, rwlock and barrier calls through it, and writes
//! the log from its destructor, when the program exits.

#[macro_use]
extern crate log;

mod hooks;
mod real;

use lockprof::counters::PerfEventCounters;
use lockprof::{Config, Profiler};
use std::fmt;
use std::fs::File;

const ENV_LOG: &str = "LOCKPROF_LOG";

/// Report an unrecoverable profiler failure and terminate the process without
/// running any further destructors.
pub(crate) fn fatal(args: fmt::Arguments<'_>) -> ! {
    eprintln!("lockprof: {}", args);
    unsafe { libc::_exit(1) }
}

#[used]
#[link_section = ".init_array"]
static SETUP: extern "C" fn() = setup;

#[used]
#[link_section = ".fini_array"]
static TEARDOWN: extern "C" fn() = teardown;

extern "C" fn setup() {
    let _ = env_logger::Builder::from_env(env_logger::Env::new().filter_or(ENV_LOG, "warn"))
        .try_init();

    real::real();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => fatal(format_args!("invalid configuration: {}", e)),
    };

    // The log is only written at exit: fail now rather than lose the run.
    if let Some(path) = config.output.path() {
        if let Err(e) = File::create(path) {
            fatal(format_args!("cannot create {}: {}", path.display(), e));
        }
    }

    let mut profiler = Profiler::new(config);
    if !profiler.config().counters.is_empty() {
        profiler = profiler.with_counters(Box::new(PerfEventCounters));
    }

    match lockprof::init(profiler) {
        Ok(profiler) => info!(
            "profiling in {} mode, writing to {}",
            profiler.mode(),
            profiler.config().output
        ),
        Err(e) => fatal(format_args!("{}", e)),
    }
}

extern "C" fn teardown() {
    if let Err(e) = lockprof::shutdown() {
        fatal(format_args!("{}", e));
    }
}
