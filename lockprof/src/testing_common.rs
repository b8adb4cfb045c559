use crate::counters::{ContentionPool, CounterHandle, CounterSource};
use crate::format::{PerfCounterMap, PmcSample, LOG_MAX_CTRS};
use parking_lot::Mutex;
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Path of a scratch log file for the test `name`, in `test-tmp/`.
pub fn mk_log_path(name: &str) -> PathBuf {
    let mut path = PathBuf::new();

    path.push("test-tmp");
    path.push("lockprof");
    if let Err(e) = fs::create_dir_all(&path) {
        panic!("cannot create {}: {}", path.display(), e);
    }
    path.push(name);
    path.set_extension("log");

    path
}

/// Counters that advance by `step` per counter index on every read, so a
/// thread's lifetime delta is `step * (i + 1)` for counter `i`.
#[derive(Clone, Copy, Debug)]
pub struct SteppingCounters {
    pub step: u64,
}

impl CounterSource for SteppingCounters {
    fn open(&self) -> Result<Box<dyn CounterHandle>, Box<dyn Error + Send + Sync>> {
        Ok(Box::new(SteppingHandle {
            step: self.step,
            configured: 0,
            reads: 0,
        }))
    }
}

struct SteppingHandle {
    step: u64,
    configured: usize,
    reads: u64,
}

impl CounterHandle for SteppingHandle {
    fn configure(&mut self, layout: &PerfCounterMap) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.configured = layout.events().len();
        Ok(())
    }

    fn read(&mut self) -> Result<[u64; LOG_MAX_CTRS], Box<dyn Error + Send + Sync>> {
        let mut values = [0; LOG_MAX_CTRS];
        for (i, value) in values.iter_mut().take(self.configured).enumerate() {
            *value = 1_000 + self.reads * self.step * (i as u64 + 1);
        }
        self.reads += 1;
        Ok(values)
    }
}

/// A contention pool that only records which operations were called.
pub struct RecordingPool {
    pub calls: Arc<Mutex<Vec<&'static str>>>,
    pub workers: Vec<(PerfCounterMap, PmcSample)>,
}

impl RecordingPool {
    pub fn new(workers: Vec<(PerfCounterMap, PmcSample)>) -> RecordingPool {
        RecordingPool {
            calls: Arc::new(Mutex::new(Vec::new())),
            workers,
        }
    }

    fn record(&self, call: &'static str) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.calls.lock().push(call);
        Ok(())
    }
}

impl ContentionPool for RecordingPool {
    fn launch(&mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.record("launch")
    }

    fn resume(&mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.record("resume")
    }

    fn pause(&mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.record("pause")
    }

    fn terminate(&mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.record("terminate")
    }

    fn read_counters(&mut self) -> Result<Vec<PmcSample>, Box<dyn Error + Send + Sync>> {
        self.record("read_counters")?;
        Ok(self.workers.iter().map(|&(_, sample)| sample).collect())
    }

    fn layouts(&self) -> Vec<PerfCounterMap> {
        self.workers.iter().map(|&(layout, _)| layout).collect()
    }
}
