//! Turning the registry into the log file, once every profiled thread exited.
//!
//! Participants are the registered threads in creation order, followed by the
//! contention pool's workers. The records are written in this order:
//!
//! 1. mutex spin
//! 2. barrier spin
//! 3. rwlock spin
//! 4. start skew: `tsc_start - min(tsc_start)`
//! 5. end skew: `max(tsc_end) - tsc_end`
//! 6. lifetime: `tsc_end - tsc_start`, plus the hardware counter deltas
//! 7. in trace mode, one record per sample index `j`, where participant `i`
//!    holds its `j`-th wait: `tsc` is the waited cycles, `pmc[0]` the
//!    primitive code and `pmc[1]` the cycle clock reading when it started.
//!
//! Pool workers only carry values in the lifetime record. Threads that were
//! still running have no end of lifetime yet: their skew and lifetime entries
//! are left at zero.
//!
//! The summary lists every thread, including the ones that did not fit in the
//! log.

use crate::accumulator::WaitSample;
use crate::config::Mode;
use crate::format::{
    EventRecord, LogHeader, PerfCounterMap, PmcSample, ProcessHeader, LOG_MAX_PROCS,
};
use crate::log_file::LogWriter;
use crate::profiler::Profiler;
use crate::registry::{SlotId, SlotSnapshot, SlotState};
use std::error::Error;
use std::fmt;
use std::sync::atomic::Ordering;

pub const RECORD_MUTEX: usize = 0;
pub const RECORD_BARRIER: usize = 1;
pub const RECORD_RWLOCK: usize = 2;
pub const RECORD_START_SKEW: usize = 3;
pub const RECORD_END_SKEW: usize = 4;
pub const RECORD_LIFETIME: usize = 5;
/// Index of the first trace record.
pub const RECORD_TRACE: usize = 6;

/// Per-thread line of the summary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadSummary {
    pub id: SlotId,
    pub core: Option<usize>,
    pub lifetime: u64,
    pub mutex_spin: u64,
    pub rwlock_spin: u64,
    pub barrier_spin: u64,
}

/// Everything the finalizer produced.
#[derive(Clone, Debug)]
pub struct Report {
    pub mode: Mode,
    pub header: LogHeader,
    pub records: Vec<EventRecord>,
    pub threads: Vec<ThreadSummary>,
    pub wasted: u64,
    /// Threads and pool workers that did not fit in the log.
    pub dropped: usize,
}

struct Participant {
    id: SlotId,
    snapshot: SlotSnapshot,
    samples: Vec<WaitSample>,
}

impl Participant {
    fn finished(&self) -> bool {
        self.snapshot.state == SlotState::Finished
    }
}

impl Profiler {
    /// Build the report from the registry, without writing anything.
    /// `pool` holds one `(layout, sample)` pair per pool worker.
    ///
    /// Every registered thread must have exited.
    pub fn report(&self, pool: &[(PerfCounterMap, PmcSample)]) -> Report {
        let mut participants = Vec::new();
        self.registry.for_each_active(|id, slot| match slot.state() {
            SlotState::Unused | SlotState::Reserved => {
                debug!("thread {} never started", id);
            }
            state => {
                if state == SlotState::Active {
                    warn!("thread {} is still running at finalization", id);
                }
                participants.push(Participant {
                    id,
                    snapshot: slot.snapshot(),
                    samples: slot.samples(),
                });
            }
        });

        let threads = participants
            .iter()
            .map(|p| ThreadSummary {
                id: p.id,
                core: p.snapshot.core,
                lifetime: p.snapshot.lifetime(),
                mutex_spin: p.snapshot.mutex_spin,
                rwlock_spin: p.snapshot.rwlock_spin,
                barrier_spin: p.snapshot.barrier_spin,
            })
            .collect();

        let mut dropped = 0;
        if participants.len() > LOG_MAX_PROCS {
            dropped += participants.len() - LOG_MAX_PROCS;
            participants.truncate(LOG_MAX_PROCS);
        }
        let pool_len = pool.len().min(LOG_MAX_PROCS - participants.len());
        dropped += pool.len() - pool_len;
        let pool = &pool[..pool_len];
        if dropped > 0 {
            warn!(
                "only {} participants fit in the log, {} dropped",
                LOG_MAX_PROCS, dropped
            );
        }

        let mut header = LogHeader::new();
        let processes = participants
            .iter()
            .map(|p| ProcessHeader {
                core: p.snapshot.core.map_or(-1, |core| core as i32),
                node: -1,
                pmc_map: self.config.counters,
            })
            .chain(pool.iter().map(|(layout, _)| ProcessHeader {
                pmc_map: *layout,
                ..ProcessHeader::default()
            }));
        for (entry, process) in header.processes.iter_mut().zip(processes) {
            *entry = process;
            header.num_processes += 1;
        }

        let first_start = participants
            .iter()
            .filter(|p| p.finished())
            .map(|p| p.snapshot.tsc_start)
            .min()
            .unwrap_or(0);
        let last_end = participants
            .iter()
            .filter(|p| p.finished())
            .map(|p| p.snapshot.tsc_end)
            .max()
            .unwrap_or(0);
        let finished = |p: &Participant, tsc: u64| {
            if p.finished() {
                PmcSample::from_tsc(tsc)
            } else {
                PmcSample::default()
            }
        };

        // A record with one sample per thread, and zeroes for the pool.
        let per_thread = |f: &dyn Fn(&Participant) -> PmcSample| {
            EventRecord::from_samples(
                participants
                    .iter()
                    .map(f)
                    .chain(pool.iter().map(|_| PmcSample::default())),
            )
        };

        let mut records = vec![
            per_thread(&|p| PmcSample::from_tsc(p.snapshot.mutex_spin)),
            per_thread(&|p| PmcSample::from_tsc(p.snapshot.barrier_spin)),
            per_thread(&|p| PmcSample::from_tsc(p.snapshot.rwlock_spin)),
            per_thread(&|p| finished(p, p.snapshot.tsc_start.wrapping_sub(first_start))),
            per_thread(&|p| finished(p, last_end.wrapping_sub(p.snapshot.tsc_end))),
            EventRecord::from_samples(
                participants
                    .iter()
                    .map(|p| PmcSample {
                        pmc: p.snapshot.pmc,
                        ..finished(p, p.snapshot.lifetime())
                    })
                    .chain(pool.iter().map(|&(_, sample)| sample)),
            ),
        ];

        if self.mode() == Mode::Trace {
            let longest = participants.iter().map(|p| p.samples.len()).max().unwrap_or(0);
            for j in 0..longest {
                records.push(per_thread(&|p| match p.samples.get(j) {
                    Some(sample) => {
                        let mut pmc = PmcSample::from_tsc(sample.cycles);
                        pmc.pmc[0] = sample.kind.code();
                        pmc.pmc[1] = sample.start;
                        pmc
                    }
                    None => PmcSample::default(),
                }));
            }
        }

        Report {
            mode: self.mode(),
            header,
            records,
            threads,
            wasted: self.wasted(),
            dropped,
        }
    }

    /// Collect the contention pool's results, write the log to the configured
    /// output and print the summary to standard error.
    ///
    /// Runs at most once: later calls return `Ok(None)`. Every registered
    /// thread must have exited.
    pub fn finalize(&self) -> Result<Option<Report>, Box<dyn Error + Send + Sync>> {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return Ok(None);
        }

        let pool: Vec<(PerfCounterMap, PmcSample)> = match self.pool.lock().take() {
            Some(mut pool) => {
                pool.pause()
                    .map_err(|e| format!("failed to pause contention pool: {}", e))?;
                let samples = pool
                    .read_counters()
                    .map_err(|e| format!("failed to read contention pool counters: {}", e))?;
                pool.terminate()
                    .map_err(|e| format!("failed to terminate contention pool: {}", e))?;
                pool.layouts().into_iter().zip(samples).collect()
            }
            None => Vec::new(),
        };

        let report = self.report(&pool);

        let mut writer = LogWriter::create(&report.header, self.config.output.path())
            .map_err(|e| format!("cannot create {}: {}", self.config.output, e))?;
        for record in &report.records {
            writer.write_event(record)?;
        }
        writer.close()?;
        info!(
            "wrote {} records for {} participants to {}",
            report.records.len(),
            report.header.num_processes,
            self.config.output
        );

        eprint!("{}", report);
        Ok(Some(report))
    }
}

/// Finalize the process-wide profiler, if one is installed.
pub fn shutdown() -> Result<Option<Report>, Box<dyn Error + Send + Sync>> {
    match crate::profiler::global() {
        Some(profiler) => profiler.finalize(),
        None => Ok(None),
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "lockprof: {} threads profiled ({} mode)",
            self.threads.len(),
            self.mode
        )?;
        writeln!(
            f,
            "{:>8} {:>6} {:>16} {:>16} {:>16} {:>16}",
            "thread", "core", "cycles", "mutex", "rwlock", "barrier"
        )?;
        for t in &self.threads {
            let core = t.core.map_or_else(|| "-".to_string(), |c| c.to_string());
            writeln!(
                f,
                "{:>8} {:>6} {:>16} {:>16} {:>16} {:>16}",
                t.id, core, t.lifetime, t.mutex_spin, t.rwlock_spin, t.barrier_spin
            )?;
        }
        writeln!(f, "lockprof: wasted synchronization cycles: {}", self.wasted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::Primitive;
    use crate::config::Config;

    #[test]
    fn empty_registry_has_no_participants() {
        let profiler = Profiler::new(Config::default());
        let report = profiler.report(&[]);
        assert_eq!(report.header.num_processes, 0);
        assert_eq!(report.records.len(), RECORD_TRACE);
        assert!(report.records.iter().all(|r| r.num_processes == 0));
    }

    #[test]
    fn reserved_slots_are_skipped() {
        let profiler = Profiler::new(Config::default());
        profiler.register_thread().unwrap();
        let report = profiler.report(&[]);
        assert_eq!(report.header.num_processes, 0);
    }

    #[test]
    fn pool_workers_follow_threads() {
        let profiler = Profiler::new(Config::default());
        let id = profiler.register_thread().unwrap();
        std::thread::scope(|s| {
            s.spawn(|| {
                profiler.run_thread(id, || {
                    profiler.measure(Primitive::Mutex, || ());
                })
            });
        });

        let layout = PerfCounterMap::from_events(&[0x412e], 0, 0);
        let mut worker = PmcSample::from_tsc(500);
        worker.pmc[0] = 77;
        let report = profiler.report(&[(layout, worker)]);

        assert_eq!(report.header.num_processes, 2);
        assert_eq!(report.header.processes()[1].pmc_map, layout);
        assert_eq!(report.records[RECORD_MUTEX].samples()[1], PmcSample::default());
        assert_eq!(report.records[RECORD_LIFETIME].samples()[1], worker);
        assert_eq!(report.records[RECORD_START_SKEW].samples()[0].tsc, 0);
        assert_eq!(report.records[RECORD_END_SKEW].samples()[0].tsc, 0);
    }

    fn run_threads(profiler: &Profiler, n: usize) {
        std::thread::scope(|s| {
            for _ in 0..n {
                let id = profiler.register_thread().unwrap();
                s.spawn(move || {
                    profiler.run_thread(id, || profiler.measure(Primitive::Mutex, || ()))
                });
            }
        });
    }

    #[test]
    fn threads_beyond_the_log_stay_in_the_summary() {
        let profiler = Profiler::new(Config::default());
        run_threads(&profiler, LOG_MAX_PROCS + 4);

        let report = profiler.report(&[]);
        assert_eq!(report.header.num_processes as usize, LOG_MAX_PROCS);
        assert_eq!(report.dropped, 4);
        assert_eq!(report.threads.len(), LOG_MAX_PROCS + 4);
        assert_eq!(report.threads.last().unwrap().id, SlotId(LOG_MAX_PROCS + 3));
        assert!(report.to_string().contains("20 threads profiled"));
    }

    #[test]
    fn running_threads_have_no_skew_or_lifetime() {
        let profiler = Profiler::new(Config::default());
        run_threads(&profiler, 1);

        // Bound but never finished, as a thread still blocked at exit.
        let id = profiler.register_thread().unwrap();
        let slot = profiler.registry().slot(id).unwrap();
        slot.set_state(SlotState::Active);
        slot.tsc_start.store(1, Ordering::Relaxed);
        slot.mutex_spin.store(500, Ordering::Relaxed);

        let report = profiler.report(&[]);
        assert_eq!(report.header.num_processes, 2);
        assert_eq!(report.records[RECORD_MUTEX].samples()[1].tsc, 500);
        for record in [RECORD_START_SKEW, RECORD_END_SKEW, RECORD_LIFETIME] {
            assert_eq!(report.records[record].samples()[1], PmcSample::default());
        }
        assert_eq!(report.records[RECORD_START_SKEW].samples()[0].tsc, 0);
        assert_eq!(report.records[RECORD_END_SKEW].samples()[0].tsc, 0);
    }

    #[test]
    fn summary_lists_every_thread() {
        let report = Report {
            mode: Mode::Aggregate,
            header: LogHeader::new(),
            records: Vec::new(),
            threads: vec![ThreadSummary {
                id: SlotId(0),
                core: Some(2),
                lifetime: 1000,
                mutex_spin: 10,
                rwlock_spin: 20,
                barrier_spin: 30,
            }],
            wasted: 12,
            dropped: 0,
        };
        let text = report.to_string();
        assert!(text.contains("1 threads profiled (aggregate mode)"));
        assert!(text.contains("1000"));
        assert!(text.ends_with("wasted synchronization cycles: 12\n"));
    }
}
