//! On-disk layout of the log file.
//!
//! ```ignore
//!   "LAUNCHER"                      8 bytes, uncompressed
//!   LogHeader                     904 bytes, uncompressed
//!   bzip2 stream of EventRecord  1160 bytes each
//! ```
//!
//! All integers are little endian. The header and the records always carry
//! `LOG_MAX_PROCS` participant entries; `num_processes` says how many of them
//! are in use. If you change any of these structs, bump `LOG_VERSION_CURRENT`.

use crate::error::LogError;
use std::convert::TryInto;
use std::ops::{Add, AddAssign, Sub, SubAssign};

pub const LOG_MAGIC: &[u8; 8] = b"LAUNCHER";
pub const LOG_VERSION_CURRENT: u16 = 3;

/// Hardware counters per participant.
pub const LOG_MAX_CTRS: usize = 8;
/// Participants (profiled threads plus contention workers) per log.
pub const LOG_MAX_PROCS: usize = 16;

pub const PERF_COUNTER_MAP_SIZE: usize = 4 + 4 * LOG_MAX_CTRS + 4 + 8;
pub const PROCESS_HEADER_SIZE: usize = 4 + 4 + PERF_COUNTER_MAP_SIZE;
pub const LOG_HEADER_SIZE: usize = 2 + 2 + 4 + LOG_MAX_PROCS * PROCESS_HEADER_SIZE;
pub const PMC_SAMPLE_SIZE: usize = 8 + 8 * LOG_MAX_CTRS;
pub const EVENT_RECORD_SIZE: usize = 4 + 4 + LOG_MAX_PROCS * PMC_SAMPLE_SIZE;

/// Event selector of the off-core response event; `offcore_rsp0` only
/// matters for counters programmed with it.
pub const OFFCORE_RESPONSE_EVENTSEL: u32 = 0x41_01b7;

/// Which hardware events one participant's counters were programmed with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PerfCounterMap {
    /// Number of valid entries in `eventsel_map`.
    pub counters: u32,
    pub eventsel_map: [u32; LOG_MAX_CTRS],
    pub offcore_rsp0: u32,
    /// Interrupt-reset threshold of an overflow-driven counter, 0 if unused.
    pub ireset: u64,
}

impl PerfCounterMap {
    pub fn from_events(events: &[u32], offcore_rsp0: u32, ireset: u64) -> PerfCounterMap {
        let mut map = PerfCounterMap {
            offcore_rsp0,
            ireset,
            ..PerfCounterMap::default()
        };
        for (slot, &event) in map.eventsel_map.iter_mut().zip(events) {
            *slot = event;
            map.counters += 1;
        }
        map
    }

    /// The programmed event selectors.
    pub fn events(&self) -> &[u32] {
        let len = (self.counters as usize).min(LOG_MAX_CTRS);
        &self.eventsel_map[..len]
    }

    pub fn is_empty(&self) -> bool {
        self.counters == 0
    }

    fn serialize(&self, bytes: &mut [u8]) {
        put_u32(&mut bytes[0..4], self.counters);
        for (i, event) in self.eventsel_map.iter().enumerate() {
            let at = 4 + 4 * i;
            put_u32(&mut bytes[at..at + 4], *event);
        }
        let at = 4 + 4 * LOG_MAX_CTRS;
        put_u32(&mut bytes[at..at + 4], self.offcore_rsp0);
        put_u64(&mut bytes[at + 4..at + 12], self.ireset);
    }

    fn deserialize(bytes: &[u8]) -> PerfCounterMap {
        let mut eventsel_map = [0; LOG_MAX_CTRS];
        for (i, event) in eventsel_map.iter_mut().enumerate() {
            let at = 4 + 4 * i;
            *event = get_u32(&bytes[at..at + 4]);
        }
        let at = 4 + 4 * LOG_MAX_CTRS;
        PerfCounterMap {
            counters: get_u32(&bytes[0..4]),
            eventsel_map,
            offcore_rsp0: get_u32(&bytes[at..at + 4]),
            ireset: get_u64(&bytes[at + 4..at + 12]),
        }
    }
}

/// Per-participant part of the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessHeader {
    /// Core the participant was pinned to, -1 if unspecified.
    pub core: i32,
    /// NUMA node the participant was bound to, -1 if unspecified.
    pub node: i32,
    pub pmc_map: PerfCounterMap,
}

impl Default for ProcessHeader {
    fn default() -> Self {
        ProcessHeader {
            core: -1,
            node: -1,
            pmc_map: PerfCounterMap::default(),
        }
    }
}

impl ProcessHeader {
    fn serialize(&self, bytes: &mut [u8]) {
        put_u32(&mut bytes[0..4], self.core as u32);
        put_u32(&mut bytes[4..8], self.node as u32);
        self.pmc_map.serialize(&mut bytes[8..PROCESS_HEADER_SIZE]);
    }

    fn deserialize(bytes: &[u8]) -> ProcessHeader {
        ProcessHeader {
            core: get_u32(&bytes[0..4]) as i32,
            node: get_u32(&bytes[4..8]) as i32,
            pmc_map: PerfCounterMap::deserialize(&bytes[8..PROCESS_HEADER_SIZE]),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogHeader {
    pub version: u16,
    pub num_processes: u32,
    pub processes: [ProcessHeader; LOG_MAX_PROCS],
}

impl Default for LogHeader {
    fn default() -> Self {
        LogHeader {
            version: LOG_VERSION_CURRENT,
            num_processes: 0,
            processes: [ProcessHeader::default(); LOG_MAX_PROCS],
        }
    }
}

impl LogHeader {
    pub fn new() -> LogHeader {
        LogHeader::default()
    }

    /// Append a participant. Fails once `LOG_MAX_PROCS` are in use.
    pub fn push_process(&mut self, process: ProcessHeader) -> Result<(), LogError> {
        let idx = self.num_processes as usize;
        if idx >= LOG_MAX_PROCS {
            return Err(LogError::Parameter(format!(
                "log header already holds the maximum of {} participants",
                LOG_MAX_PROCS
            )));
        }
        self.processes[idx] = process;
        self.num_processes += 1;
        Ok(())
    }

    /// The participants in use.
    pub fn processes(&self) -> &[ProcessHeader] {
        let len = (self.num_processes as usize).min(LOG_MAX_PROCS);
        &self.processes[..len]
    }

    pub fn serialize(&self, bytes: &mut [u8]) {
        assert_eq!(bytes.len(), LOG_HEADER_SIZE);
        put_u16(&mut bytes[0..2], self.version);
        put_u16(&mut bytes[2..4], 0);
        put_u32(&mut bytes[4..8], self.num_processes);
        for (i, process) in self.processes.iter().enumerate() {
            let at = 8 + i * PROCESS_HEADER_SIZE;
            process.serialize(&mut bytes[at..at + PROCESS_HEADER_SIZE]);
        }
    }

    pub fn deserialize(bytes: &[u8]) -> LogHeader {
        assert_eq!(bytes.len(), LOG_HEADER_SIZE);
        let mut processes = [ProcessHeader::default(); LOG_MAX_PROCS];
        for (i, process) in processes.iter_mut().enumerate() {
            let at = 8 + i * PROCESS_HEADER_SIZE;
            *process = ProcessHeader::deserialize(&bytes[at..at + PROCESS_HEADER_SIZE]);
        }
        LogHeader {
            version: get_u16(&bytes[0..2]),
            num_processes: get_u32(&bytes[4..8]),
            processes,
        }
    }
}

/// One participant's cycle count plus its hardware counter values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PmcSample {
    pub tsc: u64,
    pub pmc: [u64; LOG_MAX_CTRS],
}

impl PmcSample {
    pub fn from_tsc(tsc: u64) -> PmcSample {
        PmcSample {
            tsc,
            ..PmcSample::default()
        }
    }

    fn serialize(&self, bytes: &mut [u8]) {
        put_u64(&mut bytes[0..8], self.tsc);
        for (i, value) in self.pmc.iter().enumerate() {
            let at = 8 + 8 * i;
            put_u64(&mut bytes[at..at + 8], *value);
        }
    }

    fn deserialize(bytes: &[u8]) -> PmcSample {
        let mut pmc = [0; LOG_MAX_CTRS];
        for (i, value) in pmc.iter_mut().enumerate() {
            let at = 8 + 8 * i;
            *value = get_u64(&bytes[at..at + 8]);
        }
        PmcSample {
            tsc: get_u64(&bytes[0..8]),
            pmc,
        }
    }
}

// Counters are unsigned and monotonic within a run, so field-wise arithmetic
// wraps instead of checking for overflow.
impl Add for PmcSample {
    type Output = PmcSample;

    fn add(mut self, rhs: PmcSample) -> PmcSample {
        self += rhs;
        self
    }
}

impl AddAssign for PmcSample {
    fn add_assign(&mut self, rhs: PmcSample) {
        self.tsc = self.tsc.wrapping_add(rhs.tsc);
        for (a, b) in self.pmc.iter_mut().zip(rhs.pmc.iter()) {
            *a = a.wrapping_add(*b);
        }
    }
}

impl Sub for PmcSample {
    type Output = PmcSample;

    fn sub(mut self, rhs: PmcSample) -> PmcSample {
        self -= rhs;
        self
    }
}

impl SubAssign for PmcSample {
    fn sub_assign(&mut self, rhs: PmcSample) {
        self.tsc = self.tsc.wrapping_sub(rhs.tsc);
        for (a, b) in self.pmc.iter_mut().zip(rhs.pmc.iter()) {
            *a = a.wrapping_sub(*b);
        }
    }
}

/// One row of the log: a sample per participant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub num_processes: u32,
    pub pmc: [PmcSample; LOG_MAX_PROCS],
}

impl Default for EventRecord {
    fn default() -> Self {
        EventRecord {
            num_processes: 0,
            pmc: [PmcSample::default(); LOG_MAX_PROCS],
        }
    }
}

impl EventRecord {
    pub fn new() -> EventRecord {
        EventRecord::default()
    }

    /// Build a record from one sample per participant. Samples past
    /// `LOG_MAX_PROCS` are dropped.
    pub fn from_samples<I: IntoIterator<Item = PmcSample>>(samples: I) -> EventRecord {
        let mut record = EventRecord::new();
        for sample in samples.into_iter().take(LOG_MAX_PROCS) {
            record.pmc[record.num_processes as usize] = sample;
            record.num_processes += 1;
        }
        record
    }

    /// Append a participant's sample, returning `false` if the record is full.
    pub fn push(&mut self, sample: PmcSample) -> bool {
        let idx = self.num_processes as usize;
        if idx >= LOG_MAX_PROCS {
            return false;
        }
        self.pmc[idx] = sample;
        self.num_processes += 1;
        true
    }

    pub fn samples(&self) -> &[PmcSample] {
        let len = (self.num_processes as usize).min(LOG_MAX_PROCS);
        &self.pmc[..len]
    }

    pub fn serialize(&self, bytes: &mut [u8]) {
        assert_eq!(bytes.len(), EVENT_RECORD_SIZE);
        put_u32(&mut bytes[0..4], self.num_processes);
        put_u32(&mut bytes[4..8], 0);
        for (i, sample) in self.pmc.iter().enumerate() {
            let at = 8 + i * PMC_SAMPLE_SIZE;
            sample.serialize(&mut bytes[at..at + PMC_SAMPLE_SIZE]);
        }
    }

    pub fn deserialize(bytes: &[u8]) -> EventRecord {
        assert_eq!(bytes.len(), EVENT_RECORD_SIZE);
        let mut pmc = [PmcSample::default(); LOG_MAX_PROCS];
        for (i, sample) in pmc.iter_mut().enumerate() {
            let at = 8 + i * PMC_SAMPLE_SIZE;
            *sample = PmcSample::deserialize(&bytes[at..at + PMC_SAMPLE_SIZE]);
        }
        EventRecord {
            num_processes: get_u32(&bytes[0..4]),
            pmc,
        }
    }
}

// Record arithmetic runs over every participant slot, used or not. The
// result keeps the left-hand side's participant count.
impl Add for EventRecord {
    type Output = EventRecord;

    fn add(mut self, rhs: EventRecord) -> EventRecord {
        self += rhs;
        self
    }
}

impl AddAssign for EventRecord {
    fn add_assign(&mut self, rhs: EventRecord) {
        for (a, b) in self.pmc.iter_mut().zip(rhs.pmc.iter()) {
            *a += *b;
        }
    }
}

impl Sub for EventRecord {
    type Output = EventRecord;

    fn sub(mut self, rhs: EventRecord) -> EventRecord {
        self -= rhs;
        self
    }
}

impl SubAssign for EventRecord {
    fn sub_assign(&mut self, rhs: EventRecord) {
        for (a, b) in self.pmc.iter_mut().zip(rhs.pmc.iter()) {
            *a -= *b;
        }
    }
}

#[inline]
fn put_u16(bytes: &mut [u8], value: u16) {
    bytes.copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn put_u32(bytes: &mut [u8], value: u32) {
    bytes.copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn put_u64(bytes: &mut [u8], value: u64) {
    bytes.copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn get_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes(bytes.try_into().unwrap())
}

#[inline]
fn get_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes.try_into().unwrap())
}

#[inline]
fn get_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes.try_into().unwrap())
}
