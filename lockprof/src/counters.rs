//! Collaborators that feed hardware counter values into the log.
//!
//! A [`CounterSource`] opens one [`CounterHandle`] per profiled thread: the
//! thread configures it with the layout from the configuration when it starts
//! and reads it once more when it ends, and the difference lands in the
//! lifetime record. [`PerfEventCounters`] is the only source shipped, backed by
//! raw `perf_event_open` events.
//!
//! A [`ContentionPool`] runs auxiliary workers that generate memory
//! contention; their counter samples are appended to the log as extra
//! participants.

use crate::format::{PerfCounterMap, PmcSample, LOG_MAX_CTRS};
use std::error::Error;

pub trait CounterHandle: Send {
    /// Program the counters described by `layout`.
    fn configure(&mut self, layout: &PerfCounterMap) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Current values, in layout order. Unused slots read as zero.
    fn read(&mut self) -> Result<[u64; LOG_MAX_CTRS], Box<dyn Error + Send + Sync>>;
}

pub trait CounterSource: Send + Sync {
    /// Open a handle counting events of the calling thread.
    fn open(&self) -> Result<Box<dyn CounterHandle>, Box<dyn Error + Send + Sync>>;
}

pub trait ContentionPool: Send {
    fn launch(&mut self) -> Result<(), Box<dyn Error + Send + Sync>>;
    fn resume(&mut self) -> Result<(), Box<dyn Error + Send + Sync>>;
    fn pause(&mut self) -> Result<(), Box<dyn Error + Send + Sync>>;
    fn terminate(&mut self) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// One sample per worker, in worker order.
    fn read_counters(&mut self) -> Result<Vec<PmcSample>, Box<dyn Error + Send + Sync>>;

    /// Counter layout of every worker, in worker order.
    fn layouts(&self) -> Vec<PerfCounterMap>;
}

/// Raw hardware events through `perf_event_open(2)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PerfEventCounters;

impl CounterSource for PerfEventCounters {
    fn open(&self) -> Result<Box<dyn CounterHandle>, Box<dyn Error + Send + Sync>> {
        Ok(Box::new(PerfEventHandle::default()))
    }
}

#[derive(Default)]
pub struct PerfEventHandle {
    events: Vec<hw::Event>,
}

impl CounterHandle for PerfEventHandle {
    fn configure(&mut self, layout: &PerfCounterMap) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.events = layout
            .events()
            .iter()
            .map(|&eventsel| hw::Event::open(eventsel, layout.offcore_rsp0))
            .collect::<Result<_, _>>()?;
        if !self.events.is_empty() {
            debug!("opened {} hardware counters", self.events.len());
        }
        Ok(())
    }

    fn read(&mut self) -> Result<[u64; LOG_MAX_CTRS], Box<dyn Error + Send + Sync>> {
        let mut values = [0; LOG_MAX_CTRS];
        for (value, event) in values.iter_mut().zip(self.events.iter_mut()) {
            *value = event.read()?;
        }
        Ok(values)
    }
}

/// Linux x86_64 implementation based on `perf_event_open` and `read(2)`.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
mod hw {
    use crate::format::OFFCORE_RESPONSE_EVENTSEL;
    use perf_event_open_sys::{bindings::*, perf_event_open};
    use std::convert::TryInto;
    use std::error::Error;
    use std::fs;
    use std::io::Read;
    use std::mem;
    use std::os::unix::io::FromRawFd;

    pub(super) struct Event {
        file: fs::File,
    }

    impl Event {
        pub(super) fn open(
            eventsel: u32,
            offcore_rsp0: u32,
        ) -> Result<Self, Box<dyn Error + Send + Sync>> {
            let mut attrs = perf_event_attr {
                size: mem::size_of::<perf_event_attr>().try_into()?,
                type_: PERF_TYPE_RAW,
                config: eventsel.into(),
                ..perf_event_attr::default()
            };
            if eventsel == OFFCORE_RESPONSE_EVENTSEL {
                attrs.__bindgen_anon_3.config1 = offcore_rsp0.into();
            }

            // `pid = 0` is the calling thread, not the whole process.
            let pid = 0;
            let cpu = -1;
            let group_fd = -1;
            attrs.set_exclude_kernel(1);
            attrs.set_exclude_hv(1);

            let file = unsafe {
                let fd =
                    perf_event_open(&mut attrs, pid, cpu, group_fd, PERF_FLAG_FD_CLOEXEC.into());
                if fd < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(fs::File::from_raw_fd(fd))
                }
            };
            let file = file
                .map_err(|e| format!("perf_event_open failed for event {:#x}: {:?}", eventsel, e))?;

            Ok(Event { file })
        }

        pub(super) fn read(&mut self) -> Result<u64, Box<dyn Error + Send + Sync>> {
            let mut buf = [0u8; 8];
            self.file
                .read_exact(&mut buf)
                .map_err(|e| format!("reading hardware counter failed: {:?}", e))?;
            Ok(u64::from_ne_bytes(buf))
        }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
mod hw {
    use std::error::Error;

    pub(super) enum Event {}

    impl Event {
        pub(super) fn open(
            _eventsel: u32,
            _offcore_rsp0: u32,
        ) -> Result<Self, Box<dyn Error + Send + Sync>> {
            Err("hardware counters are only supported on x86_64 Linux".into())
        }

        pub(super) fn read(&mut self) -> Result<u64, Box<dyn Error + Send + Sync>> {
            match *self {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_layout_reads_zero() {
        let mut handle = PerfEventCounters.open().unwrap();
        handle.configure(&PerfCounterMap::default()).unwrap();
        assert_eq!(handle.read().unwrap(), [0; LOG_MAX_CTRS]);
    }
}
