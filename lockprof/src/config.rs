//! Engine configuration, read once at setup from `LOCKPROF_*` variables.

use crate::format::{PerfCounterMap, LOG_MAX_CTRS};
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const ENV_FILE: &str = "LOCKPROF_FILE";
pub const ENV_MODE: &str = "LOCKPROF_MODE";
pub const ENV_CORES: &str = "LOCKPROF_CORES";
pub const ENV_EVENT_PREFIX: &str = "LOCKPROF_EVENT";
pub const ENV_OFFCORE_RSP0: &str = "LOCKPROF_OFFCORE_RSP0";
pub const ENV_IRESET: &str = "LOCKPROF_IRESET";

pub const DEFAULT_OUTPUT: &str = "lockprof.log";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Mode {
    /// Only cumulative per-primitive totals are kept.
    #[default]
    Aggregate,
    /// Every wait interval is kept as well.
    Trace,
}

impl FromStr for Mode {
    type Err = Box<dyn Error + Send + Sync>;

    fn from_str(s: &str) -> Result<Mode, Self::Err> {
        match s.trim() {
            "aggregate" => Ok(Mode::Aggregate),
            "trace" => Ok(Mode::Trace),
            other => Err(format!(
                "invalid {} `{}`: expected `aggregate` or `trace`",
                ENV_MODE, other
            )
            .into()),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Aggregate => "aggregate",
            Mode::Trace => "trace",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Output {
    File(PathBuf),
    Stdout,
}

impl Output {
    /// The path to create, `None` for standard output.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Output::File(path) => Some(path),
            Output::Stdout => None,
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::File(path) => write!(f, "{}", path.display()),
            Output::Stdout => f.write_str("<stdout>"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub output: Output,
    pub mode: Mode,
    /// Core map for affinity hints; empty means no pinning.
    pub cores: Vec<usize>,
    /// Hardware counters each profiled thread opens, empty for none.
    pub counters: PerfCounterMap,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            output: Output::File(PathBuf::from(DEFAULT_OUTPUT)),
            mode: Mode::Aggregate,
            cores: Vec::new(),
            counters: PerfCounterMap::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Config, Box<dyn Error + Send + Sync>> {
        Config::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from `lookup`, which maps a variable name to
    /// its value, if set.
    pub fn from_lookup<F>(lookup: F) -> Result<Config, Box<dyn Error + Send + Sync>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(file) = lookup(ENV_FILE) {
            config.output = match file.as_str() {
                "" => return Err(format!("{} is set but empty", ENV_FILE).into()),
                "-" => Output::Stdout,
                path => Output::File(PathBuf::from(path)),
            };
        }

        if let Some(mode) = lookup(ENV_MODE) {
            config.mode = mode.parse()?;
        }

        if let Some(cores) = lookup(ENV_CORES) {
            config.cores = parse_cores(&cores)?;
        }

        let mut events = Vec::new();
        for i in 0..LOG_MAX_CTRS {
            let name = format!("{}{}", ENV_EVENT_PREFIX, i);
            if let Some(value) = lookup(&name) {
                events.push(parse_hex32(&name, &value)?);
            }
        }
        let offcore_rsp0 = match lookup(ENV_OFFCORE_RSP0) {
            Some(value) => parse_hex32(ENV_OFFCORE_RSP0, &value)?,
            None => 0,
        };
        let ireset = match lookup(ENV_IRESET) {
            Some(value) => parse_hex(ENV_IRESET, &value)?,
            None => 0,
        };
        config.counters = PerfCounterMap::from_events(&events, offcore_rsp0, ireset);

        Ok(config)
    }

    pub fn with_mode(mut self, mode: Mode) -> Config {
        self.mode = mode;
        self
    }

    pub fn with_output(mut self, output: Output) -> Config {
        self.output = output;
        self
    }

    pub fn with_cores(mut self, cores: Vec<usize>) -> Config {
        self.cores = cores;
        self
    }

    /// Affinity hint for the `idx`-th registered thread.
    pub fn core_hint(&self, idx: usize) -> Option<usize> {
        if self.cores.is_empty() {
            None
        } else {
            Some(self.cores[idx % self.cores.len()])
        }
    }
}

fn parse_cores(value: &str) -> Result<Vec<usize>, Box<dyn Error + Send + Sync>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|e| format!("invalid core `{}` in {}: {}", s, ENV_CORES, e).into())
        })
        .collect()
}

fn parse_hex(name: &str, value: &str) -> Result<u64, Box<dyn Error + Send + Sync>> {
    let value = value.trim();
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16)
        .map_err(|e| format!("invalid hex value `{}` for {}: {}", value, name, e).into())
}

/// A hex value stored in a 32-bit field of the counter layout.
fn parse_hex32(name: &str, value: &str) -> Result<u32, Box<dyn Error + Send + Sync>> {
    let wide = parse_hex(name, value)?;
    u32::try_from(wide).map_err(|_| {
        format!(
            "hex value `{}` for {} does not fit in 32 bits",
            value.trim(),
            name
        )
        .into()
    })
}
