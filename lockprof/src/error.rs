use std::error::Error;
use std::fmt;
use std::io;

/// Errors produced by the binary log codec.
#[derive(Debug)]
pub enum LogError {
    /// The caller handed the codec something it cannot encode.
    Parameter(String),
    /// An operating system call (open, read, write) failed.
    System(io::Error),
    /// An allocation needed by the compression stream failed.
    Memory,
    /// The event stream ended cleanly.
    EndOfFile,
    /// Bad magic, unsupported version, or a structurally broken stream.
    FileFormat(String),
}

impl LogError {
    /// Short name of the error class, as printed by the log tools.
    pub fn name(&self) -> &'static str {
        match self {
            LogError::Parameter(_) => "Parameter",
            LogError::System(_) => "System",
            LogError::Memory => "Memory",
            LogError::EndOfFile => "End-of-file",
            LogError::FileFormat(_) => "Format",
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, LogError::EndOfFile)
    }
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogError::Parameter(msg) | LogError::FileFormat(msg) => {
                write!(f, "{}: {}", self.name(), msg)
            }
            LogError::System(e) => write!(f, "{}: {}", self.name(), e),
            LogError::Memory | LogError::EndOfFile => f.write_str(self.name()),
        }
    }
}

impl Error for LogError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LogError::System(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for LogError {
    fn from(e: io::Error) -> LogError {
        match e.kind() {
            io::ErrorKind::OutOfMemory => LogError::Memory,
            _ => LogError::System(e),
        }
    }
}
