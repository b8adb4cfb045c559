//! Reading and writing log files.
//!
//! A log is written once, front to back, by a [`LogWriter`] and read back by
//! a [`LogReader`]. The magic and the header are stored as plain bytes so a
//! reader can reject a foreign file before touching the compressed part;
//! only the event records go through the bzip2 stream.

use crate::error::LogError;
use crate::format::{
    EventRecord, LogHeader, EVENT_RECORD_SIZE, LOG_HEADER_SIZE, LOG_MAGIC, LOG_MAX_PROCS,
    LOG_VERSION_CURRENT,
};
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Where a log created by path goes: a file, or standard output.
pub enum Sink {
    File(BufWriter<File>),
    Stdout(io::Stdout),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::File(f) => f.write(buf),
            Sink::Stdout(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::File(f) => f.flush(),
            Sink::Stdout(s) => s.flush(),
        }
    }
}

/// Where a log opened by path comes from: a file, or standard input.
pub enum Source {
    File(BufReader<File>),
    Stdin(io::Stdin),
}

impl Read for Source {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Source::File(f) => f.read(buf),
            Source::Stdin(s) => s.read(buf),
        }
    }
}

pub struct LogWriter<W: Write> {
    encoder: BzEncoder<W>,
    header: LogHeader,
}

impl LogWriter<Sink> {
    /// Create a log at `path`, or on standard output if `path` is `None`.
    pub fn create(header: &LogHeader, path: Option<&Path>) -> Result<Self, LogError> {
        let sink = match path {
            Some(path) => Sink::File(BufWriter::new(File::create(path)?)),
            None => Sink::Stdout(io::stdout()),
        };
        LogWriter::new(header, sink)
    }
}

impl<W: Write> LogWriter<W> {
    /// Write the magic and `header` to `sink` and start the event stream.
    /// The stored header always carries the current format version.
    pub fn new(header: &LogHeader, mut sink: W) -> Result<Self, LogError> {
        if header.num_processes as usize > LOG_MAX_PROCS {
            return Err(LogError::Parameter(format!(
                "{} participants requested, at most {} fit in a log",
                header.num_processes, LOG_MAX_PROCS
            )));
        }

        let mut header = header.clone();
        header.version = LOG_VERSION_CURRENT;

        let mut bytes = vec![0; LOG_HEADER_SIZE];
        header.serialize(&mut bytes);
        sink.write_all(LOG_MAGIC)?;
        sink.write_all(&bytes)?;

        Ok(LogWriter {
            encoder: BzEncoder::new(sink, Compression::fast()),
            header,
        })
    }

    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    pub fn write_event(&mut self, event: &EventRecord) -> Result<(), LogError> {
        if event.num_processes != self.header.num_processes {
            return Err(LogError::Parameter(format!(
                "event has {} participants but the log header declares {}",
                event.num_processes, self.header.num_processes
            )));
        }

        let mut bytes = [0; EVENT_RECORD_SIZE];
        event.serialize(&mut bytes);
        self.encoder.write_all(&bytes)?;
        Ok(())
    }

    /// Finish the compressed stream and hand back the flushed sink.
    pub fn finish(self) -> Result<W, LogError> {
        let mut sink = self.encoder.finish()?;
        sink.flush()?;
        Ok(sink)
    }

    /// Finish the compressed stream and close the sink. Standard output is
    /// flushed but stays open.
    pub fn close(self) -> Result<(), LogError> {
        self.finish().map(drop)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ReadState {
    Streaming,
    Exhausted,
}

pub struct LogReader<R: Read> {
    decoder: BzDecoder<R>,
    header: LogHeader,
    state: ReadState,
}

impl LogReader<Source> {
    /// Open the log at `path`, or read it from standard input if `path` is `None`.
    pub fn open(path: Option<&Path>) -> Result<Self, LogError> {
        let source = match path {
            Some(path) => Source::File(BufReader::new(File::open(path)?)),
            None => Source::Stdin(io::stdin()),
        };
        LogReader::new(source)
    }
}

impl<R: Read> LogReader<R> {
    /// Validate the magic and the header version, then start decoding the
    /// event stream.
    pub fn new(mut source: R) -> Result<Self, LogError> {
        let mut magic = [0; LOG_MAGIC.len()];
        read_exact_or_format_error(&mut source, &mut magic, "magic")?;
        if &magic != LOG_MAGIC {
            return Err(LogError::FileFormat(format!(
                "bad magic {:?}, expected {:?}",
                String::from_utf8_lossy(&magic),
                String::from_utf8_lossy(LOG_MAGIC)
            )));
        }

        let mut bytes = vec![0; LOG_HEADER_SIZE];
        read_exact_or_format_error(&mut source, &mut bytes, "header")?;
        let header = LogHeader::deserialize(&bytes);

        if header.version != LOG_VERSION_CURRENT {
            return Err(LogError::FileFormat(format!(
                "file format version {} is not supported, expected {}",
                header.version, LOG_VERSION_CURRENT
            )));
        }
        if header.num_processes as usize > LOG_MAX_PROCS {
            return Err(LogError::FileFormat(format!(
                "header declares {} participants, at most {} are possible",
                header.num_processes, LOG_MAX_PROCS
            )));
        }

        Ok(LogReader {
            decoder: BzDecoder::new(source),
            header,
            state: ReadState::Streaming,
        })
    }

    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    /// Read the next record.
    ///
    /// Returns `LogError::EndOfFile` exactly once, when the compressed stream
    /// ends on a record boundary. Any read after that, or a stream that ends
    /// in the middle of a record, is a `FileFormat` error.
    pub fn read_event(&mut self) -> Result<EventRecord, LogError> {
        if self.state == ReadState::Exhausted {
            return Err(LogError::FileFormat(
                "read past the end of the event stream".to_string(),
            ));
        }

        let mut bytes = [0; EVENT_RECORD_SIZE];
        let filled = match read_full(&mut self.decoder, &mut bytes) {
            Ok(filled) => filled,
            Err(e) => {
                self.state = ReadState::Exhausted;
                return Err(stream_error(e));
            }
        };

        if filled == EVENT_RECORD_SIZE {
            return Ok(EventRecord::deserialize(&bytes));
        }

        self.state = ReadState::Exhausted;
        if filled == 0 {
            Err(LogError::EndOfFile)
        } else {
            Err(LogError::FileFormat(format!(
                "event stream ends {} bytes into a {} byte record",
                filled, EVENT_RECORD_SIZE
            )))
        }
    }

    /// Iterate over the remaining records, stopping at the end of the stream.
    pub fn events(&mut self) -> Events<'_, R> {
        Events { reader: self }
    }

    /// Release the decompression state and close the source. Standard input
    /// stays open.
    pub fn close(self) -> Result<(), LogError> {
        drop(self.decoder.into_inner());
        Ok(())
    }
}

pub struct Events<'a, R: Read> {
    reader: &'a mut LogReader<R>,
}

impl<'a, R: Read> Iterator for Events<'a, R> {
    type Item = Result<EventRecord, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.reader.state == ReadState::Exhausted {
            return None;
        }
        match self.reader.read_event() {
            Err(LogError::EndOfFile) => None,
            other => Some(other),
        }
    }
}

/// Fill as much of `buf` as the stream allows. Returns the number of bytes
/// read, which is short only at end of stream.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_exact_or_format_error<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<(), LogError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            LogError::FileFormat(format!("file too short to hold the {}", what))
        }
        _ => LogError::from(e),
    })
}

// The decoder reports corrupt or truncated compressed data through these
// kinds; everything else comes from the underlying source.
fn stream_error(e: io::Error) -> LogError {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            LogError::FileFormat(format!("corrupt event stream: {}", e))
        }
        _ => LogError::from(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{PerfCounterMap, PmcSample, ProcessHeader};

    fn header(participants: u32) -> LogHeader {
        let mut header = LogHeader::new();
        for i in 0..participants {
            header
                .push_process(ProcessHeader {
                    core: i as i32,
                    node: -1,
                    pmc_map: PerfCounterMap::from_events(&[0x41_003c], 0, 0),
                })
                .unwrap();
        }
        header
    }

    fn event(participants: u32, base: u64) -> EventRecord {
        EventRecord::from_samples((0..participants as u64).map(|i| {
            let mut sample = PmcSample::from_tsc(base * 1000 + i);
            sample.pmc[0] = base + i;
            sample
        }))
    }

    fn write_log(header: &LogHeader, events: &[EventRecord]) -> Vec<u8> {
        let mut writer = LogWriter::new(header, Vec::new()).unwrap();
        for e in events {
            writer.write_event(e).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn round_trip() {
        let header = header(4);
        let events: Vec<_> = (0..25).map(|i| event(4, i)).collect();
        let bytes = write_log(&header, &events);

        assert_eq!(&bytes[..8], LOG_MAGIC);

        let mut reader = LogReader::new(&bytes[..]).unwrap();
        assert_eq!(reader.header(), &header);
        let read: Vec<_> = reader.events().collect::<Result<_, _>>().unwrap();
        assert_eq!(read, events);
    }

    #[test]
    fn empty_stream() {
        let bytes = write_log(&header(2), &[]);
        let mut reader = LogReader::new(&bytes[..]).unwrap();
        assert!(reader.read_event().unwrap_err().is_eof());
    }

    #[test]
    fn end_of_file_is_reported_once() {
        let header = header(1);
        let bytes = write_log(&header, &[event(1, 1), event(1, 2)]);

        let mut reader = LogReader::new(&bytes[..]).unwrap();
        reader.read_event().unwrap();
        reader.read_event().unwrap();
        assert!(matches!(reader.read_event(), Err(LogError::EndOfFile)));
        assert!(matches!(reader.read_event(), Err(LogError::FileFormat(_))));
        assert!(matches!(reader.read_event(), Err(LogError::FileFormat(_))));
    }

    #[test]
    fn bad_magic() {
        let mut bytes = write_log(&header(1), &[event(1, 1)]);
        bytes[0] = b'X';
        assert!(matches!(
            LogReader::new(&bytes[..]),
            Err(LogError::FileFormat(_))
        ));
    }

    #[test]
    fn bad_version() {
        let mut bytes = write_log(&header(1), &[event(1, 1)]);
        let version = (LOG_VERSION_CURRENT + 1).to_le_bytes();
        bytes[8..10].copy_from_slice(&version);
        assert!(matches!(
            LogReader::new(&bytes[..]),
            Err(LogError::FileFormat(_))
        ));
    }

    #[test]
    fn truncated_header() {
        let bytes = write_log(&header(1), &[]);
        for len in [0, 4, 8, 100, 8 + LOG_HEADER_SIZE - 1] {
            assert!(matches!(
                LogReader::new(&bytes[..len]),
                Err(LogError::FileFormat(_))
            ));
        }
    }

    #[test]
    fn truncated_stream() {
        let bytes = write_log(&header(3), &(0..10).map(|i| event(3, i)).collect::<Vec<_>>());
        let cut = &bytes[..bytes.len() - 10];
        let mut reader = LogReader::new(cut).unwrap();
        let err = loop {
            match reader.read_event() {
                Ok(_) => {}
                Err(e) => break e,
            }
        };
        assert!(matches!(err, LogError::FileFormat(_)), "{:?}", err);
    }

    #[test]
    fn writer_forces_current_version() {
        let mut old = header(1);
        old.version = 1;
        let bytes = write_log(&old, &[]);
        let reader = LogReader::new(&bytes[..]).unwrap();
        assert_eq!(reader.header().version, LOG_VERSION_CURRENT);
    }

    #[test]
    fn mismatched_participants_rejected() {
        let mut writer = LogWriter::new(&header(2), Vec::new()).unwrap();
        assert!(matches!(
            writer.write_event(&event(3, 0)),
            Err(LogError::Parameter(_))
        ));
    }

    #[test]
    fn oversized_header_rejected() {
        let mut header = header(0);
        header.num_processes = LOG_MAX_PROCS as u32 + 1;
        assert!(matches!(
            LogWriter::new(&header, Vec::new()),
            Err(LogError::Parameter(_))
        ));
    }
}
