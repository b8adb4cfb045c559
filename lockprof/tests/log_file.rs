use lockprof::testing_common::mk_log_path;
use lockprof::{
    EventRecord, LogError, LogHeader, LogReader, LogWriter, PerfCounterMap, PmcSample,
    ProcessHeader,
};
use std::fs;

fn header(participants: usize) -> LogHeader {
    let mut header = LogHeader::new();
    for i in 0..participants {
        header
            .push_process(ProcessHeader {
                core: i as i32,
                node: 0,
                pmc_map: PerfCounterMap::from_events(&[0x412e, 0x01b7 + i as u32], 0x10, 0x1000),
            })
            .unwrap();
    }
    header
}

fn record(participants: usize, seed: u64) -> EventRecord {
    EventRecord::from_samples((0..participants as u64).map(|i| {
        let mut sample = PmcSample::from_tsc(seed * 1_000 + i);
        for (j, pmc) in sample.pmc.iter_mut().enumerate() {
            *pmc = seed ^ (i << 8) ^ j as u64;
        }
        sample
    }))
}

#[test]
fn file_round_trip() {
    let path = mk_log_path("file_round_trip");
    let header = header(3);
    let records: Vec<_> = (0..50).map(|seed| record(3, seed)).collect();

    let mut writer = LogWriter::create(&header, Some(&path)).unwrap();
    for r in &records {
        writer.write_event(r).unwrap();
    }
    writer.close().unwrap();

    let mut reader = LogReader::open(Some(&path)).unwrap();
    assert_eq!(reader.header(), &header);
    for expected in &records {
        assert_eq!(&reader.read_event().unwrap(), expected);
    }
    assert!(matches!(reader.read_event(), Err(LogError::EndOfFile)));
    assert!(matches!(reader.read_event(), Err(LogError::FileFormat(_))));
    reader.close().unwrap();
}

#[test]
fn corrupted_magic_on_disk() {
    let path = mk_log_path("corrupted_magic_on_disk");
    LogWriter::create(&header(1), Some(&path))
        .unwrap()
        .close()
        .unwrap();

    let mut bytes = fs::read(&path).unwrap();
    bytes[0] = b'X';
    fs::write(&path, bytes).unwrap();

    match LogReader::open(Some(&path)) {
        Err(LogError::FileFormat(_)) => {}
        other => panic!("expected a format error, got {:?}", other.err()),
    }
}

#[test]
fn missing_file_is_a_system_error() {
    let path = mk_log_path("missing_file_is_a_system_error");
    let _ = fs::remove_file(&path);
    match LogReader::open(Some(&path)) {
        Err(e @ LogError::System(_)) => assert_eq!(e.name(), "System"),
        other => panic!("expected a system error, got {:?}", other.err()),
    }
}

#[test]
fn record_arithmetic_recovers_operands() {
    let a = record(4, 7);
    let b = record(4, 1_000_003);
    assert_eq!(a + (b - a), b);
    assert_eq!(b - (b - a), a);
}
