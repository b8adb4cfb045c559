// The process-wide profiler can only be installed once, so this file holds a
// single test.

use lockprof::testing_common::mk_log_path;
use lockprof::{Config, LogReader, Output, Primitive, Profiler};

#[test]
fn install_once_and_shut_down() {
    assert!(lockprof::global().is_none());
    assert!(lockprof::shutdown().unwrap().is_none());

    let path = mk_log_path("install_once_and_shut_down");
    let config = Config::default().with_output(Output::File(path.clone()));
    let profiler = lockprof::init(Profiler::new(config)).unwrap();
    assert!(lockprof::init(Profiler::new(Config::default())).is_err());

    let id = profiler.register_thread().unwrap();
    std::thread::spawn(move || {
        let profiler = lockprof::global().unwrap();
        profiler.run_thread(id, || profiler.measure(Primitive::ReadLock, || ()))
    })
    .join()
    .unwrap();

    let report = lockprof::shutdown().unwrap().unwrap();
    assert_eq!(report.threads.len(), 1);
    assert!(lockprof::shutdown().unwrap().is_none());

    let reader = LogReader::open(Some(&path)).unwrap();
    assert_eq!(reader.header().num_processes, 1);
}
