use lockprof::{LogReader, RECORD_LIFETIME, RECORD_MUTEX, RECORD_RWLOCK, RECORD_TRACE};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::OnceLock;

const DEMO: &str = env!("CARGO_BIN_EXE_contention-demo");

/// Build the preload library once per test run. `cargo test` does not build
/// it, since nothing links against a `cdylib`. It goes to its own target
/// directory so this does not contend with the outer build.
fn preload_library() -> &'static Path {
    static LIB: OnceLock<PathBuf> = OnceLock::new();
    LIB.get_or_init(|| {
        let target = Path::new(DEMO)
            .parent()
            .and_then(Path::parent)
            .expect("demo binary outside a target directory")
            .join("preload-tests");
        let manifest = Path::new(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");

        let status = Command::new(option_env!("CARGO").unwrap_or("cargo"))
            .args(["build", "--lib", "--manifest-path"])
            .arg(&manifest)
            .arg("--target-dir")
            .arg(&target)
            .status()
            .expect("failed to run cargo");
        assert!(status.success(), "building the preload library failed");

        let lib = target.join("debug").join("liblockprof_preload.so");
        assert!(lib.exists(), "{} was not built", lib.display());
        lib
    })
}

fn log_path(name: &str) -> PathBuf {
    let dir = Path::new("test-tmp").join("preload");
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name).with_extension("log");
    let _ = fs::remove_file(&path);
    path
}

fn run_demo(lib: &Path, log: &Path, args: &[&str]) -> Output {
    Command::new(DEMO)
        .args(args)
        .env("LD_PRELOAD", lib)
        .env("LOCKPROF_FILE", log)
        .env("LOCKPROF_LOG", "off")
        .output()
        .unwrap()
}

#[test]
fn profiles_unmodified_program() {
    let lib = preload_library();
    let log = log_path("profiles_unmodified_program");

    let output = run_demo(lib, &log, &[]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "demo failed: {}", stderr);
    assert!(stderr.contains("wasted synchronization cycles"));

    let mut reader = LogReader::open(Some(&log)).unwrap();
    assert_eq!(reader.header().num_processes, 4);

    let records: Vec<_> = reader.events().collect::<Result<_, _>>().unwrap();
    assert_eq!(records.len(), RECORD_TRACE);
    let mutex: u64 = records[RECORD_MUTEX].samples().iter().map(|s| s.tsc).sum();
    assert!(mutex > 0);
    assert!(records[RECORD_RWLOCK].samples().iter().all(|s| s.tsc > 0));
    assert!(records[RECORD_LIFETIME].samples().iter().all(|s| s.tsc > 0));
}

#[test]
fn condition_variables_fail_fast() {
    let lib = preload_library();
    let log = log_path("condition_variables_fail_fast");

    let output = run_demo(lib, &log, &["condvar"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("condition variables"));
    assert!(String::from_utf8_lossy(&output.stdout).is_empty());
}

#[test]
fn waiting_on_a_static_condition_variable_fails_fast() {
    let lib = preload_library();
    let log = log_path("waiting_on_a_static_condition_variable_fails_fast");

    let output = run_demo(lib, &log, &["condwait"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("condition variables"));
    assert!(String::from_utf8_lossy(&output.stdout).is_empty());
}

#[test]
fn demo_runs_without_profiler() {
    let output = Command::new(DEMO).output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("done: "));
}

#[test]
fn static_condition_variable_works_without_profiler() {
    let output = Command::new(DEMO).arg("condwait").output().unwrap();
    assert!(output.status.success());
    let expected = format!("pthread_cond_timedwait returned {}", libc::ETIMEDOUT);
    assert!(String::from_utf8_lossy(&output.stdout).contains(&expected));
}
