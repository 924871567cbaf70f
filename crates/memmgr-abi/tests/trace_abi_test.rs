use memmgr_abi::{
    memory_manager_allocate_debug, memory_manager_free_debug, memory_manager_init,
    memory_manager_shutdown,
};
use std::ffi::CString;
use std::process::Command;

const CHILD_ENV: &str = "MEMMGR_TRACE_CHILD";

/// Runs in a child process with `MEMMGR_TRACE=stderr`.
#[test]
fn traced_lifecycle_child() {
    if std::env::var_os(CHILD_ENV).is_none() {
        return;
    }
    let file = CString::new("trace_demo.c").unwrap();
    memory_manager_init();
    unsafe {
        let p = memory_manager_allocate_debug(32, file.as_ptr(), 7);
        assert!(!p.is_null());
        memory_manager_free_debug(p, file.as_ptr(), 9);
    }
    memory_manager_shutdown();
}

#[test]
fn stderr_trace_emits_one_json_record_per_event() {
    let exe = std::env::current_exe().expect("test binary path");
    let output = Command::new(exe)
        .args(["traced_lifecycle_child", "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .env("MEMMGR_TRACE", "stderr")
        .output()
        .expect("spawn child");
    assert!(output.status.success(), "child failed: {output:?}");

    let stderr = String::from_utf8_lossy(&output.stderr);
    let records: Vec<serde_json::Value> = stderr
        .lines()
        .filter(|line| line.starts_with('{'))
        .map(|line| serde_json::from_str(line).expect("trace line is JSON"))
        .collect();
    let symbols: Vec<&str> = records
        .iter()
        .filter_map(|r| r["symbol"].as_str())
        .collect();
    assert_eq!(symbols, ["init", "allocate", "free", "shutdown"], "stderr was: {stderr}");

    let allocate = &records[1];
    assert_eq!(allocate["event"], "small_bump");
    assert_eq!(allocate["size"], 32);
    assert_eq!(allocate["file"], "trace_demo.c");
    assert_eq!(allocate["line"], 7);
    assert_eq!(records[2]["line"], 9);
    assert_eq!(
        records[0]["trace_id"],
        "memmgr::init::0000000000000001",
        "decision ids start at one"
    );
}

#[test]
fn trace_is_silent_by_default() {
    let exe = std::env::current_exe().expect("test binary path");
    let output = Command::new(exe)
        .args(["traced_lifecycle_child", "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .env_remove("MEMMGR_TRACE")
        .output()
        .expect("spawn child");
    assert!(output.status.success(), "child failed: {output:?}");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        !stderr.lines().any(|line| line.starts_with('{')),
        "stderr was: {stderr}"
    );
}
