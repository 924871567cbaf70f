//! Shared workloads for the memmgr benchmarks and the comparison driver.
//!
//! The sequential workload allocates and immediately frees `items` blocks,
//! growing the request by one byte per step from `start_size`.

use std::ffi::c_void;
use std::time::{Duration, Instant};

use memmgr_abi::{
    memory_manager_allocate, memory_manager_free, memory_manager_init, memory_manager_shutdown,
};
use serde::Serialize;

pub const DEFAULT_ITEMS: usize = 1000;
pub const DEFAULT_START_SIZE: usize = 64;

/// Allocator driven by a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// The memmgr engine through its C ABI.
    Engine,
    /// The host `malloc`/`free`.
    System,
}

/// Outcome of one workload run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub engine: Engine,
    pub items: usize,
    pub start_size: usize,
    pub elapsed_ns: u64,
    /// Allocations that came back null.
    pub failures: usize,
}

/// Allocate-then-free `items` blocks of growing size with `alloc`/`release`.
pub fn sequential<A, F>(items: usize, start_size: usize, mut alloc: A, mut release: F) -> usize
where
    A: FnMut(usize) -> *mut c_void,
    F: FnMut(*mut c_void),
{
    let mut failures = 0;
    for size in (start_size..).take(items) {
        let block = alloc(size);
        if block.is_null() {
            failures += 1;
            continue;
        }
        // Touch the block so the allocation cannot be elided.
        // SAFETY: `block` holds at least `size >= 1` bytes.
        unsafe { block.cast::<u8>().write(size as u8) };
        release(block);
    }
    failures
}

fn elapsed_ns(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

/// Runs the sequential workload once, engine lifecycle included.
#[must_use]
pub fn run(engine: Engine, items: usize, start_size: usize) -> RunReport {
    let (failures, elapsed) = match engine {
        Engine::Engine => {
            memory_manager_init();
            let begin = Instant::now();
            let failures = sequential(
                items,
                start_size,
                |size| memory_manager_allocate(size),
                // SAFETY: `p` came from `memory_manager_allocate` and is freed once.
                |p| unsafe { memory_manager_free(p) },
            );
            let elapsed = begin.elapsed();
            memory_manager_shutdown();
            (failures, elapsed)
        }
        Engine::System => {
            let begin = Instant::now();
            let failures = sequential(
                items,
                start_size,
                // SAFETY: plain libc allocation.
                |size| unsafe { libc::malloc(size) },
                // SAFETY: `p` came from `libc::malloc` and is freed once.
                |p| unsafe { libc::free(p) },
            );
            (failures, begin.elapsed())
        }
    };
    RunReport {
        engine,
        items,
        start_size,
        elapsed_ns: elapsed_ns(elapsed),
        failures,
    }
}
