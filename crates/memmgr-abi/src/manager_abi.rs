//! ABI layer for the memory manager (`memory_manager_init`, `_allocate`,
//! `_free`, `_shutdown` and the debug entry points).
//!
//! The engine is single-threaded; the mutex only makes the process-wide
//! handle a sound `static`. Calls made before the first `init` find no engine
//! and are counted as lifecycle violations here; later misuse is counted by
//! the engine itself.

use std::ffi::{CStr, c_char, c_int, c_void};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use libc::size_t;
use memmgr_core::{CallSite, JsonlSink, ManagerConfig, ManagerStats, MemoryManager};
use parking_lot::{Mutex, const_mutex};
use serde_json::json;

static MANAGER: Mutex<Option<MemoryManager>> = const_mutex(None);

/// Calls that arrived before any engine existed.
static UNINITIALIZED_CALLS: AtomicU64 = AtomicU64::new(0);

const UNKNOWN_FILE: &str = "<unknown>";

/// # Safety
///
/// `file` is null or a NUL-terminated string that outlives the returned site.
unsafe fn call_site<'a>(file: *const c_char, line: c_int) -> CallSite<'a> {
    let file = if file.is_null() {
        UNKNOWN_FILE
    } else {
        // SAFETY: see function contract.
        unsafe { CStr::from_ptr(file) }
            .to_str()
            .unwrap_or(UNKNOWN_FILE)
    };
    CallSite {
        file,
        line: u32::try_from(line).unwrap_or(0),
    }
}

fn allocate_with(size: size_t, site: Option<CallSite<'_>>) -> *mut c_void {
    let mut slot = MANAGER.lock();
    let Some(manager) = slot.as_mut() else {
        UNINITIALIZED_CALLS.fetch_add(1, Ordering::Relaxed);
        return std::ptr::null_mut();
    };
    manager
        .allocate_at(size, site)
        .map_or(std::ptr::null_mut(), |payload| payload.as_ptr().cast())
}

/// # Safety
///
/// `ptr` is null or a live payload from this engine.
unsafe fn free_with(ptr: *mut c_void, site: Option<CallSite<'_>>) {
    let mut slot = MANAGER.lock();
    let Some(manager) = slot.as_mut() else {
        UNINITIALIZED_CALLS.fetch_add(1, Ordering::Relaxed);
        return;
    };
    // SAFETY: forwarded caller contract.
    unsafe { manager.free_at(NonNull::new(ptr.cast()), site) };
}

/// Creates the engine on first use (configuration read from the environment)
/// and moves it to `Ready`.
#[unsafe(no_mangle)]
pub extern "C" fn memory_manager_init() {
    let mut slot = MANAGER.lock();
    let manager = slot.get_or_insert_with(|| {
        let config = ManagerConfig::from_env();
        let mut manager = MemoryManager::new(config);
        if config.trace.enabled() {
            manager.set_observer(JsonlSink::new(std::io::stderr()));
        }
        manager
    });
    manager.init();
}

/// Releases every page held by the engine.
#[unsafe(no_mangle)]
pub extern "C" fn memory_manager_shutdown() {
    let mut slot = MANAGER.lock();
    match slot.as_mut() {
        Some(manager) => manager.shutdown(),
        None => {
            UNINITIALIZED_CALLS.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn memory_manager_allocate(size: size_t) -> *mut c_void {
    allocate_with(size, None)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memory_manager_free(ptr: *mut c_void) {
    // SAFETY: forwarded caller contract.
    unsafe { free_with(ptr, None) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memory_manager_allocate_debug(
    size: size_t,
    file: *const c_char,
    line: c_int,
) -> *mut c_void {
    // SAFETY: `file` follows the C contract for the duration of the call.
    let site = unsafe { call_site(file, line) };
    allocate_with(size, Some(site))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memory_manager_free_debug(
    ptr: *mut c_void,
    file: *const c_char,
    line: c_int,
) {
    // SAFETY: forwarded caller contract.
    unsafe { free_with(ptr, Some(call_site(file, line))) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memory_manager_usable_size(ptr: *const c_void) -> size_t {
    let slot = MANAGER.lock();
    let Some(manager) = slot.as_ref() else {
        return 0;
    };
    // SAFETY: forwarded caller contract.
    unsafe { manager.usable_size(NonNull::new(ptr.cast_mut().cast())) }
}

/// JSON snapshot of `ptr` (null allowed) and the engine counters.
///
/// # Safety
///
/// `ptr` is null or a live payload from this engine.
#[must_use]
pub unsafe fn dump_json(ptr: *const c_void) -> serde_json::Value {
    let slot = MANAGER.lock();
    let Some(manager) = slot.as_ref() else {
        return json!({
            "ptr": ptr as usize,
            "block": null,
            "stats": null,
            "uninitialized_calls": UNINITIALIZED_CALLS.load(Ordering::Relaxed),
        });
    };
    // SAFETY: forwarded caller contract.
    let block = unsafe { manager.block_info(NonNull::new(ptr.cast_mut().cast())) };
    json!({
        "ptr": ptr as usize,
        "block": block,
        "stats": manager.stats(),
        "uninitialized_calls": UNINITIALIZED_CALLS.load(Ordering::Relaxed),
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memory_manager_dump(ptr: *const c_void) {
    // SAFETY: forwarded caller contract.
    let snapshot = unsafe { dump_json(ptr) };
    eprintln!("{snapshot}");
}

/// Lifecycle violations seen so far, before and after the engine existed.
#[unsafe(no_mangle)]
pub extern "C" fn memory_manager_lifecycle_violations() -> u64 {
    let engine = MANAGER
        .lock()
        .as_ref()
        .map_or(0, MemoryManager::lifecycle_violations);
    engine + UNINITIALIZED_CALLS.load(Ordering::Relaxed)
}

/// Engine counters, `None` before the first `init`.
#[must_use]
pub fn manager_stats() -> Option<ManagerStats> {
    MANAGER.lock().as_ref().map(MemoryManager::stats)
}
