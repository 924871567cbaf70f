// Every export takes raw pointers from C callers; contracts are documented once
// in the module and in include/memory_manager.h.
#![allow(clippy::missing_safety_doc)]
//! # memmgr-abi
//!
//! `extern "C"` boundary for the memmgr engine. One process-wide
//! [`MemoryManager`](memmgr_core::MemoryManager) sits behind a
//! `parking_lot::Mutex`; the exported functions lock it, forward, and unlock.
//!
//! ```text
//! C caller -> memory_manager_* (this crate) -> MemoryManager -> page source
//! ```

mod manager_abi;

pub use manager_abi::*;
