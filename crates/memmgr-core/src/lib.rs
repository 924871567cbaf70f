//! # memmgr-core
//!
//! A size-class memory manager that sits in front of the system allocator.
//!
//! Requests are split into three tiers by size:
//! - 1..=256 bytes: bump allocation inside slab pages, recycled through
//!   per-size free lists ([`malloc::small`]).
//! - 257..=327684 bytes: one page per block, recycled through per-class
//!   bucket free lists ([`malloc::bucket`]).
//! - anything larger: forwarded to the system allocator ([`malloc::large`]).
//!
//! The engine is single-threaded. [`MemoryManager`] owns every page it hands
//! out and gives them all back on [`MemoryManager::shutdown`].

pub mod config;
pub mod error;
pub mod malloc;

pub use config::{ManagerConfig, PrewarmPolicy, TraceMode};
pub use error::{ExhaustionHandler, PageError, abort_on_exhaustion};
pub use malloc::{
    AllocEvent, AllocObserver, AllocatorLogLevel, AllocatorLogRecord, BlockInfo, CallSite,
    CappedPages, EngineState, JsonlSink, LifecycleLog, ManagerStats, MemoryManager, Op,
    PageSource, Route, SharedLog, SystemPages, Tier,
};
