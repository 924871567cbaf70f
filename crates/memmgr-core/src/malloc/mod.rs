//! Memory allocation.
//!
//! Three-tier allocator design:
//! - Small allocations (<=256B): bump allocation in slab pages, per-size free lists
//! - Bucket allocations (<=327684B): one page per block, per-class free lists
//! - Oversize allocations: forwarded to the system allocator

pub mod allocator;
pub mod bucket;
pub mod large;
pub mod observe;
pub mod page;
pub mod size_class;
pub mod small;

pub use allocator::{BlockInfo, EngineState, ManagerStats, MemoryManager};
pub use observe::{
    AllocEvent, AllocObserver, AllocatorLogLevel, AllocatorLogRecord, CallSite, JsonlSink,
    LifecycleLog, Op, Route, SharedLog,
};
pub use page::{CappedPages, PageSource, ProviderStats, SystemPages, Tier};
