//! Allocation events and lifecycle logging.
//!
//! The engine reports every `init`, `allocate`, `free` and `shutdown` to an
//! optional [`AllocObserver`]. Two observers ship with the crate:
//! - [`LifecycleLog`] keeps structured records in memory (shared across the
//!   hook boundary as a [`SharedLog`]);
//! - [`JsonlSink`] writes one JSON record per line to any writer.

use std::io::Write;
use std::panic::Location;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

/// Source location attached to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallSite<'a> {
    pub file: &'a str,
    pub line: u32,
}

impl CallSite<'static> {
    /// Location of the caller, propagated through `#[track_caller]` frames.
    #[track_caller]
    #[must_use]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
        }
    }
}

/// Engine entry point that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Init,
    Allocate,
    Free,
    Shutdown,
}

impl Op {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Allocate => "allocate",
            Self::Free => "free",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Path a request took through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// `allocate(0)`.
    ZeroSize,
    /// `free(null)`.
    Null,
    SmallFreeList,
    SmallBump,
    SmallFreshPage,
    BucketFreeList,
    BucketFreshPage,
    Oversize,
    /// `free` of a pointer whose tag names no tier.
    UnknownTag,
    /// Call made in the wrong engine state.
    LifecycleViolation,
    /// `init` or `shutdown` completed.
    Lifecycle,
}

impl Route {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ZeroSize => "zero_size",
            Self::Null => "null",
            Self::SmallFreeList => "small_free_list",
            Self::SmallBump => "small_bump",
            Self::SmallFreshPage => "small_fresh_page",
            Self::BucketFreeList => "bucket_free_list",
            Self::BucketFreshPage => "bucket_fresh_page",
            Self::Oversize => "oversize",
            Self::UnknownTag => "unknown_tag",
            Self::LifecycleViolation => "lifecycle_violation",
            Self::Lifecycle => "lifecycle",
        }
    }

    /// Severity a record for this route is logged at.
    #[must_use]
    pub const fn level(self) -> AllocatorLogLevel {
        match self {
            Self::UnknownTag | Self::LifecycleViolation => AllocatorLogLevel::Warn,
            Self::Lifecycle => AllocatorLogLevel::Info,
            Self::ZeroSize | Self::Null | Self::SmallFreshPage | Self::BucketFreshPage => {
                AllocatorLogLevel::Debug
            }
            Self::SmallFreeList | Self::SmallBump | Self::BucketFreeList | Self::Oversize => {
                AllocatorLogLevel::Trace
            }
        }
    }
}

/// One engine event, borrowed for the duration of the observer call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocEvent<'a> {
    pub op: Op,
    pub route: Route,
    /// Requested size (`allocate`) or recovered capacity (`free`).
    pub size: Option<usize>,
    /// Payload address involved.
    pub ptr: Option<usize>,
    /// Size class, or free-list index for small blocks.
    pub class: Option<usize>,
    pub site: Option<CallSite<'a>>,
}

/// Hook invoked for every engine event.
pub trait AllocObserver: Send {
    fn on_event(&mut self, event: &AllocEvent<'_>);
}

/// Allocator lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured allocator lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatorLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id for this lifecycle record.
    pub trace_id: String,
    pub level: AllocatorLogLevel,
    /// Entry point (`init`, `allocate`, `free`, `shutdown`).
    pub symbol: &'static str,
    /// Route label, see [`Route::as_str`].
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptr: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl AllocatorLogRecord {
    /// Builds the record for `event` under `decision_id`.
    #[must_use]
    pub fn from_event(decision_id: u64, event: &AllocEvent<'_>) -> Self {
        let symbol = event.op.as_str();
        Self {
            decision_id,
            trace_id: format!("memmgr::{symbol}::{decision_id:016x}"),
            level: event.route.level(),
            symbol,
            event: event.route.as_str(),
            ptr: event.ptr,
            size: event.size,
            class: event.class,
            file: event.site.map(|site| site.file.to_string()),
            line: event.site.map(|site| site.line),
        }
    }
}

/// In-memory lifecycle log.
#[derive(Debug, Clone, Default)]
pub struct LifecycleLog {
    next_decision_id: u64,
    records: Vec<AllocatorLogRecord>,
}

impl LifecycleLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a fresh log for installation as an observer while the caller
    /// keeps a handle to read it.
    #[must_use]
    pub fn shared() -> SharedLog {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn record(&mut self, event: &AllocEvent<'_>) {
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        self.records
            .push(AllocatorLogRecord::from_event(self.next_decision_id, event));
    }

    #[must_use]
    pub fn records(&self) -> &[AllocatorLogRecord] {
        &self.records
    }

    pub fn drain(&mut self) -> Vec<AllocatorLogRecord> {
        std::mem::take(&mut self.records)
    }

    /// Records rendered as JSON Lines.
    #[must_use]
    pub fn to_jsonl(&self) -> String {
        let mut out = String::new();
        for record in &self.records {
            if let Ok(line) = serde_json::to_string(record) {
                out.push_str(&line);
                out.push('\n');
            }
        }
        out
    }
}

impl AllocObserver for LifecycleLog {
    fn on_event(&mut self, event: &AllocEvent<'_>) {
        self.record(event);
    }
}

/// A [`LifecycleLog`] readable from outside the engine.
pub type SharedLog = Arc<Mutex<LifecycleLog>>;

impl AllocObserver for SharedLog {
    fn on_event(&mut self, event: &AllocEvent<'_>) {
        self.lock().record(event);
    }
}

/// Writes each event as one JSON line.
///
/// Write failures are dropped; logging never fails an allocation.
#[derive(Debug)]
pub struct JsonlSink<W: Write + Send> {
    writer: W,
    next_decision_id: u64,
}

impl<W: Write + Send> JsonlSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            next_decision_id: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> AllocObserver for JsonlSink<W> {
    fn on_event(&mut self, event: &AllocEvent<'_>) {
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        let record = AllocatorLogRecord::from_event(self.next_decision_id, event);
        if serde_json::to_writer(&mut self.writer, &record).is_ok() {
            let _ = self.writer.write_all(b"\n");
        }
    }
}
