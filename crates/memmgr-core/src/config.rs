//! Engine configuration.
//!
//! Settings come from environment variables, read once when the engine is
//! initialized:
//! - `MEMMGR_SLAB_PAGE_BYTES`: payload bytes of each small-object slab page
//!   (default 64 KiB).
//! - `MEMMGR_PREWARM`: how many pages each bucket receives at init:
//!   `scaled` (default), `minimal` or `off`.
//! - `MEMMGR_TRACE`: `off` (default) or `stderr`. With `stderr` the C ABI
//!   layer logs every allocate/free as one JSON line.
//!
//! Unrecognized values fall back to the defaults.

use serde::Serialize;

use crate::malloc::page::{SLAB_HEADER_SIZE, TAG_SIZE};
use crate::malloc::small::SMALL_MAX;

/// Environment variable selecting the slab page payload size.
pub const ENV_SLAB_PAGE_BYTES: &str = "MEMMGR_SLAB_PAGE_BYTES";
/// Environment variable selecting the bucket pre-warm policy.
pub const ENV_PREWARM: &str = "MEMMGR_PREWARM";
/// Environment variable selecting the trace sink.
pub const ENV_TRACE: &str = "MEMMGR_TRACE";

/// Default slab page payload.
pub const DEFAULT_SLAB_PAGE_BYTES: usize = 64 * 1024;

/// Smallest slab payload that still fits one maximal small block.
pub const MIN_SLAB_PAGE_BYTES: usize = TAG_SIZE + SMALL_MAX;

/// Upper bound on the slab payload. Keeps a misconfigured environment from
/// turning every refill into a huge request.
pub const MAX_SLAB_PAGE_BYTES: usize = 16 * 1024 * 1024 - SLAB_HEADER_SIZE;

/// Extra pre-warmed pages are added once every this many classes.
pub const PREWARM_CLASS_STEP: usize = 14;

/// How buckets are populated at init.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrewarmPolicy {
    /// `1 + index / 14` pages per bucket, so larger classes start with more.
    #[default]
    Scaled,
    /// One page per bucket.
    Minimal,
    /// Buckets start empty; every page is acquired on first use.
    Off,
}

impl PrewarmPolicy {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "scaled" | "default" | "on" => Self::Scaled,
            "minimal" | "one" | "1" => Self::Minimal,
            "off" | "none" | "0" | "disabled" => Self::Off,
            _ => Self::Scaled,
        }
    }

    /// Pages pre-warmed for the bucket at `class`.
    #[must_use]
    pub const fn pages_for(self, class: usize) -> usize {
        match self {
            Self::Scaled => 1 + class / PREWARM_CLASS_STEP,
            Self::Minimal => 1,
            Self::Off => 0,
        }
    }
}

/// Where allocation events are logged.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceMode {
    #[default]
    Off,
    /// One JSON record per event on stderr.
    Stderr,
}

impl TraceMode {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "stderr" | "jsonl" | "on" | "1" | "debug" => Self::Stderr,
            _ => Self::Off,
        }
    }

    #[must_use]
    pub const fn enabled(self) -> bool {
        matches!(self, Self::Stderr)
    }
}

/// Tunables for a [`MemoryManager`](crate::MemoryManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ManagerConfig {
    /// Payload bytes of each slab page.
    pub slab_page_bytes: usize,
    pub prewarm: PrewarmPolicy,
    pub trace: TraceMode,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            slab_page_bytes: DEFAULT_SLAB_PAGE_BYTES,
            prewarm: PrewarmPolicy::default(),
            trace: TraceMode::default(),
        }
    }
}

impl ManagerConfig {
    /// Read the configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let slab_page_bytes = lookup(ENV_SLAB_PAGE_BYTES)
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .unwrap_or(defaults.slab_page_bytes);
        Self {
            slab_page_bytes,
            prewarm: lookup(ENV_PREWARM)
                .map(|raw| PrewarmPolicy::from_str_loose(&raw))
                .unwrap_or(defaults.prewarm),
            trace: lookup(ENV_TRACE)
                .map(|raw| TraceMode::from_str_loose(&raw))
                .unwrap_or(defaults.trace),
        }
        .normalized()
    }

    /// Clamp values into the ranges the engine supports.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.slab_page_bytes = self
            .slab_page_bytes
            .clamp(MIN_SLAB_PAGE_BYTES, MAX_SLAB_PAGE_BYTES)
            .next_multiple_of(crate::malloc::page::ALIGNMENT);
        self
    }
}
