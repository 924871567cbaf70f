//! Allocator front-end.
//!
//! [`MemoryManager`] owns the page provider and the three tiers, tracks the
//! `Uninitialized -> Ready -> ShutDown` lifecycle, and routes each request by
//! size:
//! - `0` returns null;
//! - `1..=256` goes to the small-object tier;
//! - `257..=327684` goes to the bucket tier;
//! - anything larger goes to the oversize tier.
//!
//! `free` needs no size: the tag in front of every payload names the tier and
//! class that produced it.

use std::ptr::NonNull;

use serde::Serialize;

use super::bucket::{BucketAllocator, BucketPath, BucketView};
use super::large::{LargeAllocator, LargeStats};
use super::observe::{AllocEvent, AllocObserver, CallSite, Op, Route};
use super::page::{
    ALIGNMENT, BlockTag, PageProvider, PageSource, ProviderStats, SystemPages, Tier,
};
use super::size_class;
use super::small::{self, NUM_FREE_LISTS, SmallAllocator, SmallPath, SmallStats};
use crate::config::ManagerConfig;
use crate::error::{ExhaustionHandler, PageError, abort_on_exhaustion};

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    Ready,
    ShutDown,
}

/// What the engine knows about a live block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    pub tier: Tier,
    /// Size class (bucket), free-list index (small) or 0 (oversize).
    pub class: usize,
    /// Bytes the caller may use.
    pub usable: usize,
}

/// Engine-wide counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub state: EngineState,
    pub pages: ProviderStats,
    pub small: SmallStats,
    pub bucket_pages: usize,
    pub bucket_free_pages: usize,
    pub large: LargeStats,
    pub allocations: u64,
    pub frees: u64,
    pub lifecycle_violations: u64,
    pub unknown_tags: u64,
}

struct Tiers {
    small: SmallAllocator,
    buckets: BucketAllocator,
    large: LargeAllocator,
}

impl Tiers {
    fn build<S: PageSource>(
        provider: &mut PageProvider<S>,
        config: &ManagerConfig,
    ) -> Result<Self, PageError> {
        let small = SmallAllocator::new(provider, config.slab_page_bytes)?;
        let mut buckets = BucketAllocator::new();
        buckets.prewarm(provider, config.prewarm)?;
        Ok(Self {
            small,
            buckets,
            large: LargeAllocator::new(),
        })
    }

    fn allocate<S: PageSource>(
        &mut self,
        provider: &mut PageProvider<S>,
        size: usize,
    ) -> Result<(NonNull<u8>, Route, Option<usize>), PageError> {
        if let Some((payload, path)) = self.small.allocate(provider, size)? {
            let route = match path {
                SmallPath::FreeList => Route::SmallFreeList,
                SmallPath::Bump => Route::SmallBump,
                SmallPath::FreshPage => Route::SmallFreshPage,
            };
            return Ok((payload, route, Some(small::free_list_index(size))));
        }
        if let Some(grant) = self.buckets.allocate(provider, size)? {
            let route = match grant.path {
                BucketPath::FreeList => Route::BucketFreeList,
                BucketPath::FreshPage => Route::BucketFreshPage,
            };
            return Ok((grant.payload, route, Some(grant.class)));
        }
        let payload = self.large.alloc(provider, size)?;
        Ok((payload, Route::Oversize, None))
    }

    /// # Safety
    ///
    /// No block from any tier may be used afterwards.
    unsafe fn release_all<S: PageSource>(&mut self, provider: &mut PageProvider<S>) {
        // SAFETY: forwarded caller contract.
        unsafe {
            self.small.release_all(provider);
            self.buckets.release_all(provider);
            self.large.release_all(provider);
        }
    }
}

/// Size-class memory manager.
///
/// Single-threaded: every mutating call takes `&mut self`. Backing-store
/// exhaustion is fatal and goes to the configured [`ExhaustionHandler`]
/// (abort by default).
pub struct MemoryManager<S: PageSource = SystemPages> {
    provider: PageProvider<S>,
    /// Present exactly while the state is `Ready`.
    tiers: Option<Tiers>,
    state: EngineState,
    config: ManagerConfig,
    observer: Option<Box<dyn AllocObserver>>,
    on_exhaustion: ExhaustionHandler,
    allocations: u64,
    frees: u64,
    lifecycle_violations: u64,
    unknown_tags: u64,
}

// SAFETY: the raw page pointers inside the tiers are owned exclusively by
// this manager and never shared; moving the manager moves that ownership.
unsafe impl<S: PageSource + Send> Send for MemoryManager<S> {}

impl MemoryManager<SystemPages> {
    /// An uninitialized manager backed by the system allocator.
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_source(SystemPages, config)
    }

    /// An uninitialized manager configured from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(ManagerConfig::from_env())
    }
}

impl Default for MemoryManager<SystemPages> {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl<S: PageSource> MemoryManager<S> {
    /// An uninitialized manager drawing pages from `source`.
    pub fn with_source(source: S, config: ManagerConfig) -> Self {
        Self {
            provider: PageProvider::new(source),
            tiers: None,
            state: EngineState::Uninitialized,
            config: config.normalized(),
            observer: None,
            on_exhaustion: abort_on_exhaustion,
            allocations: 0,
            frees: 0,
            lifecycle_violations: 0,
            unknown_tags: 0,
        }
    }

    /// Replaces the exhaustion handler.
    #[must_use]
    pub fn with_exhaustion_handler(mut self, handler: ExhaustionHandler) -> Self {
        self.on_exhaustion = handler;
        self
    }

    /// Installs `observer`, replacing any previous one.
    pub fn set_observer(&mut self, observer: impl AllocObserver + 'static) {
        self.observer = Some(Box::new(observer));
    }

    /// Removes and returns the current observer.
    pub fn take_observer(&mut self) -> Option<Box<dyn AllocObserver>> {
        self.observer.take()
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state
    }

    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    #[must_use]
    pub fn source(&self) -> &S {
        self.provider.source()
    }

    fn emit(&mut self, event: AllocEvent<'_>) {
        if let Some(observer) = self.observer.as_mut() {
            observer.on_event(&event);
        }
    }

    fn flag_violation(
        &mut self,
        op: Op,
        size: Option<usize>,
        ptr: Option<usize>,
        site: Option<CallSite<'_>>,
    ) {
        self.lifecycle_violations += 1;
        self.emit(AllocEvent {
            op,
            route: Route::LifecycleViolation,
            size,
            ptr,
            class: None,
            site,
        });
    }

    fn exhausted(&self, err: &PageError) -> ! {
        (self.on_exhaustion)(err)
    }

    /// Acquires the first slab page and pre-warms every bucket.
    ///
    /// Allowed from `Uninitialized` and `ShutDown`; calling it while `Ready`
    /// is flagged as a lifecycle violation and changes nothing.
    pub fn init(&mut self) {
        if self.state == EngineState::Ready {
            self.flag_violation(Op::Init, None, None, None);
            return;
        }
        let tiers = match Tiers::build(&mut self.provider, &self.config) {
            Ok(tiers) => tiers,
            Err(err) => self.exhausted(&err),
        };
        self.tiers = Some(tiers);
        self.state = EngineState::Ready;
        self.emit(AllocEvent {
            op: Op::Init,
            route: Route::Lifecycle,
            size: None,
            ptr: None,
            class: None,
            site: None,
        });
    }

    /// Releases every page: slab pages, bucket pages on both lists and
    /// oversize blocks still outstanding.
    ///
    /// Outside `Ready` this is flagged as a lifecycle violation.
    pub fn shutdown(&mut self) {
        let Some(mut tiers) = self.tiers.take() else {
            self.flag_violation(Op::Shutdown, None, None, None);
            return;
        };
        // SAFETY: after shutdown no payload handed out earlier may be used.
        unsafe { tiers.release_all(&mut self.provider) };
        self.state = EngineState::ShutDown;
        self.emit(AllocEvent {
            op: Op::Shutdown,
            route: Route::Lifecycle,
            size: None,
            ptr: None,
            class: None,
            site: None,
        });
    }

    /// Allocates `size` bytes, 8-byte aligned.
    ///
    /// Returns `None` for `size == 0` and outside `Ready`.
    #[track_caller]
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.allocate_at(size, Some(CallSite::caller()))
    }

    /// [`allocate`](Self::allocate) with an explicit call site.
    pub fn allocate_at(&mut self, size: usize, site: Option<CallSite<'_>>) -> Option<NonNull<u8>> {
        let Some(tiers) = self.tiers.as_mut() else {
            self.flag_violation(Op::Allocate, Some(size), None, site);
            return None;
        };
        if size == 0 {
            self.emit(AllocEvent {
                op: Op::Allocate,
                route: Route::ZeroSize,
                size: Some(0),
                ptr: None,
                class: None,
                site,
            });
            return None;
        }
        let (payload, route, class) = match tiers.allocate(&mut self.provider, size) {
            Ok(granted) => granted,
            Err(err) => self.exhausted(&err),
        };
        self.allocations += 1;
        self.emit(AllocEvent {
            op: Op::Allocate,
            route,
            size: Some(size),
            ptr: Some(payload.as_ptr() as usize),
            class,
            site,
        });
        Some(payload)
    }

    /// Returns a block to the tier that produced it. `None` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be `None` or a payload returned by [`allocate`](Self::allocate)
    /// on this manager since its last `init`, not yet freed. The block must not
    /// be used afterwards.
    #[track_caller]
    pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>) {
        // SAFETY: forwarded caller contract.
        unsafe { self.free_at(ptr, Some(CallSite::caller())) }
    }

    /// [`free`](Self::free) with an explicit call site.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free).
    pub unsafe fn free_at(&mut self, ptr: Option<NonNull<u8>>, site: Option<CallSite<'_>>) {
        let address = ptr.map(|payload| payload.as_ptr() as usize);
        let Some(tiers) = self.tiers.as_mut() else {
            self.flag_violation(Op::Free, None, address, site);
            return;
        };
        let Some(payload) = ptr else {
            self.emit(AllocEvent {
                op: Op::Free,
                route: Route::Null,
                size: None,
                ptr: None,
                class: None,
                site,
            });
            return;
        };

        // SAFETY: live engine payloads are preceded by their tag.
        let tag = unsafe { BlockTag::read(payload) };
        let (route, size, class) = match tag.tier() {
            Some(Tier::Small) if tag.class() < NUM_FREE_LISTS => {
                let index = tag.class();
                // SAFETY: the tag names this block's own free list.
                unsafe { tiers.small.free(payload, index) };
                (Route::SmallFreeList, index * ALIGNMENT, Some(index))
            }
            Some(Tier::Bucket) if tag.class() < size_class::NUM_SIZE_CLASSES => {
                // SAFETY: a bucket tag means the payload sits in a bucket page.
                let class = unsafe { tiers.buckets.free(payload) };
                (
                    Route::BucketFreeList,
                    size_class::class_size(class),
                    Some(class),
                )
            }
            Some(Tier::Large) => {
                // SAFETY: a large tag means the payload heads an oversize block.
                let size = unsafe { tiers.large.free(&mut self.provider, payload) };
                (Route::Oversize, size, None)
            }
            _ => {
                self.unknown_tags += 1;
                self.emit(AllocEvent {
                    op: Op::Free,
                    route: Route::UnknownTag,
                    size: None,
                    ptr: address,
                    class: None,
                    site,
                });
                return;
            }
        };
        self.frees += 1;
        self.emit(AllocEvent {
            op: Op::Free,
            route,
            size: Some(size),
            ptr: address,
            class,
            site,
        });
    }

    /// Tier, class and usable capacity of a live block.
    ///
    /// # Safety
    ///
    /// `ptr` must be `None` or a live payload from this manager.
    #[must_use]
    pub unsafe fn block_info(&self, ptr: Option<NonNull<u8>>) -> Option<BlockInfo> {
        let payload = ptr?;
        // SAFETY: forwarded caller contract.
        let tag = unsafe { BlockTag::read(payload) };
        let tier = tag.tier()?;
        let class = tag.class();
        let usable = match tier {
            Tier::Small => class * ALIGNMENT,
            Tier::Bucket => size_class::class_size(class),
            // SAFETY: a large tag means the payload heads an oversize block.
            Tier::Large => unsafe { LargeAllocator::size_of(payload) },
        };
        Some(BlockInfo {
            tier,
            class,
            usable,
        })
    }

    /// Usable bytes behind `ptr`, 0 for `None` or an unrecognized block.
    ///
    /// # Safety
    ///
    /// Same contract as [`block_info`](Self::block_info).
    #[must_use]
    pub unsafe fn usable_size(&self, ptr: Option<NonNull<u8>>) -> usize {
        // SAFETY: forwarded caller contract.
        unsafe { self.block_info(ptr) }.map_or(0, |info| info.usable)
    }

    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let (small, bucket_pages, bucket_free_pages, large) = match &self.tiers {
            Some(tiers) => (
                tiers.small.stats(),
                tiers.buckets.total_pages(),
                tiers.buckets.total_free_pages(),
                tiers.large.stats(),
            ),
            None => (SmallStats::default(), 0, 0, LargeStats::default()),
        };
        ManagerStats {
            state: self.state,
            pages: self.provider.stats(),
            small,
            bucket_pages,
            bucket_free_pages,
            large,
            allocations: self.allocations,
            frees: self.frees,
            lifecycle_violations: self.lifecycle_violations,
            unknown_tags: self.unknown_tags,
        }
    }

    #[must_use]
    pub fn lifecycle_violations(&self) -> u64 {
        self.lifecycle_violations
    }

    /// Length of the small free list at `index` (0 when not `Ready`).
    #[must_use]
    pub fn small_free_list_len(&self, index: usize) -> usize {
        self.tiers
            .as_ref()
            .map_or(0, |tiers| tiers.small.free_list_len(index))
    }

    /// Snapshot of the bucket for `class` (`None` when not `Ready`).
    #[must_use]
    pub fn bucket_view(&self, class: usize) -> Option<BucketView> {
        self.tiers.as_ref()?.buckets.view(class)
    }
}

impl<S: PageSource> Drop for MemoryManager<S> {
    fn drop(&mut self) {
        if let Some(mut tiers) = self.tiers.take() {
            // SAFETY: the manager is going away, so no payload can be used.
            unsafe { tiers.release_all(&mut self.provider) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrewarmPolicy;
    use crate::malloc::observe::{AllocatorLogLevel, LifecycleLog};

    fn ready() -> MemoryManager {
        let mut manager = MemoryManager::default();
        manager.init();
        manager
    }

    #[test]
    fn freed_block_is_reused_by_same_size() {
        let mut manager = ready();
        let a = manager.allocate(32);
        let b = manager.allocate(32);
        assert!(a.is_some() && b.is_some());
        assert_ne!(a, b);
        unsafe { manager.free(a) };
        let c = manager.allocate(32);
        assert_eq!(c, a);

        unsafe {
            manager.free(b);
            manager.free(c);
        }
        manager.shutdown();
        assert_eq!(manager.stats().pages.outstanding(), 0);
        assert_eq!(manager.stats().pages.bytes_outstanding, 0);
    }

    #[test]
    fn zero_size_and_null_are_noops() {
        let mut manager = ready();
        assert!(manager.allocate(0).is_none());
        let before: Vec<usize> = (0..NUM_FREE_LISTS)
            .map(|i| manager.small_free_list_len(i))
            .collect();
        unsafe { manager.free(None) };
        let after: Vec<usize> = (0..NUM_FREE_LISTS)
            .map(|i| manager.small_free_list_len(i))
            .collect();
        assert_eq!(before, after);
        assert_eq!(manager.stats().allocations, 0);
        assert_eq!(manager.stats().frees, 0);
    }

    #[test]
    fn sizes_route_to_their_tier() {
        let mut manager = ready();
        let cases = [
            (1, Tier::Small, 8),
            (256, Tier::Small, 256),
            (257, Tier::Bucket, 288),
            (1024, Tier::Bucket, 1024),
            (327_684, Tier::Bucket, 327_684),
            (400_000, Tier::Large, 400_000),
        ];
        for (size, tier, usable) in cases {
            let ptr = manager.allocate(size);
            let info = unsafe { manager.block_info(ptr) }.unwrap();
            assert_eq!(info.tier, tier, "size {size}");
            assert_eq!(info.usable, usable, "size {size}");
            assert_eq!(ptr.unwrap().as_ptr() as usize % ALIGNMENT, 0);
            unsafe { manager.free(ptr) };
        }
        assert_eq!(manager.stats().large.active, 0);
    }

    #[test]
    fn bucket_reuse_acquires_no_page() {
        let mut manager = ready();
        let first = manager.allocate(5000);
        unsafe { manager.free(first) };
        let acquired = manager.stats().pages.acquired;
        let again = manager.allocate(4800);
        assert_eq!(again, first);
        assert_eq!(manager.stats().pages.acquired, acquired);
    }

    #[test]
    fn init_prewarms_buckets_onto_free_lists() {
        let manager = ready();
        let stats = manager.stats();
        let expected: usize = (0..size_class::NUM_SIZE_CLASSES)
            .map(|class| PrewarmPolicy::Scaled.pages_for(class))
            .sum();
        assert_eq!(stats.bucket_pages, expected);
        assert_eq!(stats.bucket_free_pages, expected);
        assert_eq!(stats.small.pages, 1);
        assert_eq!(stats.pages.outstanding() as usize, expected + 1);
    }

    #[test]
    fn shutdown_releases_live_blocks_in_every_tier() {
        let mut manager = ready();
        for size in [16, 300, 70_000, 1_000_000] {
            assert!(manager.allocate(size).is_some());
        }
        manager.shutdown();
        let stats = manager.stats();
        assert_eq!(stats.state, EngineState::ShutDown);
        assert_eq!(stats.pages.outstanding(), 0);
        assert_eq!(stats.pages.bytes_outstanding, 0);
    }

    #[test]
    fn reinit_after_shutdown() {
        let mut manager = ready();
        manager.shutdown();
        manager.init();
        assert_eq!(manager.state(), EngineState::Ready);
        assert!(manager.allocate(64).is_some());
        assert_eq!(manager.lifecycle_violations(), 0);
    }

    #[test]
    fn calls_outside_ready_are_flagged() {
        let log = LifecycleLog::shared();
        let mut manager = MemoryManager::default();
        manager.set_observer(std::sync::Arc::clone(&log));

        assert!(manager.allocate(32).is_none());
        unsafe { manager.free(None) };
        manager.shutdown();
        assert_eq!(manager.lifecycle_violations(), 3);

        manager.init();
        manager.init();
        assert_eq!(manager.lifecycle_violations(), 4);

        let records = log.lock().drain();
        let warnings = records
            .iter()
            .filter(|r| r.level == AllocatorLogLevel::Warn && r.event == "lifecycle_violation")
            .count();
        assert_eq!(warnings, 4);
        assert!(records.iter().any(|r| r.symbol == "init" && r.event == "lifecycle"));
    }

    #[test]
    fn observer_sees_routes_and_call_sites() {
        let log = LifecycleLog::shared();
        let mut manager = ready();
        manager.set_observer(std::sync::Arc::clone(&log));
        let a = manager.allocate(24);
        unsafe { manager.free(a) };
        let b = manager.allocate(24);
        unsafe { manager.free(b) };

        let records = log.lock().drain();
        let events: Vec<&str> = records.iter().map(|r| r.event).collect();
        assert_eq!(
            events,
            ["small_bump", "small_free_list", "small_free_list", "small_free_list"]
        );
        assert!(
            records
                .iter()
                .all(|r| r.file.as_deref().is_some_and(|f| f.ends_with("allocator.rs")))
        );
        assert_eq!(records[0].size, Some(24));
        assert_eq!(records[0].class, Some(3));
    }

    #[test]
    fn taken_observer_stops_receiving_events() {
        let log = LifecycleLog::shared();
        let mut manager = ready();
        manager.set_observer(std::sync::Arc::clone(&log));
        let a = manager.allocate(40);
        assert!(manager.take_observer().is_some());
        assert!(manager.take_observer().is_none());
        unsafe { manager.free(a) };
        assert!(manager.allocate(40).is_some());
        assert_eq!(log.lock().records().len(), 1);
        assert_eq!(manager.stats().frees, 1);
    }

    #[test]
    fn unknown_tag_is_counted_not_dispatched() {
        let mut manager = ready();
        let mut fake = [0_u64; 4];
        let payload = NonNull::new(fake[1..].as_mut_ptr().cast::<u8>()).unwrap();
        unsafe { manager.free(Some(payload)) };
        assert_eq!(manager.stats().unknown_tags, 1);
        assert_eq!(manager.stats().frees, 0);
    }

    #[test]
    fn stats_serialize_to_json() {
        let manager = ready();
        let json = serde_json::to_value(manager.stats()).unwrap();
        assert_eq!(json["state"], "ready");
        assert!(json["pages"]["acquired"].as_u64().unwrap() > 0);
    }

    #[test]
    fn drop_releases_pages() {
        let mut manager = ready();
        manager.allocate(100);
        drop(manager);
    }
}
