//! Small-object tier (1..=256 bytes).
//!
//! Blocks are carved off the current slab page by advancing a cursor. Each
//! block is `TAG_SIZE + aligned_size` bytes; the tag records the free-list
//! index so `free` can find the right list without a size argument.
//!
//! Freed blocks go onto one of 33 singly-linked free lists, indexed by
//! `aligned_size / 8`. The link lives in the block's first word. Retired pages
//! are never bump-allocated again; their blocks come back only through the
//! free lists.

use std::ptr::{self, NonNull};

use serde::Serialize;

use super::page::{
    ALIGNMENT, BlockTag, PageProvider, PageSource, SlabPage, TAG_SIZE, Tier, WORD_SIZE,
};
use crate::config::MIN_SLAB_PAGE_BYTES;
use crate::error::PageError;

/// Largest request serviced by this tier (bytes).
pub const SMALL_MAX: usize = 256;

/// Number of free-list heads (indices 0..=32).
pub const NUM_FREE_LISTS: usize = SMALL_MAX / ALIGNMENT + 1;

/// Rounds `size` up to at least one word and to a multiple of [`ALIGNMENT`].
#[must_use]
pub const fn align_small(size: usize) -> usize {
    let size = if size < WORD_SIZE { WORD_SIZE } else { size };
    size.next_multiple_of(ALIGNMENT)
}

/// Free-list index for a request of `size` bytes.
#[must_use]
pub const fn free_list_index(size: usize) -> usize {
    align_small(size) / ALIGNMENT
}

/// Link stored in the first word of a free block.
#[repr(C)]
struct FreeNode {
    next: *mut FreeNode,
}

/// How a small allocation was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmallPath {
    /// Popped from a free list.
    FreeList,
    /// Bump-allocated from the current page.
    Bump,
    /// Bump-allocated from a page acquired for this request.
    FreshPage,
}

/// Counters for the small tier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SmallStats {
    /// Slab pages currently owned (current + retired).
    pub pages: usize,
    pub bump_allocations: u64,
    pub free_list_hits: u64,
    pub frees: u64,
}

/// Bump allocator with per-size free lists.
pub struct SmallAllocator {
    /// Page accepting bump allocations. Null only after `release_all`.
    current: *mut SlabPage,
    /// Head of the retired-page list.
    retired: *mut SlabPage,
    free_lists: [*mut FreeNode; NUM_FREE_LISTS],
    page_bytes: usize,
    stats: SmallStats,
}

impl SmallAllocator {
    /// Creates the tier and acquires its first page.
    ///
    /// `page_bytes` is raised to [`MIN_SLAB_PAGE_BYTES`] so every page holds
    /// at least one maximal block.
    pub fn new<S: PageSource>(
        provider: &mut PageProvider<S>,
        page_bytes: usize,
    ) -> Result<Self, PageError> {
        let page_bytes = page_bytes.max(MIN_SLAB_PAGE_BYTES);
        let first = provider.acquire_slab_page(page_bytes)?;
        Ok(Self {
            current: first.as_ptr(),
            retired: ptr::null_mut(),
            free_lists: [ptr::null_mut(); NUM_FREE_LISTS],
            page_bytes,
            stats: SmallStats {
                pages: 1,
                ..SmallStats::default()
            },
        })
    }

    /// Allocates a block of at least `size` bytes.
    ///
    /// Returns `Ok(None)` when `size` exceeds [`SMALL_MAX`].
    pub fn allocate<S: PageSource>(
        &mut self,
        provider: &mut PageProvider<S>,
        size: usize,
    ) -> Result<Option<(NonNull<u8>, SmallPath)>, PageError> {
        if size > SMALL_MAX {
            return Ok(None);
        }
        let aligned = align_small(size);
        let index = aligned / ALIGNMENT;

        if let Some(node) = NonNull::new(self.free_lists[index]) {
            // SAFETY: nodes on a free list are blocks this tier owns; their
            // first word holds the link written by `free`.
            self.free_lists[index] = unsafe { (*node.as_ptr()).next };
            self.stats.free_list_hits += 1;
            return Ok(Some((node.cast(), SmallPath::FreeList)));
        }

        let needed = TAG_SIZE + aligned;
        let mut path = SmallPath::Bump;
        if self.remaining() < needed {
            self.refill(provider)?;
            path = SmallPath::FreshPage;
        }

        let Some(page) = NonNull::new(self.current) else {
            // `refill` always installs a page or returns an error.
            return Err(PageError::Exhausted { bytes: needed });
        };
        // SAFETY: `page` is the live current page and `needed` bytes fit
        // behind its cursor, so the block lies inside the payload region.
        let payload = unsafe {
            let header = &mut *page.as_ptr();
            let block = SlabPage::payload(page).add(header.cursor);
            header.cursor += needed;
            debug_assert!(header.cursor <= header.size);
            let payload = block.add(TAG_SIZE);
            BlockTag::new(Tier::Small, index).write(payload);
            payload
        };
        self.stats.bump_allocations += 1;
        Ok(Some((payload, path)))
    }

    /// Pushes a block onto the free list for `index`.
    ///
    /// # Safety
    ///
    /// `payload` must be a live block from this tier whose tag names `index`,
    /// and the caller must not use it afterwards.
    pub unsafe fn free(&mut self, payload: NonNull<u8>, index: usize) {
        debug_assert!(index < NUM_FREE_LISTS);
        let node = payload.cast::<FreeNode>();
        // SAFETY: blocks are at least one word and 8-byte aligned.
        unsafe {
            node.as_ptr().write(FreeNode {
                next: self.free_lists[index],
            });
        }
        self.free_lists[index] = node.as_ptr();
        self.stats.frees += 1;
    }

    /// Payload bytes of each slab page.
    #[must_use]
    pub fn page_bytes(&self) -> usize {
        self.page_bytes
    }

    /// Bytes left on the current page.
    #[must_use]
    pub fn remaining(&self) -> usize {
        // SAFETY: `current` is null or a live page owned by this tier.
        unsafe { self.current.as_ref() }.map_or(0, SlabPage::remaining)
    }

    /// Retires the current page and installs a fresh one.
    fn refill<S: PageSource>(&mut self, provider: &mut PageProvider<S>) -> Result<(), PageError> {
        let fresh = provider.acquire_slab_page(self.page_bytes)?;
        if let Some(old) = NonNull::new(self.current) {
            // SAFETY: `old` and the retired head are live pages of this tier.
            unsafe {
                (*old.as_ptr()).next = self.retired;
                (*old.as_ptr()).previous = ptr::null_mut();
                if let Some(head) = self.retired.as_mut() {
                    head.previous = old.as_ptr();
                }
            }
            self.retired = old.as_ptr();
        }
        self.current = fresh.as_ptr();
        self.stats.pages += 1;
        Ok(())
    }

    /// Length of the free list at `index`.
    #[must_use]
    pub fn free_list_len(&self, index: usize) -> usize {
        let mut len = 0;
        let mut node = self.free_lists.get(index).copied().unwrap_or(ptr::null_mut());
        while let Some(current) = NonNull::new(node) {
            len += 1;
            // SAFETY: free-list nodes are live blocks owned by this tier.
            node = unsafe { (*current.as_ptr()).next };
        }
        len
    }

    /// Head of the free list at `index`.
    #[must_use]
    pub fn free_list_head(&self, index: usize) -> Option<NonNull<u8>> {
        self.free_lists
            .get(index)
            .and_then(|&head| NonNull::new(head))
            .map(NonNull::cast)
    }

    /// Number of retired pages.
    #[must_use]
    pub fn retired_pages(&self) -> usize {
        let mut count = 0;
        let mut page = self.retired;
        // SAFETY: retired pages stay live until `release_all`.
        while let Some(header) = unsafe { page.as_ref() } {
            count += 1;
            page = header.next;
        }
        count
    }

    #[must_use]
    pub fn stats(&self) -> SmallStats {
        self.stats
    }

    /// Returns every page to the provider and clears the free lists.
    ///
    /// # Safety
    ///
    /// No block from this tier may be used afterwards.
    pub unsafe fn release_all<S: PageSource>(&mut self, provider: &mut PageProvider<S>) {
        let mut page = self.retired;
        while let Some(current) = NonNull::new(page) {
            // SAFETY: read the link before the page is released.
            page = unsafe { (*current.as_ptr()).next };
            // SAFETY: retired pages belong to this provider.
            unsafe { provider.release_slab_page(current.as_ptr()) };
        }
        // SAFETY: the current page belongs to this provider; null is a no-op.
        unsafe { provider.release_slab_page(self.current) };
        self.current = ptr::null_mut();
        self.retired = ptr::null_mut();
        self.free_lists = [ptr::null_mut(); NUM_FREE_LISTS];
        self.stats.pages = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::malloc::page::SystemPages;

    const PAGE: usize = 1024;

    fn tier() -> (PageProvider<SystemPages>, SmallAllocator) {
        let mut provider = PageProvider::new(SystemPages);
        let small = SmallAllocator::new(&mut provider, PAGE).unwrap();
        (provider, small)
    }

    fn take(
        provider: &mut PageProvider<SystemPages>,
        small: &mut SmallAllocator,
        size: usize,
    ) -> (NonNull<u8>, SmallPath) {
        small.allocate(provider, size).unwrap().unwrap()
    }

    #[test]
    fn alignment_rounds_up_to_words() {
        assert_eq!(align_small(1), 8);
        assert_eq!(align_small(8), 8);
        assert_eq!(align_small(9), 16);
        assert_eq!(align_small(255), 256);
        assert_eq!(free_list_index(1), 1);
        assert_eq!(free_list_index(256), 32);
        assert_eq!(NUM_FREE_LISTS, 33);
    }

    #[test]
    fn bump_allocations_are_contiguous_and_tagged() {
        let (mut provider, mut small) = tier();
        let (a, path_a) = take(&mut provider, &mut small, 10);
        let (b, path_b) = take(&mut provider, &mut small, 10);
        assert_eq!(path_a, SmallPath::Bump);
        assert_eq!(path_b, SmallPath::Bump);
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, TAG_SIZE + 16);
        assert_eq!(a.as_ptr() as usize % ALIGNMENT, 0);
        let tag = unsafe { BlockTag::read(a) };
        assert_eq!(tag.tier(), Some(Tier::Small));
        assert_eq!(tag.class(), 2);
        assert_eq!(small.remaining(), PAGE - 2 * (TAG_SIZE + 16));
        unsafe { small.release_all(&mut provider) };
    }

    #[test]
    fn free_list_is_lifo_and_checked_before_bump() {
        let (mut provider, mut small) = tier();
        let (a, _) = take(&mut provider, &mut small, 32);
        let (b, _) = take(&mut provider, &mut small, 32);
        let before = small.remaining();
        unsafe {
            small.free(a, 4);
            small.free(b, 4);
        }
        assert_eq!(small.free_list_len(4), 2);
        assert_eq!(small.free_list_head(4), Some(b));

        let (c, path) = take(&mut provider, &mut small, 25);
        assert_eq!(path, SmallPath::FreeList);
        assert_eq!(c, b);
        let (d, _) = take(&mut provider, &mut small, 32);
        assert_eq!(d, a);
        assert_eq!(small.remaining(), before);
        assert_eq!(small.stats().free_list_hits, 2);
        unsafe { small.release_all(&mut provider) };
    }

    #[test]
    fn freed_block_does_not_serve_other_sizes() {
        let (mut provider, mut small) = tier();
        let (a, _) = take(&mut provider, &mut small, 64);
        unsafe { small.free(a, free_list_index(64)) };
        let (b, path) = take(&mut provider, &mut small, 72);
        assert_ne!(a, b);
        assert_eq!(path, SmallPath::Bump);
        unsafe { small.release_all(&mut provider) };
    }

    #[test]
    fn exhausted_page_is_retired() {
        let (mut provider, mut small) = tier();
        let per_block = TAG_SIZE + SMALL_MAX;
        let fit = PAGE / per_block;
        for _ in 0..fit {
            let (_, path) = take(&mut provider, &mut small, SMALL_MAX);
            assert_ne!(path, SmallPath::FreshPage);
        }
        let (_, path) = take(&mut provider, &mut small, SMALL_MAX);
        assert_eq!(path, SmallPath::FreshPage);
        assert_eq!(small.retired_pages(), 1);
        assert_eq!(small.stats().pages, 2);
        assert_eq!(provider.stats().outstanding(), 2);

        unsafe { small.release_all(&mut provider) };
        assert_eq!(provider.stats().outstanding(), 0);
        assert_eq!(small.remaining(), 0);
        assert_eq!(small.retired_pages(), 0);
    }

    #[test]
    fn cursor_never_passes_page_end() {
        let (mut provider, mut small) = tier();
        for size in (1..=SMALL_MAX).cycle().take(2_000) {
            take(&mut provider, &mut small, size);
            assert!(small.remaining() <= PAGE);
        }
        unsafe { small.release_all(&mut provider) };
    }

    #[test]
    fn undersized_page_is_raised_to_fit_a_maximal_block() {
        let mut provider = PageProvider::new(SystemPages);
        let mut small = SmallAllocator::new(&mut provider, 16).unwrap();
        assert_eq!(small.page_bytes(), MIN_SLAB_PAGE_BYTES);
        assert_eq!(small.remaining(), MIN_SLAB_PAGE_BYTES);

        let (_, path) = take(&mut provider, &mut small, SMALL_MAX);
        assert_eq!(path, SmallPath::Bump);
        assert_eq!(small.remaining(), 0);
        let (_, path) = take(&mut provider, &mut small, SMALL_MAX);
        assert_eq!(path, SmallPath::FreshPage);
        assert_eq!(small.remaining(), 0);
        unsafe { small.release_all(&mut provider) };
        assert_eq!(provider.stats().outstanding(), 0);
    }

    #[test]
    fn requests_above_small_max_are_declined() {
        let (mut provider, mut small) = tier();
        let before = small.remaining();
        assert!(small.allocate(&mut provider, SMALL_MAX + 1).unwrap().is_none());
        assert!(small.allocate(&mut provider, 1000).unwrap().is_none());
        assert_eq!(small.remaining(), before);
        assert_eq!(small.stats().bump_allocations, 0);
        unsafe { small.release_all(&mut provider) };
    }
}
