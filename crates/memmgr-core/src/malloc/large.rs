//! Oversize allocation handling (>327684 bytes).
//!
//! Requests above the largest size class go straight to the page source.
//! Each block carries a small header linking it into a list of live oversize
//! blocks, so shutdown can hand back anything the caller never freed.

use std::ptr::{self, NonNull};

use serde::Serialize;

use super::page::{LargeBlock, PageProvider, PageSource};
use crate::error::PageError;

/// Counters for the oversize tier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LargeStats {
    /// Blocks currently live.
    pub active: usize,
    /// Payload bytes currently live.
    pub active_bytes: usize,
    /// Blocks handed out since creation.
    pub total_allocations: u64,
}

/// Tracks live oversize blocks.
pub struct LargeAllocator {
    live: *mut LargeBlock,
    stats: LargeStats,
}

impl LargeAllocator {
    /// Creates a new large allocator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: ptr::null_mut(),
            stats: LargeStats::default(),
        }
    }

    /// Acquires a block with room for `size` payload bytes.
    pub fn alloc<S: PageSource>(
        &mut self,
        provider: &mut PageProvider<S>,
        size: usize,
    ) -> Result<NonNull<u8>, PageError> {
        let block = provider.acquire_large(size)?;
        // SAFETY: `block` is fresh and the live head is null or live.
        unsafe {
            (*block.as_ptr()).next = self.live;
            if let Some(head) = self.live.as_mut() {
                head.previous = block.as_ptr();
            }
        }
        self.live = block.as_ptr();
        self.stats.active += 1;
        self.stats.active_bytes += size;
        self.stats.total_allocations += 1;
        // SAFETY: `block` is a live large block.
        Ok(unsafe { LargeBlock::payload(block) })
    }

    /// Unlinks and releases the block owning `payload`. Returns its size.
    ///
    /// # Safety
    ///
    /// `payload` must be a live block from this tier.
    pub unsafe fn free<S: PageSource>(
        &mut self,
        provider: &mut PageProvider<S>,
        payload: NonNull<u8>,
    ) -> usize {
        // SAFETY: large payloads sit a fixed header distance past their block.
        let block = unsafe { LargeBlock::from_payload(payload) }.as_ptr();
        // SAFETY: `block` and its neighbours are live members of `live`.
        let size = unsafe {
            let next = (*block).next;
            let previous = (*block).previous;
            match previous.as_mut() {
                Some(previous) => previous.next = next,
                None => self.live = next,
            }
            if let Some(next) = next.as_mut() {
                next.previous = previous;
            }
            (*block).size
        };
        self.stats.active -= 1;
        self.stats.active_bytes -= size;
        // SAFETY: unlinked, so nothing references the block any more.
        unsafe { provider.release_large(block) };
        size
    }

    /// Payload bytes recorded for the block owning `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must be a live block from this tier.
    #[must_use]
    pub unsafe fn size_of(payload: NonNull<u8>) -> usize {
        // SAFETY: see function contract.
        unsafe { (*LargeBlock::from_payload(payload).as_ptr()).size }
    }

    /// Returns the total number of active large allocations.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.stats.active
    }

    #[must_use]
    pub fn stats(&self) -> LargeStats {
        self.stats
    }

    /// Releases every live block.
    ///
    /// # Safety
    ///
    /// No block from this tier may be used afterwards.
    pub unsafe fn release_all<S: PageSource>(&mut self, provider: &mut PageProvider<S>) {
        let mut block = self.live;
        while let Some(current) = NonNull::new(block) {
            // SAFETY: read the link before the block is released.
            block = unsafe { (*current.as_ptr()).next };
            // SAFETY: every live block came from this provider.
            unsafe { provider.release_large(current.as_ptr()) };
        }
        self.live = ptr::null_mut();
        self.stats.active = 0;
        self.stats.active_bytes = 0;
    }
}

impl Default for LargeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::malloc::page::{BlockTag, SystemPages, Tier};

    #[test]
    fn alloc_and_free() {
        let mut provider = PageProvider::new(SystemPages);
        let mut la = LargeAllocator::new();
        let payload = la.alloc(&mut provider, 400_000).unwrap();
        assert_eq!(la.active_count(), 1);
        assert_eq!(la.stats().active_bytes, 400_000);
        assert_eq!(unsafe { LargeAllocator::size_of(payload) }, 400_000);
        assert_eq!(unsafe { BlockTag::read(payload) }.tier(), Some(Tier::Large));

        assert_eq!(unsafe { la.free(&mut provider, payload) }, 400_000);
        assert_eq!(la.active_count(), 0);
        assert_eq!(provider.stats().outstanding(), 0);
    }

    #[test]
    fn free_out_of_order_keeps_list_consistent() {
        let mut provider = PageProvider::new(SystemPages);
        let mut la = LargeAllocator::new();
        let blocks: Vec<_> = (0..4)
            .map(|i| la.alloc(&mut provider, 330_000 + i * 1000).unwrap())
            .collect();
        unsafe {
            la.free(&mut provider, blocks[1]);
            la.free(&mut provider, blocks[3]);
        }
        assert_eq!(la.active_count(), 2);
        assert_eq!(la.stats().active_bytes, 330_000 + 332_000);
        unsafe { la.release_all(&mut provider) };
        assert_eq!(provider.stats().outstanding(), 0);
        assert_eq!(la.stats().total_allocations, 4);
    }

    #[test]
    fn release_all_reclaims_unfreed_blocks() {
        let mut provider = PageProvider::new(SystemPages);
        let mut la = LargeAllocator::new();
        la.alloc(&mut provider, 500_000).unwrap();
        la.alloc(&mut provider, 600_000).unwrap();
        unsafe { la.release_all(&mut provider) };
        assert_eq!(la.active_count(), 0);
        assert_eq!(provider.stats().bytes_outstanding, 0);
    }
}
