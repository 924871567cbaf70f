//! Backing pages and block tags.
//!
//! The page provider obtains blocks from a [`PageSource`] (the system
//! allocator by default) and lays a header over the front of each one. Three
//! block shapes exist:
//!
//! ```text
//! slab page:    [ SlabPage header | tag | payload | tag | payload | ... ]
//! bucket page:  [ next | previous | tag ][ payload of class size ]
//! large block:  [ next | previous | size | tag ][ payload ]
//! ```
//!
//! Every payload handed to a caller is 8-byte aligned and immediately preceded
//! by an 8-byte [`BlockTag`] naming the tier and class that produced it. This
//! is what makes `free` self-describing.

use std::alloc::Layout;
use std::mem::{offset_of, size_of};
use std::ptr::{self, NonNull};

use serde::Serialize;

use super::size_class;
use crate::error::PageError;

/// Alignment of every payload and header (bytes).
pub const ALIGNMENT: usize = 8;

/// Size of the free-list link stored in a recycled block.
pub const WORD_SIZE: usize = size_of::<usize>();

const SMALL_MAGIC: u32 = 0x534d_4c4c;
const BUCKET_MAGIC: u32 = 0x4255_434b;
const LARGE_MAGIC: u32 = 0x4c41_5247;

/// Allocation tier that owns a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum Tier {
    Small = SMALL_MAGIC,
    Bucket = BUCKET_MAGIC,
    Large = LARGE_MAGIC,
}

impl Tier {
    const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            SMALL_MAGIC => Some(Self::Small),
            BUCKET_MAGIC => Some(Self::Bucket),
            LARGE_MAGIC => Some(Self::Large),
            _ => None,
        }
    }
}

/// Tier and class of a block, stored in the 8 bytes before its payload.
///
/// For small blocks `class` is the free-list index (aligned size / 8); for
/// bucket pages it is the size-class index; large blocks store 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BlockTag {
    tier: u32,
    class: u32,
}

/// Distance from a payload back to its tag.
pub const TAG_SIZE: usize = size_of::<BlockTag>();

const _: () = assert!(TAG_SIZE == ALIGNMENT);

impl BlockTag {
    #[must_use]
    pub const fn new(tier: Tier, class: usize) -> Self {
        Self {
            tier: tier as u32,
            class: class as u32,
        }
    }

    /// Decoded tier, `None` if the tag bytes are not a known tier.
    #[must_use]
    pub const fn tier(self) -> Option<Tier> {
        Tier::from_raw(self.tier)
    }

    #[must_use]
    pub const fn class(self) -> usize {
        self.class as usize
    }

    /// Reads the tag stored immediately before `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by this engine and not yet released
    /// back to the page source.
    #[must_use]
    pub unsafe fn read(payload: NonNull<u8>) -> Self {
        // SAFETY: caller guarantees `payload` is an engine block, all of which
        // are preceded by an aligned tag inside the same allocation.
        unsafe { payload.sub(TAG_SIZE).cast::<Self>().read() }
    }

    /// Writes this tag immediately before `payload`.
    ///
    /// # Safety
    ///
    /// The `TAG_SIZE` bytes before `payload` must belong to the same block
    /// and be writable.
    pub(crate) unsafe fn write(self, payload: NonNull<u8>) {
        // SAFETY: see function contract.
        unsafe { payload.sub(TAG_SIZE).cast::<Self>().write(self) }
    }
}

/// Header of a bucket page. One page backs exactly one block.
#[derive(Debug)]
#[repr(C)]
pub struct BucketPage {
    pub(crate) next: *mut BucketPage,
    pub(crate) previous: *mut BucketPage,
    pub(crate) tag: BlockTag,
}

/// Offset from a bucket page to its payload.
pub const BUCKET_HEADER_SIZE: usize = size_of::<BucketPage>();

const _: () = assert!(offset_of!(BucketPage, tag) + TAG_SIZE == BUCKET_HEADER_SIZE);
const _: () = assert!(BUCKET_HEADER_SIZE % ALIGNMENT == 0);

impl BucketPage {
    /// # Safety
    ///
    /// `page` must be a live bucket page acquired from a [`PageProvider`].
    #[must_use]
    pub unsafe fn payload(page: NonNull<Self>) -> NonNull<u8> {
        // SAFETY: the payload immediately follows the header in one block.
        unsafe { page.cast::<u8>().add(BUCKET_HEADER_SIZE) }
    }

    /// Recovers the owning page from a payload pointer.
    ///
    /// # Safety
    ///
    /// `payload` must have come from [`BucketPage::payload`].
    #[must_use]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<Self> {
        // SAFETY: see function contract.
        unsafe { payload.sub(BUCKET_HEADER_SIZE).cast() }
    }
}

/// Header of a slab page used by the small-object tier.
#[derive(Debug)]
#[repr(C)]
pub struct SlabPage {
    pub(crate) next: *mut SlabPage,
    pub(crate) previous: *mut SlabPage,
    /// Offset of the next unallocated payload byte.
    pub(crate) cursor: usize,
    /// Total payload bytes.
    pub(crate) size: usize,
}

/// Offset from a slab page to the start of its payload region.
pub const SLAB_HEADER_SIZE: usize = size_of::<SlabPage>();

const _: () = assert!(SLAB_HEADER_SIZE % ALIGNMENT == 0);

impl SlabPage {
    /// # Safety
    ///
    /// `page` must be a live slab page acquired from a [`PageProvider`].
    #[must_use]
    pub unsafe fn payload(page: NonNull<Self>) -> NonNull<u8> {
        // SAFETY: the payload region immediately follows the header.
        unsafe { page.cast::<u8>().add(SLAB_HEADER_SIZE) }
    }

    /// Unallocated bytes left behind the cursor.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.size - self.cursor
    }
}

/// Header of an oversize block forwarded to the page source.
#[derive(Debug)]
#[repr(C)]
pub struct LargeBlock {
    pub(crate) next: *mut LargeBlock,
    pub(crate) previous: *mut LargeBlock,
    /// Payload bytes requested by the caller.
    pub(crate) size: usize,
    pub(crate) tag: BlockTag,
}

/// Offset from a large block to its payload.
pub const LARGE_HEADER_SIZE: usize = size_of::<LargeBlock>();

const _: () = assert!(offset_of!(LargeBlock, tag) + TAG_SIZE == LARGE_HEADER_SIZE);
const _: () = assert!(LARGE_HEADER_SIZE % ALIGNMENT == 0);

impl LargeBlock {
    /// # Safety
    ///
    /// `block` must be a live large block acquired from a [`PageProvider`].
    #[must_use]
    pub unsafe fn payload(block: NonNull<Self>) -> NonNull<u8> {
        // SAFETY: the payload immediately follows the header.
        unsafe { block.cast::<u8>().add(LARGE_HEADER_SIZE) }
    }

    /// # Safety
    ///
    /// `payload` must have come from [`LargeBlock::payload`].
    #[must_use]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<Self> {
        // SAFETY: see function contract.
        unsafe { payload.sub(LARGE_HEADER_SIZE).cast() }
    }
}

/// Where backing memory comes from.
pub trait PageSource {
    /// Returns a block satisfying `layout`, or `None` when exhausted.
    fn acquire(&mut self, layout: Layout) -> Option<NonNull<u8>>;

    /// Returns a block to the source.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by `acquire` on this source with the
    /// same `layout`, and must not be used afterwards.
    unsafe fn release(&mut self, block: NonNull<u8>, layout: Layout);
}

/// The process's global system allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPages;

impl PageSource for SystemPages {
    fn acquire(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: every layout built by `page_layout` has a non-zero size.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn release(&mut self, block: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded caller contract.
        unsafe { std::alloc::dealloc(block.as_ptr(), layout) }
    }
}

/// System pages with a ceiling on outstanding bytes.
///
/// Acquisitions that would push the outstanding total past the cap fail,
/// which the engine treats as backing-store exhaustion.
#[derive(Debug, Clone, Copy)]
pub struct CappedPages {
    cap_bytes: usize,
    in_use: usize,
}

impl CappedPages {
    #[must_use]
    pub const fn new(cap_bytes: usize) -> Self {
        Self {
            cap_bytes,
            in_use: 0,
        }
    }

    #[must_use]
    pub const fn in_use(&self) -> usize {
        self.in_use
    }
}

impl PageSource for CappedPages {
    fn acquire(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let next = self.in_use.checked_add(layout.size())?;
        if next > self.cap_bytes {
            return None;
        }
        let block = SystemPages.acquire(layout)?;
        self.in_use = next;
        Some(block)
    }

    unsafe fn release(&mut self, block: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded caller contract.
        unsafe { SystemPages.release(block, layout) };
        self.in_use -= layout.size();
    }
}

/// Layout of a block holding `header` bytes followed by `payload` bytes.
pub fn page_layout(header: usize, payload: usize) -> Result<Layout, PageError> {
    let total = header
        .checked_add(payload)
        .ok_or(PageError::LayoutOverflow { payload })?;
    Layout::from_size_align(total, ALIGNMENT).map_err(|_| PageError::LayoutOverflow { payload })
}

/// Page traffic between the engine and its source.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProviderStats {
    /// Blocks acquired since creation.
    pub acquired: u64,
    /// Blocks released since creation.
    pub released: u64,
    /// Bytes (headers included) currently held.
    pub bytes_outstanding: usize,
    /// High-water mark of `bytes_outstanding`.
    pub peak_bytes: usize,
}

impl ProviderStats {
    /// Blocks currently held.
    #[must_use]
    pub const fn outstanding(&self) -> u64 {
        self.acquired - self.released
    }
}

/// Acquires and releases headed blocks from a [`PageSource`].
pub struct PageProvider<S: PageSource> {
    source: S,
    stats: ProviderStats,
}

impl<S: PageSource> PageProvider<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            stats: ProviderStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> ProviderStats {
        self.stats
    }

    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }

    fn acquire_block(&mut self, header: usize, payload: usize) -> Result<NonNull<u8>, PageError> {
        let layout = page_layout(header, payload)?;
        let block = self.source.acquire(layout).ok_or(PageError::Exhausted {
            bytes: layout.size(),
        })?;
        self.stats.acquired += 1;
        self.stats.bytes_outstanding += layout.size();
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.bytes_outstanding);
        Ok(block)
    }

    /// # Safety
    ///
    /// `block` must have come from `acquire_block(header, payload)` on this
    /// provider and must not be used afterwards.
    unsafe fn release_block(&mut self, block: NonNull<u8>, header: usize, payload: usize) {
        // SAFETY: the same header/payload pair produced a valid layout when
        // the block was acquired.
        let layout = unsafe { Layout::from_size_align_unchecked(header + payload, ALIGNMENT) };
        // SAFETY: forwarded caller contract.
        unsafe { self.source.release(block, layout) };
        self.stats.released += 1;
        self.stats.bytes_outstanding -= layout.size();
    }

    /// Acquires a bucket page whose block is sized to `class`.
    pub fn acquire_bucket_page(&mut self, class: usize) -> Result<NonNull<BucketPage>, PageError> {
        let payload = size_class::class_size(class);
        let page = self
            .acquire_block(BUCKET_HEADER_SIZE, payload)?
            .cast::<BucketPage>();
        // SAFETY: the block is fresh, aligned and large enough for the header.
        unsafe {
            page.as_ptr().write(BucketPage {
                next: ptr::null_mut(),
                previous: ptr::null_mut(),
                tag: BlockTag::new(Tier::Bucket, class),
            });
        }
        Ok(page)
    }

    /// Releases a bucket page. No-op on null.
    ///
    /// # Safety
    ///
    /// `page` must be null or a bucket page from this provider that no list
    /// or caller still references.
    pub unsafe fn release_bucket_page(&mut self, page: *mut BucketPage) {
        let Some(page) = NonNull::new(page) else {
            return;
        };
        // SAFETY: page is live per the caller contract.
        let class = unsafe { (*page.as_ptr()).tag.class() };
        let payload = size_class::class_size(class);
        // SAFETY: the class recorded at acquisition fixes the payload size.
        unsafe { self.release_block(page.cast(), BUCKET_HEADER_SIZE, payload) };
    }

    /// Acquires a slab page with `payload` bytes behind the header.
    pub fn acquire_slab_page(&mut self, payload: usize) -> Result<NonNull<SlabPage>, PageError> {
        let page = self
            .acquire_block(SLAB_HEADER_SIZE, payload)?
            .cast::<SlabPage>();
        // SAFETY: the block is fresh, aligned and large enough for the header.
        unsafe {
            page.as_ptr().write(SlabPage {
                next: ptr::null_mut(),
                previous: ptr::null_mut(),
                cursor: 0,
                size: payload,
            });
        }
        Ok(page)
    }

    /// Releases a slab page. No-op on null.
    ///
    /// # Safety
    ///
    /// `page` must be null or a slab page from this provider whose blocks
    /// are no longer referenced.
    pub unsafe fn release_slab_page(&mut self, page: *mut SlabPage) {
        let Some(page) = NonNull::new(page) else {
            return;
        };
        // SAFETY: page is live per the caller contract.
        let payload = unsafe { (*page.as_ptr()).size };
        // SAFETY: the header records the payload size it was acquired with.
        unsafe { self.release_block(page.cast(), SLAB_HEADER_SIZE, payload) };
    }

    /// Acquires an oversize block with room for `size` payload bytes.
    pub fn acquire_large(&mut self, size: usize) -> Result<NonNull<LargeBlock>, PageError> {
        let block = self
            .acquire_block(LARGE_HEADER_SIZE, size)?
            .cast::<LargeBlock>();
        // SAFETY: the block is fresh, aligned and large enough for the header.
        unsafe {
            block.as_ptr().write(LargeBlock {
                next: ptr::null_mut(),
                previous: ptr::null_mut(),
                size,
                tag: BlockTag::new(Tier::Large, 0),
            });
        }
        Ok(block)
    }

    /// Releases an oversize block. No-op on null.
    ///
    /// # Safety
    ///
    /// `block` must be null or a large block from this provider that is no
    /// longer referenced.
    pub unsafe fn release_large(&mut self, block: *mut LargeBlock) {
        let Some(block) = NonNull::new(block) else {
            return;
        };
        // SAFETY: block is live per the caller contract.
        let size = unsafe { (*block.as_ptr()).size };
        // SAFETY: the header records the payload size it was acquired with.
        unsafe { self.release_block(block.cast(), LARGE_HEADER_SIZE, size) };
    }
}
