//! Bucket tier (257..=327684 bytes).
//!
//! One bucket per size class. Each bucket page backs exactly one block of the
//! class size. A bucket keeps two doubly-linked page lists:
//! - `used`: pages whose block is live in caller hands;
//! - `free`: pages ready to be handed out again.
//!
//! Every page acquired by a bucket is on exactly one of the two lists until
//! `release_all`. Buckets never give pages back before shutdown.

use std::ptr::{self, NonNull};

use serde::Serialize;

use super::page::{BucketPage, PageProvider, PageSource};
use super::size_class::{self, NUM_SIZE_CLASSES};
use crate::config::PrewarmPolicy;
use crate::error::PageError;

/// How a bucket allocation was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketPath {
    FreeList,
    FreshPage,
}

/// A block handed out by the bucket tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketGrant {
    pub payload: NonNull<u8>,
    pub class: usize,
    pub path: BucketPath,
}

/// Read-only view of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketView {
    pub class: usize,
    /// Block size of every page in this bucket.
    pub page_size: usize,
    /// Pages ever acquired by this bucket.
    pub count: usize,
    pub free_pages: usize,
    pub used_pages: usize,
}

struct Bucket {
    count: usize,
    page_size: usize,
    free: *mut BucketPage,
    used: *mut BucketPage,
}

impl Bucket {
    fn new(class: usize) -> Self {
        Self {
            count: 0,
            page_size: size_class::class_size(class),
            free: ptr::null_mut(),
            used: ptr::null_mut(),
        }
    }
}

/// Links `page` at the front of the list starting at `head`.
///
/// # Safety
///
/// `page` must be live and on no list; `head` must be a valid list.
unsafe fn push_front(head: &mut *mut BucketPage, page: NonNull<BucketPage>) {
    let page = page.as_ptr();
    let old = *head;
    // SAFETY: see function contract.
    unsafe {
        (*page).previous = ptr::null_mut();
        (*page).next = old;
        if let Some(old) = old.as_mut() {
            old.previous = page;
        }
    }
    *head = page;
}

/// Removes `page` from the list starting at `head`.
///
/// # Safety
///
/// `page` must be a member of the list starting at `head`.
unsafe fn unlink(head: &mut *mut BucketPage, page: NonNull<BucketPage>) {
    let page = page.as_ptr();
    // SAFETY: see function contract; neighbours are members of the same list.
    unsafe {
        let next = (*page).next;
        let previous = (*page).previous;
        match previous.as_mut() {
            Some(previous) => previous.next = next,
            None => *head = next,
        }
        if let Some(next) = next.as_mut() {
            next.previous = previous;
        }
        (*page).next = ptr::null_mut();
        (*page).previous = ptr::null_mut();
    }
}

/// Pops the first page of the list starting at `head`.
///
/// # Safety
///
/// `head` must be a valid list.
unsafe fn pop_front(head: &mut *mut BucketPage) -> Option<NonNull<BucketPage>> {
    let page = NonNull::new(*head)?;
    // SAFETY: `page` is the head of a valid list.
    unsafe { unlink(head, page) };
    Some(page)
}

fn list_len(mut page: *mut BucketPage) -> usize {
    let mut len = 0;
    // SAFETY: bucket lists only contain live pages.
    while let Some(header) = unsafe { page.as_ref() } {
        len += 1;
        page = header.next;
    }
    len
}

/// Segregated free-list allocator, one bucket per size class.
pub struct BucketAllocator {
    buckets: [Bucket; NUM_SIZE_CLASSES],
}

impl BucketAllocator {
    /// Creates empty buckets for every size class.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(Bucket::new),
        }
    }

    /// Fills every bucket's free list according to `policy`.
    pub fn prewarm<S: PageSource>(
        &mut self,
        provider: &mut PageProvider<S>,
        policy: PrewarmPolicy,
    ) -> Result<(), PageError> {
        for (class, bucket) in self.buckets.iter_mut().enumerate() {
            for _ in 0..policy.pages_for(class) {
                let page = provider.acquire_bucket_page(class)?;
                bucket.count += 1;
                // SAFETY: fresh page, on no list yet.
                unsafe { push_front(&mut bucket.free, page) };
            }
        }
        Ok(())
    }

    /// Allocates a block for `size` bytes.
    ///
    /// Returns `Ok(None)` when `size` is above the largest class; those
    /// requests belong to the oversize tier.
    pub fn allocate<S: PageSource>(
        &mut self,
        provider: &mut PageProvider<S>,
        size: usize,
    ) -> Result<Option<BucketGrant>, PageError> {
        let Some(class) = size_class::class_of(size) else {
            return Ok(None);
        };
        let bucket = &mut self.buckets[class];

        // SAFETY: the free list only holds pages owned by this bucket.
        let (page, path) = match unsafe { pop_front(&mut bucket.free) } {
            Some(page) => (page, BucketPath::FreeList),
            None => {
                let page = provider.acquire_bucket_page(class)?;
                bucket.count += 1;
                (page, BucketPath::FreshPage)
            }
        };
        // SAFETY: `page` is live and was just taken off every list.
        unsafe { push_front(&mut bucket.used, page) };

        Ok(Some(BucketGrant {
            // SAFETY: `page` is a live bucket page.
            payload: unsafe { BucketPage::payload(page) },
            class,
            path,
        }))
    }

    /// Moves the page owning `payload` from its bucket's used list to the
    /// front of its free list. Returns the page's class.
    ///
    /// # Safety
    ///
    /// `payload` must be a live block from this tier; the caller must not
    /// use it afterwards.
    pub unsafe fn free(&mut self, payload: NonNull<u8>) -> usize {
        // SAFETY: bucket payloads sit a fixed header distance past their page.
        let page = unsafe { BucketPage::from_payload(payload) };
        // SAFETY: the page header is live.
        let class = unsafe { (*page.as_ptr()).tag.class() };
        debug_assert!(class < NUM_SIZE_CLASSES);
        let bucket = &mut self.buckets[class];
        // SAFETY: a live block's page is on its bucket's used list.
        unsafe {
            unlink(&mut bucket.used, page);
            push_front(&mut bucket.free, page);
        }
        class
    }

    /// Snapshot of the bucket for `class`.
    #[must_use]
    pub fn view(&self, class: usize) -> Option<BucketView> {
        let bucket = self.buckets.get(class)?;
        Some(BucketView {
            class,
            page_size: bucket.page_size,
            count: bucket.count,
            free_pages: list_len(bucket.free),
            used_pages: list_len(bucket.used),
        })
    }

    /// Payload of the page at the head of `class`'s free list.
    #[must_use]
    pub fn free_head(&self, class: usize) -> Option<NonNull<u8>> {
        let page = NonNull::new(self.buckets.get(class)?.free)?;
        // SAFETY: free-list pages are live.
        Some(unsafe { BucketPage::payload(page) })
    }

    /// Pages ever acquired, summed over all buckets.
    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.count).sum()
    }

    /// Pages currently on free lists, summed over all buckets.
    #[must_use]
    pub fn total_free_pages(&self) -> usize {
        self.buckets.iter().map(|bucket| list_len(bucket.free)).sum()
    }

    /// Returns every page of every bucket (used and free) to the provider.
    ///
    /// # Safety
    ///
    /// No block from this tier may be used afterwards.
    pub unsafe fn release_all<S: PageSource>(&mut self, provider: &mut PageProvider<S>) {
        for bucket in &mut self.buckets {
            for head in [&mut bucket.used, &mut bucket.free] {
                let mut page = *head;
                while let Some(current) = NonNull::new(page) {
                    // SAFETY: read the link before the page is released.
                    page = unsafe { (*current.as_ptr()).next };
                    // SAFETY: every listed page came from this provider.
                    unsafe { provider.release_bucket_page(current.as_ptr()) };
                }
                *head = ptr::null_mut();
            }
            bucket.count = 0;
        }
    }
}

impl Default for BucketAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::malloc::page::{BUCKET_HEADER_SIZE, BlockTag, SystemPages, Tier};

    fn tier() -> (PageProvider<SystemPages>, BucketAllocator) {
        (PageProvider::new(SystemPages), BucketAllocator::new())
    }

    #[test]
    fn buckets_take_class_sizes() {
        let buckets = BucketAllocator::new();
        for class in 0..NUM_SIZE_CLASSES {
            let view = buckets.view(class).unwrap();
            assert_eq!(view.page_size, size_class::class_size(class));
            assert_eq!(view.count, 0);
        }
        assert!(buckets.view(NUM_SIZE_CLASSES).is_none());
    }

    #[test]
    fn scaled_prewarm_fills_free_lists() {
        let (mut provider, mut buckets) = tier();
        buckets.prewarm(&mut provider, PrewarmPolicy::Scaled).unwrap();
        for class in 0..NUM_SIZE_CLASSES {
            let view = buckets.view(class).unwrap();
            assert_eq!(view.count, 1 + class / 14);
            assert_eq!(view.free_pages, view.count);
            assert_eq!(view.used_pages, 0);
        }
        assert_eq!(provider.stats().outstanding() as usize, buckets.total_pages());
        unsafe { buckets.release_all(&mut provider) };
        assert_eq!(provider.stats().outstanding(), 0);
    }

    #[test]
    fn fresh_page_goes_on_used_list() {
        let (mut provider, mut buckets) = tier();
        let grant = buckets.allocate(&mut provider, 300).unwrap().unwrap();
        assert_eq!(grant.class, 14);
        assert_eq!(grant.path, BucketPath::FreshPage);
        let tag = unsafe { BlockTag::read(grant.payload) };
        assert_eq!(tag.tier(), Some(Tier::Bucket));
        assert_eq!(tag.class(), 14);
        let page = unsafe { BucketPage::from_payload(grant.payload) };
        assert_eq!(
            grant.payload.as_ptr() as usize - page.as_ptr() as usize,
            BUCKET_HEADER_SIZE
        );

        let view = buckets.view(14).unwrap();
        assert_eq!((view.count, view.used_pages, view.free_pages), (1, 1, 0));
        unsafe { buckets.release_all(&mut provider) };
    }

    #[test]
    fn free_then_allocate_reuses_page() {
        let (mut provider, mut buckets) = tier();
        let a = buckets.allocate(&mut provider, 1024).unwrap().unwrap();
        let b = buckets.allocate(&mut provider, 1000).unwrap().unwrap();
        assert_eq!(a.class, b.class);
        assert_eq!(unsafe { buckets.free(a.payload) }, a.class);
        assert_eq!(buckets.free_head(a.class), Some(a.payload));

        let acquired = provider.stats().acquired;
        let c = buckets.allocate(&mut provider, 900).unwrap().unwrap();
        assert_eq!(c.payload, a.payload);
        assert_eq!(c.path, BucketPath::FreeList);
        assert_eq!(provider.stats().acquired, acquired);

        let view = buckets.view(a.class).unwrap();
        assert_eq!((view.count, view.used_pages, view.free_pages), (2, 2, 0));
        unsafe { buckets.release_all(&mut provider) };
    }

    #[test]
    fn pages_stay_on_exactly_one_list() {
        let (mut provider, mut buckets) = tier();
        let grants: Vec<_> = (0..5)
            .map(|_| buckets.allocate(&mut provider, 5000).unwrap().unwrap())
            .collect();
        let class = grants[0].class;
        // free from the middle of the used list, then the ends
        for index in [2, 0, 4] {
            unsafe { buckets.free(grants[index].payload) };
            let view = buckets.view(class).unwrap();
            assert_eq!(view.used_pages + view.free_pages, view.count);
        }
        let view = buckets.view(class).unwrap();
        assert_eq!((view.used_pages, view.free_pages), (2, 3));
        unsafe { buckets.release_all(&mut provider) };
        assert_eq!(provider.stats().outstanding(), 0);
    }

    #[test]
    fn largest_class_is_serviced() {
        let (mut provider, mut buckets) = tier();
        let grant = buckets
            .allocate(&mut provider, size_class::MAX_CLASS_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(grant.class, NUM_SIZE_CLASSES - 1);
        assert!(
            buckets
                .allocate(&mut provider, size_class::MAX_CLASS_SIZE + 1)
                .unwrap()
                .is_none()
        );
        unsafe { buckets.release_all(&mut provider) };
    }

    #[test]
    fn release_all_covers_used_and_free_pages() {
        let (mut provider, mut buckets) = tier();
        buckets.prewarm(&mut provider, PrewarmPolicy::Minimal).unwrap();
        let live = buckets.allocate(&mut provider, 2048).unwrap().unwrap();
        let extra = buckets.allocate(&mut provider, 2048).unwrap().unwrap();
        unsafe { buckets.free(extra.payload) };
        let _ = live;
        assert_eq!(provider.stats().outstanding(), NUM_SIZE_CLASSES as u64 + 1);
        unsafe { buckets.release_all(&mut provider) };
        assert_eq!(provider.stats().outstanding(), 0);
        assert_eq!(buckets.total_pages(), 0);
        assert_eq!(buckets.total_free_pages(), 0);
    }
}
