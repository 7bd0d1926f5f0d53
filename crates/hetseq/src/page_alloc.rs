//! The paged allocator: fixed-size, highly aligned pages plus arbitrary
//! byte blocks, with progress-guarantee-parameterized allocation.
//!
//! A free-page cache (a lock-free MPMC array queue) front-ends the system
//! allocator so that page allocation is lock-free while the cache holds
//! pages. Only `Blocking` requests fall through to the system allocator;
//! `LockFree` and `WaitFree` requests report failure instead, which the
//! queue's `try_*` operations surface as an empty handle.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use crossbeam_queue::{ArrayQueue, SegQueue};
use once_cell::sync::Lazy;

use crate::metrics::{Metrics, MetricsSnapshot};

/// What a queue operation is allowed to do to make progress.
///
/// A `try_*` operation fails without observable effect if its guarantee
/// cannot be honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressGuarantee {
    /// May wait: spin, yield, call the system allocator.
    Blocking,
    /// May retry contended CAS operations, never waits on another thread's
    /// progress and never calls a blocking allocator.
    LockFree,
    /// Single bounded attempt; any contention is failure.
    WaitFree,
}

/// Contract for page suppliers used by the queue.
///
/// Pages are `PAGE_SIZE` bytes, aligned to `PAGE_ALIGNMENT`. The alignment
/// makes page membership of any interior address a mask operation.
///
/// Two queue-critical obligations beyond the obvious:
///
/// - **Zeroed pages.** `allocate_page` returns pages whose bytes read zero.
///   The queue's word protocol relies on it: a zero control word always
///   means "nothing here yet".
/// - **Pages stay mapped.** A page returned through `deallocate_page`
///   remains readable until the allocator itself is dropped (it may be
///   recycled, not unmapped). Consumers validate their page pins after the
///   fact; the validation is only sound if a stale pin touches memory that
///   is still mapped.
pub trait PagedAllocator: Send + Sync + 'static {
    /// Page size in bytes; a power of two.
    const PAGE_SIZE: usize;
    /// Page alignment; a power of two, at least `PAGE_SIZE`.
    const PAGE_ALIGNMENT: usize;

    /// Allocates one zeroed page. Returns `None` only when the guarantee
    /// cannot be honored; for `Blocking` that means the system is out of
    /// memory.
    fn allocate_page(&self, guarantee: ProgressGuarantee) -> Option<NonNull<u8>>;

    /// Returns a page. Never fails.
    ///
    /// # Safety
    ///
    /// `page` was returned by `allocate_page` of this allocator and is not
    /// referenced afterwards.
    unsafe fn deallocate_page(&self, page: NonNull<u8>);

    /// Allocates an external block for an oversize element. External blocks
    /// are blocking-only: any other guarantee returns `None`.
    fn allocate(&self, layout: Layout, guarantee: ProgressGuarantee) -> Option<NonNull<u8>>;

    /// Frees an external block.
    ///
    /// # Safety
    ///
    /// `ptr` was returned by `allocate` of this allocator with the same
    /// layout and is not referenced afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

// NonNull is not Send; page pointers handed through the cache are owned.
struct PagePtr(NonNull<u8>);

unsafe impl Send for PagePtr {}
unsafe impl Sync for PagePtr {}

struct PageCache {
    slots: ArrayQueue<PagePtr>,
    /// Pages beyond the fast cache's capacity. Unbounded so that no page is
    /// ever unmapped while the cache is alive (the stay-mapped contract).
    overflow: SegQueue<PagePtr>,
    metrics: Metrics,
}

impl PageCache {
    fn new(capacity: usize) -> Self {
        Self {
            slots: ArrayQueue::new(capacity),
            overflow: SegQueue::new(),
            metrics: Metrics::new(),
        }
    }

    fn pop(&self) -> Option<PagePtr> {
        self.slots.pop().or_else(|| self.overflow.pop())
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        while let Some(page) = self.pop() {
            self.metrics.add_page_freed();
            unsafe {
                alloc::dealloc(page.0.as_ptr(), PageAllocator::page_layout());
            }
        }
    }
}

static GLOBAL_CACHE: Lazy<Arc<PageCache>> =
    Lazy::new(|| Arc::new(PageCache::new(PageAllocator::DEFAULT_CACHE_CAPACITY)));

/// Default paged allocator: 64 KiB pages over the system allocator, with a
/// shared free-page cache.
///
/// `Default` instances share one process-wide cache;
/// [`with_cache_capacity`](PageAllocator::with_cache_capacity) creates an
/// allocator with a private cache (used by tests to observe reuse).
#[derive(Clone)]
pub struct PageAllocator {
    cache: Arc<PageCache>,
}

impl PageAllocator {
    const DEFAULT_CACHE_CAPACITY: usize = 32;

    /// Allocator with a private free-page cache of the given capacity.
    pub fn with_cache_capacity(capacity: usize) -> Self {
        Self {
            cache: Arc::new(PageCache::new(capacity.max(1))),
        }
    }

    /// Snapshot of the page-traffic counters of this allocator's cache.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.cache.metrics.snapshot()
    }

    const fn page_layout() -> Layout {
        match Layout::from_size_align(Self::PAGE_SIZE, Self::PAGE_ALIGNMENT) {
            Ok(l) => l,
            Err(_) => panic!("invalid page layout"),
        }
    }
}

impl Default for PageAllocator {
    fn default() -> Self {
        Self {
            cache: Arc::clone(&GLOBAL_CACHE),
        }
    }
}

impl PagedAllocator for PageAllocator {
    const PAGE_SIZE: usize = 64 * 1024;
    const PAGE_ALIGNMENT: usize = 64 * 1024;

    fn allocate_page(&self, guarantee: ProgressGuarantee) -> Option<NonNull<u8>> {
        if let Some(page) = self.cache.pop() {
            self.cache.metrics.add_page_reused();
            // Recycled pages carry stale words; restore the zeroed-page
            // contract before handing them out.
            unsafe {
                std::ptr::write_bytes(page.0.as_ptr(), 0, Self::PAGE_SIZE);
            }
            return Some(page.0);
        }
        match guarantee {
            ProgressGuarantee::Blocking => {
                // SAFETY: the layout has non-zero size.
                let raw = unsafe { alloc::alloc_zeroed(Self::page_layout()) };
                let page = NonNull::new(raw)?;
                self.cache.metrics.add_page_allocated();
                Some(page)
            }
            ProgressGuarantee::LockFree | ProgressGuarantee::WaitFree => None,
        }
    }

    unsafe fn deallocate_page(&self, page: NonNull<u8>) {
        // Stay-mapped contract: never return a page to the system while the
        // cache is alive; the overflow list is unbounded.
        match self.cache.slots.push(PagePtr(page)) {
            Ok(()) => self.cache.metrics.add_page_cached(),
            Err(page) => {
                self.cache.overflow.push(page);
                self.cache.metrics.add_page_cached();
            }
        }
    }

    fn allocate(&self, layout: Layout, guarantee: ProgressGuarantee) -> Option<NonNull<u8>> {
        if guarantee != ProgressGuarantee::Blocking {
            return None;
        }
        self.cache.metrics.add_external_allocation();
        // SAFETY: callers never request zero-size external blocks.
        let raw = unsafe { alloc::alloc(layout) };
        NonNull::new(raw)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        alloc::dealloc(ptr.as_ptr(), layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_is_aligned() {
        let a = PageAllocator::with_cache_capacity(4);
        let page = a.allocate_page(ProgressGuarantee::Blocking).unwrap();
        assert_eq!(page.as_ptr() as usize % PageAllocator::PAGE_ALIGNMENT, 0);
        unsafe { a.deallocate_page(page) };
    }

    #[test]
    fn test_cache_reuse() {
        let a = PageAllocator::with_cache_capacity(4);
        let page = a.allocate_page(ProgressGuarantee::Blocking).unwrap();
        unsafe { a.deallocate_page(page) };
        let again = a.allocate_page(ProgressGuarantee::Blocking).unwrap();
        assert_eq!(page, again);
        let m = a.metrics();
        assert_eq!(m.pages_allocated, 1);
        assert_eq!(m.pages_reused, 1);
        unsafe { a.deallocate_page(again) };
    }

    #[test]
    fn test_lock_free_allocation_needs_cache() {
        let a = PageAllocator::with_cache_capacity(4);
        // Empty cache: lock-free and wait-free requests must fail.
        assert!(a.allocate_page(ProgressGuarantee::LockFree).is_none());
        assert!(a.allocate_page(ProgressGuarantee::WaitFree).is_none());

        let page = a.allocate_page(ProgressGuarantee::Blocking).unwrap();
        unsafe { a.deallocate_page(page) };
        // Cached page: lock-free allocation now succeeds.
        let reused = a.allocate_page(ProgressGuarantee::LockFree).unwrap();
        unsafe { a.deallocate_page(reused) };
    }

    #[test]
    fn test_external_blocks_are_blocking_only() {
        let a = PageAllocator::with_cache_capacity(4);
        let layout = Layout::from_size_align(1 << 20, 64).unwrap();
        assert!(a.allocate(layout, ProgressGuarantee::LockFree).is_none());
        assert!(a.allocate(layout, ProgressGuarantee::WaitFree).is_none());
        let block = a.allocate(layout, ProgressGuarantee::Blocking).unwrap();
        unsafe { a.deallocate(block, layout) };
    }
}
