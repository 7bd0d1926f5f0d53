//! Optional counters for monitoring page traffic.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe page-allocation counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct Metrics {
    pages_allocated: AtomicU64,
    pages_reused: AtomicU64,
    pages_cached: AtomicU64,
    pages_freed: AtomicU64,
    external_allocations: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Pages obtained from the system allocator.
    pub pages_allocated: u64,
    /// Pages served from the free-page cache.
    pub pages_reused: u64,
    /// Pages returned into the cache.
    pub pages_cached: u64,
    /// Pages returned to the system allocator.
    pub pages_freed: u64,
    /// External blocks allocated for oversize elements.
    pub external_allocations: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn add_page_allocated(&self) {
        self.pages_allocated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_page_reused(&self) {
        self.pages_reused.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_page_cached(&self) {
        self.pages_cached.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_page_freed(&self) {
        self.pages_freed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_external_allocation(&self) {
        self.external_allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a relaxed snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pages_allocated: self.pages_allocated.load(Ordering::Relaxed),
            pages_reused: self.pages_reused.load(Ordering::Relaxed),
            pages_cached: self.pages_cached.load(Ordering::Relaxed),
            pages_freed: self.pages_freed.load(Ordering::Relaxed),
            external_allocations: self.external_allocations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_snapshot() {
        let m = Metrics::new();
        m.add_page_allocated();
        m.add_page_allocated();
        m.add_page_reused();
        let s = m.snapshot();
        assert_eq!(s.pages_allocated, 2);
        assert_eq!(s.pages_reused, 1);
        assert_eq!(s.pages_freed, 0);
    }
}
