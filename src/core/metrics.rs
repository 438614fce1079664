use std::sync::atomic::{AtomicU64, Ordering};

/// Counters collected by the page file and the tree.
/// All fields use atomic types for lock-free updates with minimal overhead.
#[derive(Debug, Default)]
pub struct Metrics {
    // Page cache
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    // Allocation
    pages_allocated: AtomicU64,
    pages_reused: AtomicU64,
    pages_freed: AtomicU64,

    // Write-back
    flushes: AtomicU64,
    pages_flushed: AtomicU64,
    flush_errors: AtomicU64,

    // Tree
    node_splits: AtomicU64,
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_total_requests: u64,
    pub cache_hit_rate: f64,

    pub pages_allocated: u64,
    pub pages_reused: u64,
    pub pages_freed: u64,

    pub flushes: u64,
    pub pages_flushed: u64,
    pub flush_errors: u64,

    pub node_splits: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn page_allocated(&self) {
        self.pages_allocated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn page_reused(&self) {
        self.pages_reused.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn pages_freed(&self, count: u64) {
        self.pages_freed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn flush_completed(&self, pages: u64, errors: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.pages_flushed.fetch_add(pages, Ordering::Relaxed);
        self.flush_errors.fetch_add(errors, Ordering::Relaxed);
    }

    #[inline]
    pub fn node_split(&self) {
        self.node_splits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);
        let cache_total_requests = cache_hits + cache_misses;
        let cache_hit_rate = if cache_total_requests > 0 {
            cache_hits as f64 / cache_total_requests as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            cache_hits,
            cache_misses,
            cache_total_requests,
            cache_hit_rate,
            pages_allocated: self.pages_allocated.load(Ordering::Relaxed),
            pages_reused: self.pages_reused.load(Ordering::Relaxed),
            pages_freed: self.pages_freed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            pages_flushed: self.pages_flushed.load(Ordering::Relaxed),
            flush_errors: self.flush_errors.load(Ordering::Relaxed),
            node_splits: self.node_splits.load(Ordering::Relaxed),
        }
    }
}
