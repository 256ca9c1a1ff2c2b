//! Batched ID Allocation
//!
//! Hands out unique `u64` IDs with one atomic fetch-add per *batch* rather
//! than per ID. Each thread keeps a private range carved off a shared
//! counter and serves IDs from it locally, so ID-heavy paths (every fiber
//! creation takes one) stay off the shared cache line almost always.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counter from which threads carve private ranges.
pub struct IdAllocator {
    next: AtomicU64,
    batch: u64,
}

impl IdAllocator {
    /// Create an allocator starting at `start`, handing out ranges of
    /// `batch` IDs at a time.
    pub const fn new(start: u64, batch: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
            batch,
        }
    }

    fn alloc_range(&self) -> (u64, u64) {
        let start = self.next.fetch_add(self.batch, Ordering::Relaxed);
        (start, start + self.batch)
    }
}

/// Per-thread cache of a previously carved range. Embed one in a
/// `thread_local!` next to the shared [`IdAllocator`].
pub struct IdCache {
    current: u64,
    limit: u64,
}

impl IdCache {
    /// An empty cache; the first call to [`next`](Self::next) refills it.
    pub const fn new() -> Self {
        Self { current: 0, limit: 0 }
    }

    /// Take the next ID, refilling from `allocator` when the local range is
    /// exhausted.
    pub fn next(&mut self, allocator: &IdAllocator) -> u64 {
        if self.current == self.limit {
            let (start, limit) = allocator.alloc_range();
            self.current = start;
            self.limit = limit;
        }
        let id = self.current;
        self.current += 1;
        id
    }
}

impl Default for IdCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sequential_within_batch() {
        let alloc = IdAllocator::new(1, 16);
        let mut cache = IdCache::new();
        let ids: Vec<u64> = (0..16).map(|_| cache.next(&alloc)).collect();
        assert_eq!(ids, (1..=16).collect::<Vec<u64>>());
    }

    #[test]
    fn test_refill_crosses_batches() {
        let alloc = IdAllocator::new(0, 4);
        let mut cache = IdCache::new();
        let ids: Vec<u64> = (0..10).map(|_| cache.next(&alloc)).collect();
        // Single thread, so batches are taken in order.
        assert_eq!(ids, (0..10).collect::<Vec<u64>>());
    }

    #[test]
    fn test_unique_across_threads() {
        let alloc = Arc::new(IdAllocator::new(1, 8));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let alloc = Arc::clone(&alloc);
            handles.push(thread::spawn(move || {
                let mut cache = IdCache::new();
                (0..1000).map(|_| cache.next(&alloc)).collect::<Vec<u64>>()
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
