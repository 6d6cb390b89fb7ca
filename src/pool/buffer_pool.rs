use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Smallest tier, in bytes. Every request below it is served from this tier.
pub const MIN_TIER_SIZE: usize = 512;

/// Number of power-of-two tiers: 512 B up to 2 MiB.
pub const TIER_COUNT: usize = 13;

/// Requests above the largest tier are allocated exactly and never cached.
pub const MAX_TIER_SIZE: usize = MIN_TIER_SIZE << (TIER_COUNT - 1);

/// Statistics about pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers created because no cached buffer was available.
    pub allocated: usize,
    /// Requests satisfied from a free list.
    pub reused: usize,
    /// Buffers currently idle in the free lists.
    pub cached: usize,
    /// Buffers handed out and not yet returned.
    pub outstanding: usize,
}

struct Tier {
    size: usize,
    free: ArrayQueue<Vec<u8>>,
}

/// Size-tiered pool of fixed-capacity byte buffers.
///
/// Every tier keeps a bounded lock-free free list, so `allocate` and `free`
/// never block and can race freely between the parser and consumer threads.
/// A miss falls back to a fresh allocation; a full free list drops the
/// returned buffer. Neither case is an error.
pub struct BufferPool {
    tiers: Vec<Tier>,
    allocated: AtomicUsize,
    reused: AtomicUsize,
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// `max_cached_per_tier` bounds the idle buffers kept by each tier.
    pub fn new(max_cached_per_tier: usize) -> Self {
        assert!(max_cached_per_tier > 0, "a buffer pool needs room for at least one idle buffer per tier");
        let tiers = (0..TIER_COUNT)
            .map(|i| Tier {
                size: MIN_TIER_SIZE << i,
                free: ArrayQueue::new(max_cached_per_tier),
            })
            .collect();
        Self {
            tiers,
            allocated: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Capacity of the buffer `allocate(min_len)` would return.
    pub fn tier_size(&self, min_len: usize) -> usize {
        match Self::tier_index(min_len) {
            Some(i) => self.tiers[i].size,
            None => min_len,
        }
    }

    fn tier_index(min_len: usize) -> Option<usize> {
        if min_len <= MIN_TIER_SIZE {
            return Some(0);
        }
        if min_len > MAX_TIER_SIZE {
            return None;
        }
        let rounded = min_len.next_power_of_two();
        Some((rounded.trailing_zeros() - MIN_TIER_SIZE.trailing_zeros()) as usize)
    }

    /// Returns a buffer whose length is at least `min_len`. Contents are
    /// unspecified when the buffer is recycled.
    pub fn allocate(&self, min_len: usize) -> Vec<u8> {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        let Some(i) = Self::tier_index(min_len) else {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            return vec![0; min_len];
        };

        let tier = &self.tiers[i];
        if let Some(buffer) = tier.free.pop() {
            self.reused.fetch_add(1, Ordering::Relaxed);
            return buffer;
        }

        self.allocated.fetch_add(1, Ordering::Relaxed);
        vec![0; tier.size]
    }

    /// Returns `buffer` to the tier matching its length.
    pub fn free(&self, buffer: Vec<u8>) {
        let previous = self.outstanding.fetch_sub(1, Ordering::Relaxed);
        assert!(previous > 0, "buffer returned to a pool that has none outstanding");

        let len = buffer.len();
        if let Some(i) = Self::tier_index(len) {
            let tier = &self.tiers[i];
            if tier.size == len {
                // A full free list simply lets the buffer drop.
                let _ = tier.free.push(buffer);
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            cached: self.tiers.iter().map(|t| t.free.len()).sum(),
            outstanding: self.outstanding.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool").field("stats", &self.stats()).finish()
    }
}
