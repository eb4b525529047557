//! Live performance counters (§4.2's `getStats`, §6.4's per-second/
//! per-minute summaries). Plain atomics snapshotted on demand rather
//! than a timer-driven push, since there is no host event loop here
//! (§1 Non-goals).

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Counters {
    puts: AtomicU64,
    gets: AtomicU64,
    deletes: AtomicU64,
    heads: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

/// A point-in-time snapshot of the Store's running totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub puts: u64,
    pub gets: u64,
    pub deletes: u64,
    pub heads: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_size: usize,
    pub queue_depth: usize,
}

impl Counters {
    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_head(&self) {
        self.heads.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, cache_size: usize, queue_depth: usize) -> Stats {
        Stats {
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            heads: self.heads.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_size,
            queue_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let c = Counters::default();
        c.record_put();
        c.record_put();
        c.record_get();
        let s = c.snapshot(0, 0);
        assert_eq!(s.puts, 2);
        assert_eq!(s.gets, 1);
    }
}
