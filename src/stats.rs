use std::sync::atomic::{AtomicU64, Ordering};

/// Cache usage statistics, for diagnosing leaks and hit rates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats
{
    /// Live entries.
    pub entries: usize,

    /// Live observers. Equal to `entries` whenever the cache is consistent.
    pub observers: usize,

    /// Distinct objects watched by at least one observer.
    pub watched_objects: usize,

    /// Lookups that found an entry of the requested type.
    pub hits: u64,

    /// Lookups that found nothing, or an entry of another type.
    pub misses: u64,

    /// Entries created, replacements included.
    pub inserts: u64,

    /// Entries removed, for any reason.
    pub evictions: u64,

    /// Inserts refused for stale or expired keys.
    pub rejected: u64,
}

impl CacheStats
{
    pub fn lookups(&self) -> u64 { self.hits + self.misses }

    /// Fraction of lookups that hit, `None` before the first lookup.
    pub fn hit_ratio(&self) -> Option<f64>
    {
        match self.lookups() {
            0 => None,
            n => Some(self.hits as f64 / n as f64),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters
{
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    rejected: AtomicU64,
}

impl Counters
{
    pub(crate) fn hit(&self) { self.hits.fetch_add(1, Ordering::Relaxed); }
    pub(crate) fn miss(&self) { self.misses.fetch_add(1, Ordering::Relaxed); }
    pub(crate) fn insert(&self) { self.inserts.fetch_add(1, Ordering::Relaxed); }
    pub(crate) fn reject(&self) { self.rejected.fetch_add(1, Ordering::Relaxed); }
    pub(crate) fn evict(&self, n: usize) { self.evictions.fetch_add(n as u64, Ordering::Relaxed); }

    pub(crate) fn fill(&self, stats: &mut CacheStats)
    {
        stats.hits = self.hits.load(Ordering::Relaxed);
        stats.misses = self.misses.load(Ordering::Relaxed);
        stats.inserts = self.inserts.load(Ordering::Relaxed);
        stats.evictions = self.evictions.load(Ordering::Relaxed);
        stats.rejected = self.rejected.load(Ordering::Relaxed);
    }
}
