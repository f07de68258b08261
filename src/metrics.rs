//! Running counters exposed read-only via `Environment::get_metrics()`.
//! A snapshot struct returned by value, not a live handle, so a caller
//! can never observe one counter mid-update while reading another.

use crate::page_manager::PageManager;

#[derive(Debug, Default, Clone, Copy)]
pub struct Metrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub pages_allocated: u64,
    pub pages_flushed: u64,
    pub last_lsn: u64,
}

impl Metrics {
    /// `last_lsn` is threaded in rather than read off `Log` directly since
    /// an in-memory or recovery-disabled environment never builds one.
    pub(crate) fn snapshot(pm: &PageManager, last_lsn: u64) -> Self {
        Self {
            cache_hits: pm.cache().hits(),
            cache_misses: pm.cache().misses(),
            pages_allocated: pm.pages_allocated(),
            pages_flushed: pm.pages_flushed(),
            last_lsn,
        }
    }
}
