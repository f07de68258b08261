//! Lightweight operational counters for one index. Nothing here
//! feeds back into tree shape decisions; it's purely `get_parameters`/
//! `get_metrics` observability, the same plain-counter style the cache
//! and page manager use for their own counts.

#[derive(Debug, Default, Clone, Copy)]
pub struct BtreeStatistics {
    pub finds: u64,
    pub inserts: u64,
    pub erases: u64,
    pub splits: u64,
}

impl BtreeStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_find(&mut self) {
        self.finds += 1;
    }

    pub fn record_insert(&mut self) {
        self.inserts += 1;
    }

    pub fn record_erase(&mut self) {
        self.erases += 1;
    }

    pub fn record_split(&mut self) {
        self.splits += 1;
    }
}
