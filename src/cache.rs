//! Non-intrusive LRU-by-list + bucketed hash table cache of [`Page`]s.
//!
//! Two structures back every lookup: a bucketed hash keyed by
//! `address % BUCKET_PRIME` and a doubly linked LRU chain over every
//! cached page, threaded through side tables rather than through the
//! page itself. `get` re-inserts the hit at the LRU head; `purge` walks
//! from the tail.

use std::collections::HashMap;

use log::{debug, trace, warn};

use crate::page::{Page, PageId};

/// A prime keeps bucket distribution reasonable for sequential page
/// addresses.
const BUCKET_PRIME: u64 = 10317;

#[derive(Default, Clone, Copy, Debug)]
struct LruLink {
    prev: Option<PageId>,
    next: Option<PageId>,
}

pub struct Cache {
    capacity_bytes: u64,
    page_size: u64,
    pages: HashMap<PageId, Page>,
    buckets: Vec<Vec<PageId>>,
    lru: HashMap<PageId, LruLink>,
    lru_head: Option<PageId>,
    lru_tail: Option<PageId>,
    hits: u64,
    misses: u64,
}

impl Cache {
    pub fn new(capacity_bytes: u64, page_size: u32) -> Self {
        Self {
            capacity_bytes,
            page_size: page_size as u64,
            pages: HashMap::new(),
            buckets: vec![Vec::new(); BUCKET_PRIME as usize],
            lru: HashMap::new(),
            lru_head: None,
            lru_tail: None,
            hits: 0,
            misses: 0,
        }
    }

    fn bucket_index(address: PageId) -> usize {
        (address % BUCKET_PRIME) as usize
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// `allocated_elements * page_size > capacity_bytes`. Pages
    /// that aren't malloc-backed (mmap'd) don't count toward the bound.
    pub fn is_full(&self) -> bool {
        let malloc_backed = self.pages.values().filter(|p| p.is_malloc_backed()).count() as u64;
        malloc_backed * self.page_size > self.capacity_bytes
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Lookup by address; re-inserts the hit at the LRU head. A miss is
    /// not an error.
    pub fn get(&mut self, address: PageId) -> Option<&Page> {
        if self.pages.contains_key(&address) {
            self.hits += 1;
            self.lru_touch(address);
            self.pages.get(&address)
        } else {
            self.misses += 1;
            None
        }
    }

    pub fn get_mut(&mut self, address: PageId) -> Option<&mut Page> {
        if self.pages.contains_key(&address) {
            self.hits += 1;
            self.lru_touch(address);
            self.pages.get_mut(&address)
        } else {
            self.misses += 1;
            None
        }
    }

    pub fn contains(&self, address: PageId) -> bool {
        self.pages.contains_key(&address)
    }

    /// Idempotent: removing then reinserting guarantees LRU head position
    /// and bucket uniqueness.
    pub fn put_page(&mut self, page: Page) {
        let address = page.address();
        if self.pages.contains_key(&address) {
            self.lru_unlink(address);
        } else {
            let idx = Self::bucket_index(address);
            if !self.buckets[idx].contains(&address) {
                self.buckets[idx].push(address);
            }
        }
        self.pages.insert(address, page);
        self.lru_push_head(address);
        trace!("cache: put_page address={}", address);
    }

    pub fn remove(&mut self, address: PageId) -> Option<Page> {
        if self.pages.contains_key(&address) {
            self.lru_unlink(address);
            let idx = Self::bucket_index(address);
            self.buckets[idx].retain(|a| *a != address);
        }
        self.pages.remove(&address)
    }

    fn lru_touch(&mut self, address: PageId) {
        self.lru_unlink(address);
        self.lru_push_head(address);
    }

    fn lru_push_head(&mut self, address: PageId) {
        let old_head = self.lru_head;
        self.lru.insert(
            address,
            LruLink {
                prev: None,
                next: old_head,
            },
        );
        if let Some(h) = old_head {
            if let Some(link) = self.lru.get_mut(&h) {
                link.prev = Some(address);
            }
        }
        self.lru_head = Some(address);
        if self.lru_tail.is_none() {
            self.lru_tail = Some(address);
        }
    }

    fn lru_unlink(&mut self, address: PageId) {
        let Some(link) = self.lru.remove(&address) else {
            return;
        };
        match link.prev {
            Some(p) => {
                if let Some(pl) = self.lru.get_mut(&p) {
                    pl.next = link.next;
                }
            }
            None => self.lru_head = link.next,
        }
        match link.next {
            Some(n) => {
                if let Some(nl) = self.lru.get_mut(&n) {
                    nl.prev = link.prev;
                }
            }
            None => self.lru_tail = link.prev,
        }
    }

    /// Walk the LRU from the tail (oldest), invoking `evict` for up to
    /// `limit` victims that are malloc-backed and for which
    /// `in_changeset` returns false. Stops if it wraps back to the head
    /// without finding a victim.
    pub fn purge<InChangeset, Evict>(
        &mut self,
        limit: usize,
        in_changeset: InChangeset,
        mut evict: Evict,
    ) -> usize
    where
        InChangeset: Fn(PageId) -> bool,
        Evict: FnMut(&Page),
    {
        let mut evicted = 0;
        let mut cursor = self.lru_tail;
        let mut visited = 0;
        let total = self.pages.len();
        while let Some(address) = cursor {
            if evicted >= limit || visited > total {
                break;
            }
            visited += 1;
            let prev = self.lru.get(&address).and_then(|l| l.prev);
            let page = self.pages.get(&address);
            let victim = page
                .map(|p| p.is_malloc_backed() && !p.is_delete_pending())
                .unwrap_or(false)
                && !in_changeset(address);
            if victim {
                if let Some(p) = self.pages.get(&address) {
                    evict(p);
                }
                self.remove(address);
                evicted += 1;
                debug!("cache: purged page address={}", address);
            }
            cursor = prev;
        }
        if evicted < limit {
            warn!(
                "cache: purge requested {} victims, found only {}",
                limit, evicted
            );
        }
        evicted
    }

    /// Every address currently holding a dirty page, in no particular
    /// order.
    pub fn dirty_addresses(&self) -> Vec<PageId> {
        self.pages
            .values()
            .filter(|p| p.is_dirty())
            .map(|p| p.address())
            .collect()
    }

    /// In-order walk (LRU head to tail); if `cb` returns true the page is
    /// removed from all lists and dropped.
    pub fn visit<F: FnMut(&Page) -> bool>(&mut self, mut cb: F) {
        let mut cursor = self.lru_head;
        let mut to_remove = Vec::new();
        while let Some(address) = cursor {
            let next = self.lru.get(&address).and_then(|l| l.next);
            if let Some(page) = self.pages.get(&address) {
                if cb(page) {
                    to_remove.push(address);
                }
            }
            cursor = next;
        }
        for address in to_remove {
            self.remove(address);
        }
    }

    /// Debug predicate: bucket membership must agree with LRU membership
    /// for every cached page.
    #[cfg(debug_assertions)]
    pub fn check_integrity(&self) {
        for address in self.pages.keys() {
            let idx = Self::bucket_index(*address);
            assert!(
                self.buckets[idx].contains(address),
                "page {} missing from its bucket",
                address
            );
            assert!(
                self.lru.contains_key(address),
                "page {} missing from LRU chain",
                address
            );
        }
    }
}
