//! Composes [`Cache`], [`Freelist`] and [`Device`] into the single entry
//! point higher layers use to get at page bytes.

use log::{debug, warn};

use crate::cache::Cache;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::freelist::Freelist;
use crate::page::{Page, PageId, PageType};

pub struct PageManager {
    device: Box<dyn Device>,
    cache: Cache,
    freelist: Freelist,
    page_size: u32,
    /// "strict cache" policy: fail the call with `CacheFull` rather than
    /// silently exceeding the capacity bound when nothing is reclaimable.
    strict_cache: bool,
    pages_allocated: u64,
    pages_flushed: u64,
}

impl PageManager {
    pub fn new(
        device: Box<dyn Device>,
        cache_capacity_bytes: u64,
        chunk_size: u64,
        strict_cache: bool,
    ) -> Self {
        let page_size = device.pagesize();
        Self {
            device,
            cache: Cache::new(cache_capacity_bytes, page_size),
            freelist: Freelist::new(chunk_size),
            page_size,
            strict_cache,
            pages_allocated: 0,
            pages_flushed: 0,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn device(&self) -> &dyn Device {
        self.device.as_ref()
    }

    pub fn device_mut(&mut self) -> &mut dyn Device {
        self.device.as_mut()
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn freelist(&self) -> &Freelist {
        &self.freelist
    }

    pub fn freelist_mut(&mut self) -> &mut Freelist {
        &mut self.freelist
    }

    pub fn pages_allocated(&self) -> u64 {
        self.pages_allocated
    }

    pub fn pages_flushed(&self) -> u64 {
        self.pages_flushed
    }

    /// Lookup in cache; on a miss (and unless `only_from_cache`), read
    /// from the device and insert into the cache.
    pub fn fetch_page(&mut self, address: PageId, only_from_cache: bool) -> Result<Option<&Page>> {
        if self.cache.contains(address) {
            return Ok(self.cache.get(address));
        }
        if only_from_cache {
            return Ok(None);
        }
        let mut page = Page::new_empty(self.page_size);
        page.bind(address);
        self.device.read_page(address, page.raw_mut())?;
        self.cache.put_page(page);
        debug!("page_manager: fetched page {} from device", address);
        Ok(self.cache.get(address))
    }

    pub fn fetch_page_mut(
        &mut self,
        address: PageId,
        only_from_cache: bool,
    ) -> Result<Option<&mut Page>> {
        if !self.cache.contains(address) {
            if only_from_cache {
                return Ok(None);
            }
            let mut page = Page::new_empty(self.page_size);
            page.bind(address);
            self.device.read_page(address, page.raw_mut())?;
            self.cache.put_page(page);
            debug!("page_manager: fetched page {} from device", address);
        }
        Ok(self.cache.get_mut(address))
    }

    /// Allocate a fresh page. Tries the freelist first unless
    /// `ignore_freelist`; otherwise extends the device. Fresh pages are
    /// always dirty and carry `ty` in their persistent type tag.
    pub fn alloc_page(
        &mut self,
        db: u16,
        ty: PageType,
        ignore_freelist: bool,
        clear_with_zero: bool,
    ) -> Result<PageId> {
        let address = if !ignore_freelist {
            self.freelist.alloc_page(self.page_size)
        } else {
            None
        };
        let address = match address {
            Some(a) => a,
            None => self.device.alloc_page(self.page_size)?,
        };

        // `Page::new_empty` always zero-fills; `clear_with_zero` has no
        // extra work to do here since there is no uninitialized-malloc
        // fast path.
        let _ = clear_with_zero;
        let mut page = Page::new_empty(self.page_size);
        page.bind(address);
        page.set_db(db);
        page.set_persistent_type(ty);
        page.mark_dirty();
        self.cache.put_page(page);
        self.pages_allocated += 1;
        debug!("page_manager: allocated page {} type={:?}", address, ty);
        Ok(address)
    }

    /// Delegates to the freelist; returns `(address, from_freelist)`.
    pub fn alloc_blob_area(&mut self, size: u64) -> Option<u64> {
        self.freelist.alloc_area(size)
    }

    pub fn free_area(&mut self, address: u64, size: u64, overwrite: bool) {
        self.freelist.mark_free(address, size, overwrite);
    }

    /// Evict an address from the cache without touching the freelist.
    /// Used before returning a page's bytes to the freelist so a stale
    /// cached copy never shadows the freed (and possibly reused) range.
    pub fn cache_remove(&mut self, address: PageId) {
        self.cache.remove(address);
    }

    pub fn flush_page(&mut self, address: PageId) -> Result<()> {
        let Some(page) = self.cache.get_mut(address) else {
            return Ok(());
        };
        if page.is_dirty() {
            self.device.write_page(address, page.raw())?;
            page.clear_dirty();
            self.pages_flushed += 1;
        }
        Ok(())
    }

    /// Flush every dirty page. If `keep_cached` is false, evict each page
    /// after flushing it.
    pub fn flush_all_pages(&mut self, keep_cached: bool) -> Result<()> {
        let dirty: Vec<PageId> = self.cache.dirty_addresses();
        for address in dirty {
            self.flush_page(address)?;
            if !keep_cached {
                self.cache.remove(address);
            }
        }
        Ok(())
    }

    /// Trigger eviction honoring the strict-cache policy: in strict mode,
    /// a call that leaves the cache over capacity with nothing left to
    /// reclaim fails with `CacheFull`.
    pub fn purge_cache(&mut self, in_changeset: impl Fn(PageId) -> bool) -> Result<()> {
        if !self.cache.is_full() {
            return Ok(());
        }
        let mut to_write = Vec::new();
        self.cache.purge(usize::MAX, &in_changeset, |p| {
            if p.is_dirty() {
                to_write.push((p.address(), p.raw().to_vec()));
            }
        });
        for (address, bytes) in to_write {
            self.device.write_page(address, &bytes)?;
        }
        if self.cache.is_full() {
            if self.strict_cache {
                warn!("page_manager: cache still full after purge, strict mode");
                return Err(Error::CacheFull);
            }
            warn!("page_manager: cache over capacity after best-effort purge");
        }
        Ok(())
    }

    /// Evict every cached page belonging to `db`. Freeing the extended
    /// keys/blobs owned by those pages is the caller's job (it needs the
    /// btree to enumerate them) -- see `Environment::erase_db`.
    pub fn close_database(&mut self, db: u16) -> Result<()> {
        let mut dirty = Vec::new();
        self.cache.visit(|p| {
            if p.db() == db {
                if p.is_dirty() {
                    dirty.push((p.address(), p.raw().to_vec()));
                }
                true
            } else {
                false
            }
        });
        for (address, bytes) in dirty {
            self.device.write_page(address, &bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn new_pm(page_size: u32) -> PageManager {
        PageManager::new(Box::new(MemoryDevice::new(page_size)), 1 << 20, 64, false)
    }

    #[test]
    fn alloc_page_is_dirty_and_fetchable() {
        let mut pm = new_pm(256);
        let addr = pm.alloc_page(1, PageType::BIndex, true, true).unwrap();
        let page = pm.fetch_page(addr, true).unwrap().unwrap();
        assert!(page.is_dirty());
        assert_eq!(page.persistent_type(), PageType::BIndex);
    }

    #[test]
    fn flush_page_clears_dirty_bit() {
        let mut pm = new_pm(256);
        let addr = pm.alloc_page(1, PageType::BIndex, true, true).unwrap();
        pm.flush_page(addr).unwrap();
        let page = pm.fetch_page(addr, true).unwrap().unwrap();
        assert!(!page.is_dirty());
    }

    #[test]
    fn fetch_page_only_from_cache_misses_cleanly() {
        let mut pm = new_pm(256);
        let result = pm.fetch_page(4096, true).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn alloc_page_prefers_freelist_over_device_growth() {
        let mut pm = new_pm(256);
        pm.freelist_mut().mark_free(0, 256, false);
        let size_before = pm.device().file_size().unwrap();
        let addr = pm.alloc_page(1, PageType::BIndex, false, true).unwrap();
        assert_eq!(addr, 0);
        assert_eq!(pm.device().file_size().unwrap(), size_before);
    }
}
