//! Groups every page touched by one commit so it can be logged and
//! flushed as a unit. Pages are bucketed into blobs / page-manager /
//! indices / others, and only the bucket contributing to something that
//! isn't self-describing gets written to the physical log -- blobs are
//! idempotent (the journal will redo the logical insert that produced
//! them) and a single index page needs no atomicity help, so both are
//! skipped to keep the common case cheap.

use log::{debug, trace};

use crate::log::Log;
use crate::page::{PageId, PageType};
use crate::page_manager::PageManager;
use crate::error::Result;

#[derive(Default)]
pub struct Changeset {
    members: Vec<PageId>,
}

impl Changeset {
    pub fn new() -> Self {
        Self { members: Vec::new() }
    }

    /// Idempotent: a page already in the changeset is not added twice.
    pub fn add_page(&mut self, address: PageId) {
        if !self.members.contains(&address) {
            self.members.push(address);
        }
    }

    pub fn contains(&self, address: PageId) -> bool {
        self.members.contains(&address)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }

    /// Classify the changeset's dirty pages, log the ones that need
    /// atomicity help, flush every dirty page to the device, then clear.
    /// A no-op (besides clearing) if nothing in the changeset is dirty.
    pub fn flush(&mut self, pm: &mut PageManager, log: &mut Log, lsn: u64, fsync: bool) -> Result<()> {
        if self.members.is_empty() {
            return Ok(());
        }

        let mut indices = Vec::new();
        let mut page_manager_pages = Vec::new();
        let mut others = Vec::new();
        let mut dirty_members = Vec::new();

        for &addr in &self.members {
            let Some(page) = pm.fetch_page(addr, true)? else {
                continue;
            };
            if !page.is_dirty() {
                continue;
            }
            dirty_members.push(addr);
            if !page.is_no_header() {
                match page.persistent_type() {
                    PageType::BRoot | PageType::BIndex | PageType::Header => indices.push(addr),
                    PageType::PageManager => page_manager_pages.push(addr),
                    PageType::Blob => {}
                    PageType::Unknown | PageType::Freelist => others.push(addr),
                }
            }
            // no-header pages are blob payload pages: idempotent, never logged.
        }

        if dirty_members.is_empty() {
            trace!("changeset: nothing dirty, clearing");
            self.clear();
            return Ok(());
        }

        if !others.is_empty() || !page_manager_pages.is_empty() || indices.len() > 1 {
            for &addr in others.iter().chain(page_manager_pages.iter()).chain(indices.iter()) {
                if let Some(page) = pm.fetch_page(addr, true)? {
                    log.append_page_image(lsn, addr, page.raw())?;
                }
            }
            log.append_changeset_end(lsn)?;
            debug!(
                "changeset: logged {} page(s) under lsn {}",
                others.len() + page_manager_pages.len() + indices.len(),
                lsn
            );
        }

        for &addr in &dirty_members {
            pm.flush_page(addr)?;
        }
        if fsync {
            pm.device_mut().flush()?;
        }

        debug!("changeset: flushed {} dirty page(s)", dirty_members.len());
        self.clear();
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
    fn flush_clears_changeset_even_when_nothing_dirty() {
        let mut pm = new_pm(256);
        let mut log = Log::new(Box::new(MemoryDevice::new(256)));
        let addr = pm.alloc_page(1, PageType::BIndex, true, true).unwrap();
        pm.flush_page(addr).unwrap(); // no longer dirty

        let mut cs = Changeset::new();
        cs.add_page(addr);
        cs.flush(&mut pm, &mut log, 1, false).unwrap();
        assert!(cs.is_empty());
        assert!(log.is_empty());
    }

    #[test]
    fn single_dirty_index_page_flushes_without_logging() {
        let mut pm = new_pm(256);
        let mut log = Log::new(Box::new(MemoryDevice::new(256)));
        let addr = pm.alloc_page(1, PageType::BIndex, true, true).unwrap();

        let mut cs = Changeset::new();
        cs.add_page(addr);
        cs.flush(&mut pm, &mut log, 1, false).unwrap();

        assert!(log.is_empty());
        let page = pm.fetch_page(addr, true).unwrap().unwrap();
        assert!(!page.is_dirty());
    }

    #[test]
    fn two_dirty_index_pages_are_logged_atomically() {
        let mut pm = new_pm(256);
        let mut log = Log::new(Box::new(MemoryDevice::new(256)));
        let a = pm.alloc_page(1, PageType::BIndex, true, true).unwrap();
        let b = pm.alloc_page(1, PageType::BIndex, true, true).unwrap();

        let mut cs = Changeset::new();
        cs.add_page(a);
        cs.add_page(b);
        cs.flush(&mut pm, &mut log, 7, false).unwrap();

        assert_eq!(log.last_complete_lsn(), 7);
        let recovered = log.recover().unwrap();
        assert_eq!(recovered.len(), 2);
    }

    #[test]
    fn blob_only_changeset_skips_logging_entirely() {
        let mut pm = new_pm(256);
        let mut log = Log::new(Box::new(MemoryDevice::new(256)));
        let addr = pm.alloc_page(0, PageType::Blob, true, true).unwrap();
        if let Some(page) = pm.fetch_page_mut(addr, true).unwrap() {
            page.set_flag(crate::page::PageFlags::NO_HEADER);
            page.mark_dirty();
        }

        let mut cs = Changeset::new();
        cs.add_page(addr);
        cs.flush(&mut pm, &mut log, 3, false).unwrap();

        assert!(log.is_empty());
    }

    #[test]
    fn add_page_is_idempotent() {
        let mut cs = Changeset::new();
        cs.add_page(4096);
        cs.add_page(4096);
        assert_eq!(cs.members.len(), 1);
    }
}
