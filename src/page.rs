//! Fixed-size page: the engine's I/O and caching unit.
//!
//! A page's three-list membership (cache bucket, LRU, changeset) is *not*
//! intrusive: the page is addressed by a stable handle (its file address)
//! and each list's prev/next state lives in the owning structure
//! ([`crate::cache::Cache`] for bucket+LRU, [`crate::changeset::Changeset`]
//! for the changeset list), never inside `Page` itself.

use bitflags::bitflags;

/// A page's address is its byte offset in the device; always a multiple
/// of the page size.
pub type PageId = u64;

/// Persistent page type, written into the page header's flags field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unknown = 0,
    Header = 1,
    BRoot = 2,
    BIndex = 3,
    Freelist = 4,
    Blob = 5,
    PageManager = 6,
}

impl PageType {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => PageType::Header,
            2 => PageType::BRoot,
            3 => PageType::BIndex,
            4 => PageType::Freelist,
            5 => PageType::Blob,
            6 => PageType::PageManager,
            _ => PageType::Unknown,
        }
    }
}

bitflags! {
    /// Non-persistent flags: never written to disk, reset whenever a page
    /// is re-fetched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Backed by a heap buffer rather than an mmap'd region; only
        /// malloc-backed pages are eligible for cache eviction.
        const MALLOC_BACKED  = 0b0001;
        /// Marked for removal from the cache on next purge; must never be
        /// returned from a cache lookup.
        const DELETE_PENDING = 0b0010;
        /// Blob overflow page: the whole payload is raw data, no
        /// persistent page header is present at its start.
        const NO_HEADER      = 0b0100;
    }
}

/// The persistent page header occupies the first 12 bytes of every page
/// that isn't `NO_HEADER`: a `u32` type tag followed by two reserved
/// `u32`s.
pub const PAGE_HEADER_SIZE: usize = 12;

/// One cached or in-flight page.
#[derive(Debug, Clone)]
pub struct Page {
    address: PageId,
    flags: PageFlags,
    dirty: bool,
    /// Owning database id; 0 means "not owned by a user database" (page
    /// manager, freelist, header page).
    db: u16,
    payload: Vec<u8>,
    /// Bumped on any mutation that can invalidate a cursor's coupled slot
    /// index.
    epoch: u64,
}

impl Page {
    /// A brand-new page, not yet bound to any address (call `bind` once
    /// the device has allocated space for it).
    pub fn new_empty(page_size: u32) -> Self {
        Self {
            address: 0,
            flags: PageFlags::MALLOC_BACKED,
            dirty: false,
            db: 0,
            payload: vec![0u8; page_size as usize],
            epoch: 0,
        }
    }

    pub fn bind(&mut self, address: PageId) {
        self.address = address;
    }

    pub fn address(&self) -> PageId {
        self.address
    }

    pub fn page_size(&self) -> usize {
        self.payload.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        self.epoch += 1;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn db(&self) -> u16 {
        self.db
    }

    pub fn set_db(&mut self, db: u16) {
        self.db = db;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    pub fn set_flag(&mut self, flag: PageFlags) {
        self.flags.insert(flag);
    }

    pub fn clear_flag(&mut self, flag: PageFlags) {
        self.flags.remove(flag);
    }

    pub fn is_no_header(&self) -> bool {
        self.flags.contains(PageFlags::NO_HEADER)
    }

    pub fn is_malloc_backed(&self) -> bool {
        self.flags.contains(PageFlags::MALLOC_BACKED)
    }

    pub fn is_delete_pending(&self) -> bool {
        self.flags.contains(PageFlags::DELETE_PENDING)
    }

    /// Raw page bytes, header included. Used verbatim by the physical log
    /// (whole-page images) and by device I/O.
    pub fn raw(&self) -> &[u8] {
        &self.payload
    }

    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    pub fn set_raw(&mut self, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.payload.len());
        self.payload.copy_from_slice(bytes);
        self.epoch += 1;
    }

    /// The payload usable by the page's logical content: everything past
    /// the persistent page header, unless this is a no-header blob page
    /// in which case the whole page is usable.
    pub fn usable_payload(&self) -> &[u8] {
        if self.is_no_header() {
            &self.payload
        } else {
            &self.payload[PAGE_HEADER_SIZE..]
        }
    }

    pub fn usable_payload_mut(&mut self) -> &mut [u8] {
        self.epoch += 1;
        if self.flags.contains(PageFlags::NO_HEADER) {
            &mut self.payload
        } else {
            &mut self.payload[PAGE_HEADER_SIZE..]
        }
    }

    pub fn persistent_type(&self) -> PageType {
        if self.is_no_header() {
            return PageType::Blob;
        }
        let tag = u32::from_le_bytes(self.payload[0..4].try_into().unwrap());
        PageType::from_u32(tag)
    }

    pub fn set_persistent_type(&mut self, ty: PageType) {
        if self.is_no_header() {
            return;
        }
        self.payload[0..4].copy_from_slice(&(ty as u32).to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_payload_skips_header_unless_no_header() {
        let mut p = Page::new_empty(64);
        p.bind(4096);
        p.set_persistent_type(PageType::BIndex);
        assert_eq!(p.usable_payload().len(), 64 - PAGE_HEADER_SIZE);
        assert_eq!(p.persistent_type(), PageType::BIndex);

        p.set_flag(PageFlags::NO_HEADER);
        assert_eq!(p.usable_payload().len(), 64);
        assert_eq!(p.persistent_type(), PageType::Blob);
    }

    #[test]
    fn mark_dirty_bumps_epoch() {
        let mut p = Page::new_empty(64);
        let e0 = p.epoch();
        p.mark_dirty();
        assert!(p.epoch() > e0);
        assert!(p.is_dirty());
    }
}
