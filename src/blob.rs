//! Large-value storage: blobs that don't fit inline in a btree key entry.
//!
//! A blob is a header (`self`, `size`, `alloc_size`, `flags`) followed by
//! its payload, possibly spanning several pages. Space comes from the
//! freelist first; on a miss, small blobs are backed by a fresh
//! no-header page (so they ride the normal page cache), while large
//! blobs go straight to the device -- the two allocation routes are
//! chosen between by comparing size against a threshold.

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::page::{PageFlags, PageType};
use crate::page_manager::PageManager;

pub const BLOB_HEADER_SIZE: usize = 8 + 8 + 8 + 4;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlobFlags: u32 {
        /// The blob's logical size is larger than what has actually been
        /// written; unwritten regions read back as zero.
        const PARTIAL = 0b0001;
    }
}

/// A blob's address, tagged by which device backs it: a sum type instead
/// of pointer-tagging a raw `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobId {
    OnDisk(u64),
    InMemory(u64),
}

impl BlobId {
    pub fn address(self) -> u64 {
        match self {
            BlobId::OnDisk(a) => a,
            BlobId::InMemory(a) => a,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BlobHeader {
    self_addr: u64,
    size: u64,
    alloc_size: u64,
    flags: u32,
}

impl BlobHeader {
    fn encode(&self) -> [u8; BLOB_HEADER_SIZE] {
        let mut buf = [0u8; BLOB_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.self_addr.to_le_bytes());
        buf[8..16].copy_from_slice(&self.size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.alloc_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            self_addr: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            size: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            alloc_size: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
        }
    }
}

fn round_up(value: u64, granularity: u64) -> u64 {
    ((value + granularity - 1) / granularity) * granularity
}

pub struct BlobManager {
    chunk_size: u64,
    page_size: u64,
    recovery_enabled: bool,
}

impl BlobManager {
    pub fn new(chunk_size: u64, page_size: u32, recovery_enabled: bool) -> Self {
        Self {
            chunk_size,
            page_size: page_size as u64,
            recovery_enabled,
        }
    }

    fn from_cache_threshold(&self) -> u64 {
        if self.recovery_enabled {
            self.page_size.saturating_sub(crate::page::PAGE_HEADER_SIZE as u64)
        } else {
            self.page_size / 8
        }
    }

    fn make_id(&self, pm: &PageManager, address: u64) -> BlobId {
        if pm.device().is_in_memory() {
            BlobId::InMemory(address)
        } else {
            BlobId::OnDisk(address)
        }
    }

    fn reserve_region(&self, pm: &mut PageManager, alloc_size: u64) -> Result<u64> {
        if let Some(addr) = pm.alloc_blob_area(alloc_size) {
            return Ok(addr);
        }
        if alloc_size < self.from_cache_threshold() {
            let page_size = pm.page_size() as u64;
            let n_pages = ((alloc_size + page_size - 1) / page_size).max(1);
            let mut first = None;
            for i in 0..n_pages {
                let addr = pm.alloc_page(0, PageType::Blob, true, true)?;
                if i == 0 {
                    first = Some(addr);
                } else {
                    debug_assert_eq!(addr, first.unwrap() + i * page_size);
                }
                if let Some(page) = pm.fetch_page_mut(addr, true)? {
                    page.set_flag(PageFlags::NO_HEADER);
                    page.mark_dirty();
                }
            }
            trace!("blob: reserved {} page-cache-backed bytes at {}", alloc_size, first.unwrap());
            Ok(first.unwrap())
        } else {
            let page_size = pm.page_size() as u64;
            let aligned = round_up(alloc_size, page_size);
            let addr = pm.device_mut().alloc(aligned)?;
            if aligned > alloc_size {
                pm.free_area(addr + alloc_size, aligned - alloc_size, false);
            }
            trace!("blob: reserved {} direct-I/O bytes at {}", alloc_size, addr);
            Ok(addr)
        }
    }

    fn write_bytes(&self, pm: &mut PageManager, address: u64, bytes: &[u8]) -> Result<()> {
        let page_size = pm.page_size() as u64;
        let mut off = 0usize;
        while off < bytes.len() {
            let cur = address + off as u64;
            let page_addr = (cur / page_size) * page_size;
            let page_off = (cur - page_addr) as usize;
            let n = (page_size as usize - page_off).min(bytes.len() - off);
            if let Some(page) = pm.fetch_page_mut(page_addr, true)? {
                page.raw_mut()[page_off..page_off + n].copy_from_slice(&bytes[off..off + n]);
                page.mark_dirty();
            } else {
                pm.device_mut().write(cur, &bytes[off..off + n])?;
            }
            off += n;
        }
        Ok(())
    }

    fn read_bytes(&self, pm: &mut PageManager, address: u64, buf: &mut [u8]) -> Result<()> {
        let page_size = pm.page_size() as u64;
        let mut off = 0usize;
        while off < buf.len() {
            let cur = address + off as u64;
            let page_addr = (cur / page_size) * page_size;
            let page_off = (cur - page_addr) as usize;
            let n = (page_size as usize - page_off).min(buf.len() - off);
            if let Some(page) = pm.fetch_page(page_addr, true)? {
                buf[off..off + n].copy_from_slice(&page.raw()[page_off..page_off + n]);
            } else {
                pm.device_mut().read(cur, &mut buf[off..off + n])?;
            }
            off += n;
        }
        Ok(())
    }

    /// Write a whole new blob and return its id.
    pub fn allocate(&self, pm: &mut PageManager, data: &[u8]) -> Result<BlobId> {
        self.allocate_partial(pm, data, data.len() as u64)
    }

    /// Write a new blob whose logical size is `total_size`, but only
    /// `data` (its leading bytes) are actually supplied; the remainder
    /// reads back as zero until overwritten.
    pub fn allocate_partial(&self, pm: &mut PageManager, data: &[u8], total_size: u64) -> Result<BlobId> {
        let alloc_size = round_up(BLOB_HEADER_SIZE as u64 + total_size, self.chunk_size);
        let address = self.reserve_region(pm, alloc_size)?;
        let flags = if (data.len() as u64) < total_size {
            BlobFlags::PARTIAL.bits()
        } else {
            0
        };
        let header = BlobHeader {
            self_addr: address,
            size: total_size,
            alloc_size,
            flags,
        };
        self.write_bytes(pm, address, &header.encode())?;
        self.write_bytes(pm, address + BLOB_HEADER_SIZE as u64, data)?;
        debug!("blob: allocated id={} size={}", address, total_size);
        Ok(self.make_id(pm, address))
    }

    /// Write `partial_size` bytes of `data` at logical offset `offset`
    /// within a blob of logical size `total_size`. Gaps before/after the
    /// supplied region are zero-filled.
    pub fn write_with_gaps(
        &self,
        pm: &mut PageManager,
        offset: u64,
        data: &[u8],
        total_size: u64,
    ) -> Result<BlobId> {
        if offset + data.len() as u64 > total_size {
            return Err(Error::InvalidParameter("partial write exceeds total size"));
        }
        let alloc_size = round_up(BLOB_HEADER_SIZE as u64 + total_size, self.chunk_size);
        let address = self.reserve_region(pm, alloc_size)?;
        let is_partial = !(offset == 0 && offset + data.len() as u64 == total_size);
        let header = BlobHeader {
            self_addr: address,
            size: total_size,
            alloc_size,
            flags: if is_partial { BlobFlags::PARTIAL.bits() } else { 0 },
        };
        self.write_bytes(pm, address, &header.encode())?;
        self.zero_fill(pm, address + BLOB_HEADER_SIZE as u64, 0, offset)?;
        self.write_bytes(pm, address + BLOB_HEADER_SIZE as u64 + offset, data)?;
        self.zero_fill(
            pm,
            address + BLOB_HEADER_SIZE as u64,
            offset + data.len() as u64,
            total_size,
        )?;
        Ok(self.make_id(pm, address))
    }

    fn zero_fill(&self, pm: &mut PageManager, base: u64, from: u64, to: u64) -> Result<()> {
        if to <= from {
            return Ok(());
        }
        const ZERO_CHUNK: usize = 4096;
        let zeros = vec![0u8; ZERO_CHUNK];
        let mut pos = from;
        while pos < to {
            let n = ((to - pos) as usize).min(ZERO_CHUNK);
            self.write_bytes(pm, base + pos, &zeros[..n])?;
            pos += n as u64;
        }
        Ok(())
    }

    fn read_header(&self, pm: &mut PageManager, id: BlobId) -> Result<BlobHeader> {
        let address = id.address();
        let mut buf = [0u8; BLOB_HEADER_SIZE];
        self.read_bytes(pm, address, &mut buf)?;
        let header = BlobHeader::decode(&buf);
        if header.self_addr != address {
            return Err(Error::BlobNotFound { blob_id: address });
        }
        Ok(header)
    }

    /// Read the full logical payload of a blob. Unwritten regions of a
    /// partial blob read back as zero.
    pub fn read(&self, pm: &mut PageManager, id: BlobId) -> Result<Vec<u8>> {
        let header = self.read_header(pm, id)?;
        let mut buf = vec![0u8; header.size as usize];
        self.read_bytes(pm, id.address() + BLOB_HEADER_SIZE as u64, &mut buf)?;
        Ok(buf)
    }

    pub fn size(&self, pm: &mut PageManager, id: BlobId) -> Result<u64> {
        Ok(self.read_header(pm, id)?.size)
    }

    /// Overwrite a blob's content. If the new data fits within the old
    /// allocation, the header is replaced in place (preserving its flags
    /// unless overridden by the caller) and any remainder above the
    /// smallest tracked chunk is returned to the freelist; otherwise a
    /// fresh blob is allocated and the old one is freed.
    pub fn overwrite(&self, pm: &mut PageManager, id: BlobId, data: &[u8]) -> Result<BlobId> {
        let old = self.read_header(pm, id)?;
        let needed = round_up(BLOB_HEADER_SIZE as u64 + data.len() as u64, self.chunk_size);
        if needed <= old.alloc_size {
            let address = id.address();
            let header = BlobHeader {
                self_addr: address,
                size: data.len() as u64,
                alloc_size: old.alloc_size,
                flags: 0,
            };
            self.write_bytes(pm, address, &header.encode())?;
            self.write_bytes(pm, address + BLOB_HEADER_SIZE as u64, data)?;
            let leftover = old.alloc_size - needed;
            if leftover >= crate::freelist::smallest_chunk_size() {
                pm.free_area(address + needed, leftover, false);
            }
            debug!("blob: overwrote id={} in place", address);
            Ok(id)
        } else {
            let fresh = self.allocate(pm, data)?;
            self.free(pm, id)?;
            Ok(fresh)
        }
    }

    pub fn free(&self, pm: &mut PageManager, id: BlobId) -> Result<()> {
        let header = self.read_header(pm, id)?;
        let address = id.address();
        let page_size = pm.page_size() as u64;
        let mut addr = address;
        while addr < address + header.alloc_size {
            pm.cache_remove(addr - (addr % page_size));
            addr += page_size;
        }
        pm.free_area(address, header.alloc_size, false);
        debug!("blob: freed id={}", address);
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
    fn small_blob_roundtrip() {
        let mut pm = new_pm(256);
        let bm = BlobManager::new(64, 256, false);
        let id = bm.allocate(&mut pm, b"hello world").unwrap();
        let data = bm.read(&mut pm, id).unwrap();
        assert_eq!(data, b"hello world");
    }

    #[test]
    fn large_blob_spanning_pages_roundtrip() {
        let mut pm = new_pm(128);
        let bm = BlobManager::new(64, 128, false);
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let id = bm.allocate(&mut pm, &payload).unwrap();
        let data = bm.read(&mut pm, id).unwrap();
        assert_eq!(data, payload);
    }

    #[test]
    fn partial_write_zero_fills_gaps() {
        let mut pm = new_pm(256);
        let bm = BlobManager::new(64, 256, false);
        let id = bm.write_with_gaps(&mut pm, 100, &[0xAAu8; 200], 1000).unwrap();
        let data = bm.read(&mut pm, id).unwrap();
        assert_eq!(data.len(), 1000);
        assert!(data[..100].iter().all(|&b| b == 0));
        assert!(data[100..300].iter().all(|&b| b == 0xAA));
        assert!(data[300..].iter().all(|&b| b == 0));
    }

    #[test]
    fn blob_not_found_on_bad_id() {
        let mut pm = new_pm(256);
        let bm = BlobManager::new(64, 256, false);
        let bogus = BlobId::OnDisk(4096);
        pm.device_mut().alloc(8192).unwrap();
        let result = bm.read(&mut pm, bogus);
        assert!(matches!(result, Err(Error::BlobNotFound { .. })));
    }

    #[test]
    fn overwrite_in_place_when_it_fits() {
        let mut pm = new_pm(256);
        let bm = BlobManager::new(64, 256, false);
        let id = bm.allocate(&mut pm, b"short").unwrap();
        let id2 = bm.overwrite(&mut pm, id, b"still short").unwrap();
        assert_eq!(id, id2);
        assert_eq!(bm.read(&mut pm, id2).unwrap(), b"still short");
    }

    #[test]
    fn overwrite_reallocates_when_it_does_not_fit() {
        let mut pm = new_pm(256);
        let bm = BlobManager::new(64, 256, false);
        let id = bm.allocate(&mut pm, b"short").unwrap();
        let big = vec![7u8; 10_000];
        let id2 = bm.overwrite(&mut pm, id, &big).unwrap();
        assert_eq!(bm.read(&mut pm, id2).unwrap(), big);
    }

    #[test]
    fn free_then_reuse_via_freelist() {
        let mut pm = new_pm(256);
        let bm = BlobManager::new(64, 256, false);
        let id = bm.allocate(&mut pm, b"0123456789").unwrap();
        bm.free(&mut pm, id).unwrap();
        let id2 = bm.allocate(&mut pm, b"abcdefghij").unwrap();
        assert_eq!(id.address(), id2.address());
    }
}
