//! Free-space allocator layered on chunk-granularity ranges of the device.
//!
//! The persisted form is a bitmap (one bit per chunk) living in the header
//! page's freelist payload, overflowing into additional freelist-typed
//! pages as the file grows. The authoritative bitmap is kept in memory as
//! a single growable [`BitVec`] and (de)serialized to/from the header +
//! overflow page bytes; `Freelist` itself never touches the device or
//! page cache directly, keeping the bitmap logic separate from its
//! storage.

use bit_vec::BitVec;

use crate::blob::BLOB_HEADER_SIZE;

/// The smallest range worth tracking: an offset plus a blob header plus
/// at least one payload byte.
pub fn smallest_chunk_size() -> u64 {
    std::mem::size_of::<u64>() as u64 + BLOB_HEADER_SIZE as u64 + 1
}

pub struct Freelist {
    chunk_size: u64,
    /// `bitmap[i]` is true iff chunk `i` (covering
    /// `[i*chunk_size, (i+1)*chunk_size)`) is free.
    bitmap: BitVec,
}

impl Freelist {
    pub fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size,
            bitmap: BitVec::new(),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn chunk_of(&self, address: u64) -> usize {
        (address / self.chunk_size) as usize
    }

    fn ensure_covers(&mut self, end_byte: u64) {
        let needed = ((end_byte + self.chunk_size - 1) / self.chunk_size) as usize;
        if needed > self.bitmap.len() {
            self.bitmap.grow(needed - self.bitmap.len(), false);
        }
    }

    /// Find and clear a contiguous run of `chunks_needed` free chunks,
    /// returning the byte address of its start.
    fn find_and_clear_run(&mut self, chunks_needed: usize) -> Option<u64> {
        if chunks_needed == 0 {
            return None;
        }
        let mut run_start = None;
        let mut run_len = 0usize;
        for i in 0..self.bitmap.len() {
            if self.bitmap.get(i).unwrap_or(false) {
                if run_start.is_none() {
                    run_start = Some(i);
                }
                run_len += 1;
                if run_len == chunks_needed {
                    let start = run_start.unwrap();
                    for j in start..start + chunks_needed {
                        self.bitmap.set(j, false);
                    }
                    return Some(start as u64 * self.chunk_size);
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        None
    }

    /// Reserve a chunk-aligned run covering at least `size` bytes.
    /// Returns `None` on a miss -- the caller (usually `PageManager`)
    /// falls back to extending the device.
    pub fn alloc_area(&mut self, size: u64) -> Option<u64> {
        let chunks_needed = ((size + self.chunk_size - 1) / self.chunk_size).max(1) as usize;
        self.find_and_clear_run(chunks_needed)
    }

    /// Find and clear a full page-sized run.
    pub fn alloc_page(&mut self, page_size: u32) -> Option<u64> {
        self.alloc_area(page_size as u64)
    }

    /// Release `[address, address+size)`. Rounded up to whole chunks: the
    /// bitmap only tracks whole-chunk granularity, so a tail narrower
    /// than a chunk is always absorbed into the freed run rather than
    /// left stranded as an unusable sub-chunk fragment.
    pub fn mark_free(&mut self, address: u64, size: u64, overwrite: bool) {
        let end = address + size;
        let start_chunk = self.chunk_of(address);
        let end_chunk = ((end + self.chunk_size - 1) / self.chunk_size) as usize;
        self.ensure_covers(end_chunk as u64 * self.chunk_size);
        for i in start_chunk..end_chunk {
            if !overwrite {
                debug_assert!(
                    !self.bitmap.get(i).unwrap_or(false),
                    "double-free of chunk {}",
                    i
                );
            }
            self.bitmap.set(i, true);
        }
    }

    /// Debug predicate: every chunk in `[address, address+size)` must be
    /// marked allocated (i.e. not free).
    pub fn check_area_is_allocated(&self, address: u64, size: u64) -> bool {
        let start_chunk = self.chunk_of(address);
        let end_chunk = ((address + size + self.chunk_size - 1) / self.chunk_size) as usize;
        (start_chunk..end_chunk).all(|i| !self.bitmap.get(i).unwrap_or(false))
    }

    /// Serialize the bitmap to raw bytes for persistence in the header
    /// page (and overflow pages, chained by the caller once the bitmap
    /// outgrows a single page).
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bitmap.to_bytes()
    }

    pub fn from_bytes(chunk_size: u64, bytes: &[u8]) -> Self {
        Self {
            chunk_size,
            bitmap: BitVec::from_bytes(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_area_misses_on_empty_freelist() {
        let mut fl = Freelist::new(64);
        assert_eq!(fl.alloc_area(64), None);
    }

    #[test]
    fn mark_free_then_alloc_reuses_range() {
        let mut fl = Freelist::new(64);
        fl.mark_free(0, 64 * 4, false);
        let addr = fl.alloc_area(64).unwrap();
        assert_eq!(addr, 0);
        assert!(fl.check_area_is_allocated(0, 64));
        assert!(!fl.check_area_is_allocated(64, 64));
    }

    #[test]
    fn alloc_area_rounds_up_to_chunk_multiple() {
        let mut fl = Freelist::new(64);
        fl.mark_free(0, 64 * 2, false);
        let addr = fl.alloc_area(10).unwrap();
        assert_eq!(addr, 0);
        // a second alloc_area(10) should take the second chunk, not overlap
        let addr2 = fl.alloc_area(10).unwrap();
        assert_eq!(addr2, 64);
    }

    #[test]
    fn mark_free_rounds_partial_tail_chunk_up() {
        let mut fl = Freelist::new(64);
        // freeing 65 bytes touches a second, mostly-empty chunk; that
        // whole chunk becomes free rather than being left unusable.
        fl.mark_free(0, 64 + 1, false);
        let addr = fl.alloc_area(64 * 2).unwrap();
        assert_eq!(addr, 0);
        assert!(fl.check_area_is_allocated(0, 128));
    }

    #[test]
    #[should_panic]
    fn mark_free_without_overwrite_rejects_double_free() {
        let mut fl = Freelist::new(64);
        fl.mark_free(0, 64, false);
        fl.mark_free(0, 64, false);
    }
}
