//! Duplicate-key sub-structure: a packed array of duplicate entries
//! stored as a single blob and addressed from one btree slot.
//!
//! Growth follows a fixed capacity ladder: start at 8, then +8 until 24,
//! thereafter +⅓. Erasing the last entry (or an explicit erase-all)
//! frees the table itself and reports rid 0 to the caller so the
//! owning slot can clear its "has duplicates" bit.

use std::cmp::Ordering;

use crate::blob::{BlobId, BlobManager};
use crate::error::{Error, Result};
use crate::page_manager::PageManager;

const TABLE_HEADER_SIZE: usize = 8; // capacity: u32, count: u32
const ENTRY_SIZE: usize = 16; // flags: u8, reserved: [u8; 7], value: u64
const INLINE_FLAG: u8 = 0b0000_0001;

/// A single duplicate's payload: either a record id (pointing at a blob
/// or, for small values, carrying the value inline) or bytes short
/// enough to live directly in the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DupeValue {
    Rid(u64),
    Inline([u8; 8]),
}

impl DupeValue {
    fn encode(&self) -> (u8, u64) {
        match self {
            DupeValue::Rid(rid) => (0, *rid),
            DupeValue::Inline(bytes) => (INLINE_FLAG, u64::from_le_bytes(*bytes)),
        }
    }

    fn decode(flags: u8, value: u64) -> Self {
        if flags & INLINE_FLAG != 0 {
            DupeValue::Inline(value.to_le_bytes())
        } else {
            DupeValue::Rid(value)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TableHeader {
    capacity: u32,
    count: u32,
}

/// Where a new entry lands relative to the table's existing entries.
/// Sorted tables use [`DupeTable::insert_sorted`] instead, since
/// position there is derived from comparisons rather than named
/// directly.
pub enum InsertMode {
    /// Replace the entry at `pos`; the previous rid's child blob (if any)
    /// is the caller's responsibility to free.
    Overwrite(usize),
    Before(usize),
    After(usize),
    First,
    Last,
    /// Append at the end -- the default mode.
    End,
}

fn grow_capacity(old: u32) -> u32 {
    if old < 24 {
        old + 8
    } else {
        old + old / 3
    }
}

fn encode_table(header: TableHeader, entries: &[DupeValue]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TABLE_HEADER_SIZE + header.capacity as usize * ENTRY_SIZE);
    buf.extend_from_slice(&header.capacity.to_le_bytes());
    buf.extend_from_slice(&header.count.to_le_bytes());
    for v in entries {
        let (flags, value) = v.encode();
        let mut entry = [0u8; ENTRY_SIZE];
        entry[0] = flags;
        entry[8..16].copy_from_slice(&value.to_le_bytes());
        buf.extend_from_slice(&entry);
    }
    let used = TABLE_HEADER_SIZE + entries.len() * ENTRY_SIZE;
    buf.resize(TABLE_HEADER_SIZE + header.capacity as usize * ENTRY_SIZE, 0);
    debug_assert!(used <= buf.len());
    buf
}

fn decode_table(bytes: &[u8]) -> (TableHeader, Vec<DupeValue>) {
    let capacity = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let count = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let mut entries = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let start = TABLE_HEADER_SIZE + i * ENTRY_SIZE;
        let flags = bytes[start];
        let value = u64::from_le_bytes(bytes[start + 8..start + 16].try_into().unwrap());
        entries.push(DupeValue::decode(flags, value));
    }
    (TableHeader { capacity, count }, entries)
}

pub struct DupeTable;

impl DupeTable {
    /// Create a new table holding a single seed entry. Returns the blob
    /// id that now represents this table (the slot's new rid).
    pub fn create(bm: &BlobManager, pm: &mut PageManager, seed: DupeValue) -> Result<BlobId> {
        let header = TableHeader {
            capacity: 8,
            count: 1,
        };
        let bytes = encode_table(header, &[seed]);
        bm.allocate(pm, &bytes)
    }

    pub fn count(bm: &BlobManager, pm: &mut PageManager, table: BlobId) -> Result<u32> {
        let bytes = bm.read(pm, table)?;
        Ok(u32::from_le_bytes(bytes[4..8].try_into().unwrap()))
    }

    pub fn get(bm: &BlobManager, pm: &mut PageManager, table: BlobId, pos: usize) -> Result<DupeValue> {
        let bytes = bm.read(pm, table)?;
        let (header, entries) = decode_table(&bytes);
        if pos as u32 >= header.count {
            return Err(Error::InvalidParameter("duplicate index out of range"));
        }
        Ok(entries[pos].clone())
    }

    fn resolve_insert_pos(entries: &[DupeValue], mode: &InsertMode) -> usize {
        match mode {
            InsertMode::Overwrite(pos) | InsertMode::Before(pos) => *pos,
            InsertMode::After(pos) => pos + 1,
            InsertMode::First => 0,
            InsertMode::Last | InsertMode::End => entries.len(),
        }
    }

    /// Insert `value` according to `mode`, growing the table's capacity
    /// if it's full. Returns the (possibly reallocated) table id.
    pub fn insert(
        bm: &BlobManager,
        pm: &mut PageManager,
        table: BlobId,
        value: DupeValue,
        mode: InsertMode,
    ) -> Result<BlobId> {
        let bytes = bm.read(pm, table)?;
        let (mut header, mut entries) = decode_table(&bytes);

        if let InsertMode::Overwrite(pos) = mode {
            if pos as u32 >= header.count {
                return Err(Error::InvalidParameter("duplicate index out of range"));
            }
            entries[pos] = value;
        } else {
            let pos = Self::resolve_insert_pos(&entries, &mode).min(entries.len());
            entries.insert(pos, value);
            header.count += 1;
            if header.count > header.capacity {
                header.capacity = grow_capacity(header.capacity);
            }
        }

        let encoded = encode_table(header, &entries);
        bm.overwrite(pm, table, &encoded)
    }

    /// Insert `value` into a table ordered by `compare`, comparing
    /// against the record each existing rid names via `resolve` (which
    /// may need to read through the btree for a `Rid`, hence the page
    /// manager and blob manager handles passed to it on every call).
    pub fn insert_sorted(
        bm: &BlobManager,
        pm: &mut PageManager,
        table: BlobId,
        value: DupeValue,
        compare: &dyn Fn(&[u8], &[u8]) -> Ordering,
        resolve: &dyn Fn(&DupeValue, &mut PageManager, &BlobManager) -> Result<Vec<u8>>,
        hint: usize,
    ) -> Result<BlobId> {
        let bytes = bm.read(pm, table)?;
        let (mut header, mut entries) = decode_table(&bytes);

        let needle = resolve(&value, pm, bm)?;
        let mut lo = 0usize;
        let mut hi = entries.len();
        // seed the search window around `hint` so a sequential-insert
        // workload (hint at the tail) converges in O(1) comparisons.
        if hint < entries.len() {
            let seed_bytes = resolve(&entries[hint], pm, bm)?;
            if compare(&needle, &seed_bytes) != Ordering::Less {
                lo = hint;
            } else {
                hi = hint;
            }
        }
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mid_bytes = resolve(&entries[mid], pm, bm)?;
            match compare(&needle, &mid_bytes) {
                Ordering::Less => hi = mid,
                _ => lo = mid + 1,
            }
        }
        entries.insert(lo, value);
        header.count += 1;
        if header.count > header.capacity {
            header.capacity = grow_capacity(header.capacity);
        }

        let encoded = encode_table(header, &entries);
        bm.overwrite(pm, table, &encoded)
    }

    /// Erase the entry at `pos`. If it was the last one, or `erase_all`
    /// is set, the whole table is freed and `None` is returned so the
    /// caller clears the slot's rid to 0; otherwise returns the
    /// (possibly reallocated) table id.
    pub fn erase(
        bm: &BlobManager,
        pm: &mut PageManager,
        table: BlobId,
        pos: usize,
        erase_all: bool,
    ) -> Result<Option<BlobId>> {
        let bytes = bm.read(pm, table)?;
        let (mut header, mut entries) = decode_table(&bytes);
        if pos as u32 >= header.count {
            return Err(Error::InvalidParameter("duplicate index out of range"));
        }

        if erase_all || header.count == 1 {
            bm.free(pm, table)?;
            return Ok(None);
        }

        entries.remove(pos);
        header.count -= 1;
        let encoded = encode_table(header, &entries);
        Ok(Some(bm.overwrite(pm, table, &encoded)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn setup() -> (BlobManager, PageManager) {
        let pm = PageManager::new(Box::new(MemoryDevice::new(256)), 1 << 20, 64, false);
        let bm = BlobManager::new(64, 256, false);
        (bm, pm)
    }

    #[test]
    fn create_then_get_seed_entry() {
        let (bm, mut pm) = setup();
        let table = DupeTable::create(&bm, &mut pm, DupeValue::Rid(42)).unwrap();
        assert_eq!(DupeTable::count(&bm, &mut pm, table).unwrap(), 1);
        assert_eq!(DupeTable::get(&bm, &mut pm, table, 0).unwrap(), DupeValue::Rid(42));
    }

    #[test]
    fn insert_end_appends_in_order() {
        let (bm, mut pm) = setup();
        let mut table = DupeTable::create(&bm, &mut pm, DupeValue::Rid(1)).unwrap();
        table = DupeTable::insert(&bm, &mut pm, table, DupeValue::Rid(2), InsertMode::End).unwrap();
        table = DupeTable::insert(&bm, &mut pm, table, DupeValue::Rid(3), InsertMode::End).unwrap();
        assert_eq!(DupeTable::count(&bm, &mut pm, table).unwrap(), 3);
        assert_eq!(DupeTable::get(&bm, &mut pm, table, 2).unwrap(), DupeValue::Rid(3));
    }

    #[test]
    fn insert_first_and_before_after() {
        let (bm, mut pm) = setup();
        let mut table = DupeTable::create(&bm, &mut pm, DupeValue::Rid(2)).unwrap();
        table = DupeTable::insert(&bm, &mut pm, table, DupeValue::Rid(1), InsertMode::First).unwrap();
        table = DupeTable::insert(&bm, &mut pm, table, DupeValue::Rid(3), InsertMode::After(1)).unwrap();
        let values: Vec<_> = (0..3)
            .map(|i| DupeTable::get(&bm, &mut pm, table, i).unwrap())
            .collect();
        assert_eq!(
            values,
            vec![DupeValue::Rid(1), DupeValue::Rid(2), DupeValue::Rid(3)]
        );
    }

    #[test]
    fn capacity_grows_past_eight_and_twenty_four() {
        let (bm, mut pm) = setup();
        let mut table = DupeTable::create(&bm, &mut pm, DupeValue::Rid(0)).unwrap();
        for i in 1..40 {
            table = DupeTable::insert(&bm, &mut pm, table, DupeValue::Rid(i), InsertMode::End).unwrap();
        }
        assert_eq!(DupeTable::count(&bm, &mut pm, table).unwrap(), 40);
    }

    #[test]
    fn erase_last_entry_frees_table() {
        let (bm, mut pm) = setup();
        let table = DupeTable::create(&bm, &mut pm, DupeValue::Rid(1)).unwrap();
        let result = DupeTable::erase(&bm, &mut pm, table, 0, false).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn erase_shrinks_without_freeing_when_entries_remain() {
        let (bm, mut pm) = setup();
        let mut table = DupeTable::create(&bm, &mut pm, DupeValue::Rid(1)).unwrap();
        table = DupeTable::insert(&bm, &mut pm, table, DupeValue::Rid(2), InsertMode::End).unwrap();
        let result = DupeTable::erase(&bm, &mut pm, table, 0, false).unwrap();
        let table = result.unwrap();
        assert_eq!(DupeTable::count(&bm, &mut pm, table).unwrap(), 1);
        assert_eq!(DupeTable::get(&bm, &mut pm, table, 0).unwrap(), DupeValue::Rid(2));
    }

    #[test]
    fn insert_sorted_keeps_non_decreasing_order() {
        let (bm, mut pm) = setup();
        let resolve = |v: &DupeValue, _pm: &mut PageManager, _bm: &BlobManager| {
            Ok(match v {
                DupeValue::Rid(r) => r.to_le_bytes().to_vec(),
                DupeValue::Inline(b) => b.to_vec(),
            })
        };
        let compare = |a: &[u8], b: &[u8]| a.cmp(b);

        let mut table = DupeTable::create(&bm, &mut pm, DupeValue::Rid(5)).unwrap();
        for v in [2u64, 9, 1, 7, 4] {
            table = DupeTable::insert_sorted(
                &bm,
                &mut pm,
                table,
                DupeValue::Rid(v),
                &compare,
                &resolve,
                0,
            )
            .unwrap();
        }
        let n = DupeTable::count(&bm, &mut pm, table).unwrap();
        let mut prev = None;
        for i in 0..n {
            let DupeValue::Rid(r) = DupeTable::get(&bm, &mut pm, table, i as usize).unwrap() else {
                panic!("expected rid");
            };
            if let Some(p) = prev {
                assert!(p <= r);
            }
            prev = Some(r);
        }
    }
}
