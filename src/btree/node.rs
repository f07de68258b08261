//! One btree node's in-memory decoding of a page's usable payload:
//! a small header followed by a packed, variable-length entry array
//! kept in key order.
//!
//! Keys longer than [`INLINE_KEY_MAX`] spill into a blob (an "extended
//! key") the way oversized records already do; only a fixed-size prefix
//! stays inline so the node's size stays bounded by its entry count, not
//! by what callers insert. Leaf records shorter than [`INLINE_RECORD_MAX`]
//! are stored inline too; anything bigger, or a key with more than one
//! duplicate, is a record id into a blob.

use crate::blob::{BlobId, BlobManager};
use crate::error::{Error, Result};
use crate::page::PageId;
use crate::page_manager::PageManager;

pub const INLINE_KEY_MAX: usize = 32;
pub const INLINE_RECORD_MAX: usize = 24;

/// `is_leaf(1) + count(2) + left(8) + right(8) + parent(8) + leftmost_child(8)`.
const NODE_HEADER_SIZE: usize = 1 + 2 + 8 + 8 + 8 + 8;

const KEY_OVERFLOW: u8 = 0b0000_0001;
const VALUE_INLINE: u8 = 0b0000_0010;
const VALUE_BLOB: u8 = 0b0000_0100;
const VALUE_DUPLICATES: u8 = 0b0000_1000;
const BLOB_IS_IN_MEMORY: u8 = 0b0001_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordValue {
    /// Fits directly in the node; the common case for small fixed-size
    /// values and record-number databases.
    Inline(Vec<u8>),
    /// A single out-of-line record.
    Blob(BlobId),
    /// More than one record under this key; points at a [`crate::dupe::DupeTable`].
    Duplicates(BlobId),
}

#[derive(Debug, Clone)]
pub enum NodeValue {
    /// Leaf entry.
    Record(RecordValue),
    /// Internal entry: every key strictly less than `key` (and at least
    /// the previous separator) routes to this child.
    Child(PageId),
}

#[derive(Debug, Clone)]
pub struct NodeEntry {
    /// Always the full key, resolved eagerly on decode so comparisons
    /// never need to touch the blob layer mid-search.
    pub key: Vec<u8>,
    key_overflow: Option<BlobId>,
    pub value: NodeValue,
}

impl NodeEntry {
    /// Build an entry, spilling `key` into a blob if it's too long to
    /// keep inline.
    pub fn new(key: Vec<u8>, value: NodeValue, bm: &BlobManager, pm: &mut PageManager) -> Result<Self> {
        if key.len() <= INLINE_KEY_MAX {
            Ok(Self { key, key_overflow: None, value })
        } else {
            let id = bm.allocate(pm, &key)?;
            Ok(Self { key, key_overflow: Some(id), value })
        }
    }

    /// Build an entry without allocating a fresh overflow blob for the
    /// key, storing it verbatim instead -- used when promoting a
    /// separator during a split, where re-running the overflow
    /// threshold would just allocate a second blob for a key that may
    /// already have one.
    pub fn new_verbatim(key: Vec<u8>, value: NodeValue) -> Self {
        Self { key, key_overflow: None, value }
    }

    /// Free this entry's overflow key blob, if it has one. Does *not*
    /// free a record blob/duplicate table -- callers that own those
    /// (e.g. an erase) free them separately.
    pub fn free_key_overflow(&self, bm: &BlobManager, pm: &mut PageManager) -> Result<()> {
        if let Some(id) = self.key_overflow {
            bm.free(pm, id)?;
        }
        Ok(())
    }
}

pub struct BtreeNode {
    pub is_leaf: bool,
    pub left_sibling: PageId,
    pub right_sibling: PageId,
    pub parent: PageId,
    /// Internal nodes only: the child for keys strictly less than
    /// `entries[0].key`. Each `entries[i]` then carries, as its
    /// `Child`, the subtree for keys in `[entries[i].key, entries[i+1].key)`
    /// (or `[entries[i].key, +inf)` for the last entry).
    pub leftmost_child: PageId,
    pub entries: Vec<NodeEntry>,
}

impl BtreeNode {
    pub fn new_leaf() -> Self {
        Self {
            is_leaf: true,
            left_sibling: 0,
            right_sibling: 0,
            parent: 0,
            leftmost_child: 0,
            entries: Vec::new(),
        }
    }

    pub fn new_internal() -> Self {
        Self {
            is_leaf: false,
            left_sibling: 0,
            right_sibling: 0,
            parent: 0,
            leftmost_child: 0,
            entries: Vec::new(),
        }
    }

    /// Binary search by key. `Ok(i)` is an exact match at entry `i`;
    /// `Err(i)` is the insertion point that keeps entries sorted.
    pub fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.as_slice().cmp(key))
    }

    /// For an internal node: the child whose subtree covers `key`.
    pub fn child_for(&self, key: &[u8]) -> PageId {
        debug_assert!(!self.is_leaf);
        let idx = match self.search(key) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        if idx == 0 {
            self.leftmost_child
        } else {
            match &self.entries[idx - 1].value {
                NodeValue::Child(c) => *c,
                NodeValue::Record(_) => unreachable!("internal node holds only children"),
            }
        }
    }

    /// Decode a node from a page's usable payload.
    pub fn decode(bytes: &[u8], bm: &BlobManager, pm: &mut PageManager) -> Result<Self> {
        let is_leaf = bytes[0] != 0;
        let count = u16::from_le_bytes(bytes[1..3].try_into().unwrap()) as usize;
        let left_sibling = u64::from_le_bytes(bytes[3..11].try_into().unwrap());
        let right_sibling = u64::from_le_bytes(bytes[11..19].try_into().unwrap());
        let parent = u64::from_le_bytes(bytes[19..27].try_into().unwrap());
        let leftmost_child = u64::from_le_bytes(bytes[27..35].try_into().unwrap());

        let mut entries = Vec::with_capacity(count);
        let mut off = NODE_HEADER_SIZE;
        for _ in 0..count {
            let flags = bytes[off];
            off += 1;
            let key_len = u16::from_le_bytes(bytes[off..off + 2].try_into().unwrap()) as usize;
            off += 2;
            let inline_key = bytes[off..off + key_len].to_vec();
            off += key_len;

            let (key, key_overflow) = if flags & KEY_OVERFLOW != 0 {
                let addr = u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
                off += 8;
                let id = if flags & BLOB_IS_IN_MEMORY != 0 {
                    BlobId::InMemory(addr)
                } else {
                    BlobId::OnDisk(addr)
                };
                (bm.read(pm, id)?, Some(id))
            } else {
                (inline_key, None)
            };

            let value = if is_leaf {
                if flags & VALUE_INLINE != 0 {
                    let len = u16::from_le_bytes(bytes[off..off + 2].try_into().unwrap()) as usize;
                    off += 2;
                    let data = bytes[off..off + len].to_vec();
                    off += len;
                    NodeValue::Record(RecordValue::Inline(data))
                } else {
                    let addr = u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
                    off += 8;
                    let id = if flags & BLOB_IS_IN_MEMORY != 0 {
                        BlobId::InMemory(addr)
                    } else {
                        BlobId::OnDisk(addr)
                    };
                    if flags & VALUE_DUPLICATES != 0 {
                        NodeValue::Record(RecordValue::Duplicates(id))
                    } else {
                        debug_assert!(flags & VALUE_BLOB != 0);
                        NodeValue::Record(RecordValue::Blob(id))
                    }
                }
            } else {
                let child = u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
                off += 8;
                NodeValue::Child(child)
            };

            entries.push(NodeEntry { key, key_overflow, value });
        }

        Ok(Self {
            is_leaf,
            left_sibling,
            right_sibling,
            parent,
            leftmost_child,
            entries,
        })
    }

    /// Encode back into a page's usable payload. Errors with
    /// `LimitsReached` if the node no longer fits -- the caller is
    /// expected to have already split before this would happen.
    pub fn encode(&self, out: &mut [u8]) -> Result<()> {
        out[0] = self.is_leaf as u8;
        out[1..3].copy_from_slice(&(self.entries.len() as u16).to_le_bytes());
        out[3..11].copy_from_slice(&self.left_sibling.to_le_bytes());
        out[11..19].copy_from_slice(&self.right_sibling.to_le_bytes());
        out[19..27].copy_from_slice(&self.parent.to_le_bytes());
        out[27..35].copy_from_slice(&self.leftmost_child.to_le_bytes());

        let mut off = NODE_HEADER_SIZE;
        for entry in &self.entries {
            let (mut flags, inline_key, key_blob) = if let Some(id) = entry.key_overflow {
                (KEY_OVERFLOW, entry.key[..INLINE_KEY_MAX].to_vec(), Some(id))
            } else {
                (0u8, entry.key.clone(), None)
            };

            let write_len = off + 1 + 2 + inline_key.len();
            if write_len > out.len() {
                return Err(Error::LimitsReached);
            }
            let flags_off = off;
            off += 1;
            out[off..off + 2].copy_from_slice(&(inline_key.len() as u16).to_le_bytes());
            off += 2;
            out[off..off + inline_key.len()].copy_from_slice(&inline_key);
            off += inline_key.len();

            if let Some(id) = key_blob {
                if off + 8 > out.len() {
                    return Err(Error::LimitsReached);
                }
                out[off..off + 8].copy_from_slice(&id.address().to_le_bytes());
                off += 8;
                if matches!(id, BlobId::InMemory(_)) {
                    flags |= BLOB_IS_IN_MEMORY;
                }
            }

            match &entry.value {
                NodeValue::Record(RecordValue::Inline(data)) => {
                    flags |= VALUE_INLINE;
                    if off + 2 + data.len() > out.len() {
                        return Err(Error::LimitsReached);
                    }
                    out[off..off + 2].copy_from_slice(&(data.len() as u16).to_le_bytes());
                    off += 2;
                    out[off..off + data.len()].copy_from_slice(data);
                    off += data.len();
                }
                NodeValue::Record(RecordValue::Blob(id)) => {
                    flags |= VALUE_BLOB;
                    if matches!(id, BlobId::InMemory(_)) {
                        flags |= BLOB_IS_IN_MEMORY;
                    }
                    if off + 8 > out.len() {
                        return Err(Error::LimitsReached);
                    }
                    out[off..off + 8].copy_from_slice(&id.address().to_le_bytes());
                    off += 8;
                }
                NodeValue::Record(RecordValue::Duplicates(id)) => {
                    flags |= VALUE_DUPLICATES;
                    if matches!(id, BlobId::InMemory(_)) {
                        flags |= BLOB_IS_IN_MEMORY;
                    }
                    if off + 8 > out.len() {
                        return Err(Error::LimitsReached);
                    }
                    out[off..off + 8].copy_from_slice(&id.address().to_le_bytes());
                    off += 8;
                }
                NodeValue::Child(child) => {
                    if off + 8 > out.len() {
                        return Err(Error::LimitsReached);
                    }
                    out[off..off + 8].copy_from_slice(&child.to_le_bytes());
                    off += 8;
                }
            }

            out[flags_off] = flags;
        }

        // zero whatever's left so stale bytes from a previous, larger
        // encoding never get misread as entries.
        for b in &mut out[off..] {
            *b = 0;
        }
        Ok(())
    }

    /// Approximate encoded size; used to decide whether an entry fits
    /// before actually writing it, so a full node is detected before
    /// `encode` has to fail partway through.
    pub fn encoded_len(&self) -> usize {
        let mut len = NODE_HEADER_SIZE;
        for e in &self.entries {
            let key_len = if e.key_overflow.is_some() { INLINE_KEY_MAX } else { e.key.len() };
            len += 1 + 2 + key_len;
            if e.key_overflow.is_some() {
                len += 8;
            }
            len += match &e.value {
                NodeValue::Record(RecordValue::Inline(d)) => 2 + d.len(),
                NodeValue::Record(RecordValue::Blob(_)) | NodeValue::Record(RecordValue::Duplicates(_)) => 8,
                NodeValue::Child(_) => 8,
            };
        }
        len
    }

    /// Free every entry's overflow key blob. Used when a whole node is
    /// about to be discarded (database drop); record/duplicate blobs are
    /// the caller's responsibility, same as [`NodeEntry::free_key_overflow`].
    pub fn free_key_overflows(&self, bm: &BlobManager, pm: &mut PageManager) -> Result<()> {
        for entry in &self.entries {
            entry.free_key_overflow(bm, pm)?;
        }
        Ok(())
    }

    /// Insert `entry`, replacing any existing entry with the same key.
    /// Returns the index it landed at.
    pub fn insert_sorted(&mut self, entry: NodeEntry) -> usize {
        match self.search(&entry.key) {
            Ok(i) => {
                self.entries[i] = entry;
                i
            }
            Err(i) => {
                self.entries.insert(i, entry);
                i
            }
        }
    }
}
