//! A cursor walks the leaf chain one slot at a time. Position is
//! `(leaf page, slot index)`; the leaf chain's `left_sibling`/
//! `right_sibling` links mean `move_next`/`move_prev` never have to
//! re-descend from the root.
//!
//! A freshly created cursor, or one that has walked off either end of
//! the index, is nil -- every other method returns `Error::CursorIsNil`
//! until a `move_first`/`move_last`/`find` repositions it.

use crate::blob::BlobManager;
use crate::error::{Error, Result};
use crate::page::PageId;
use crate::page_manager::PageManager;

use super::index::{BtreeIndex, Found};
use super::node::{BtreeNode, NodeValue, RecordValue};

#[derive(Clone, Copy, PartialEq, Eq)]
struct Position {
    leaf: PageId,
    slot: usize,
}

pub struct Cursor {
    position: Option<Position>,
}

impl Cursor {
    pub fn new() -> Self {
        Self { position: None }
    }

    pub fn is_nil(&self) -> bool {
        self.position.is_none()
    }

    fn read_leaf(pm: &mut PageManager, bm: &BlobManager, addr: PageId) -> Result<BtreeNode> {
        let bytes = pm
            .fetch_page(addr, false)?
            .expect("fetch_page always returns Some unless only_from_cache")
            .usable_payload()
            .to_vec();
        BtreeNode::decode(&bytes, bm, pm)
    }

    fn leftmost_leaf(index: &BtreeIndex, pm: &mut PageManager, bm: &BlobManager) -> Result<PageId> {
        let mut addr = index.root;
        loop {
            let node = Self::read_leaf(pm, bm, addr)?;
            if node.is_leaf {
                return Ok(addr);
            }
            addr = node.leftmost_child;
        }
    }

    fn rightmost_leaf(index: &BtreeIndex, pm: &mut PageManager, bm: &BlobManager) -> Result<PageId> {
        let mut addr = index.root;
        loop {
            let node = Self::read_leaf(pm, bm, addr)?;
            if node.is_leaf {
                return Ok(addr);
            }
            addr = match node.entries.last() {
                Some(e) => match &e.value {
                    NodeValue::Child(c) => *c,
                    NodeValue::Record(_) => unreachable!("internal node holds only children"),
                },
                None => node.leftmost_child,
            };
        }
    }

    /// Land on the first (lowest-keyed) entry in the index. Clears the
    /// cursor to nil if the index is empty.
    pub fn move_first(&mut self, index: &BtreeIndex, pm: &mut PageManager, bm: &BlobManager) -> Result<()> {
        let leaf = Self::leftmost_leaf(index, pm, bm)?;
        let node = Self::read_leaf(pm, bm, leaf)?;
        self.position = if node.entries.is_empty() {
            None
        } else {
            Some(Position { leaf, slot: 0 })
        };
        Ok(())
    }

    pub fn move_last(&mut self, index: &BtreeIndex, pm: &mut PageManager, bm: &BlobManager) -> Result<()> {
        let leaf = Self::rightmost_leaf(index, pm, bm)?;
        let node = Self::read_leaf(pm, bm, leaf)?;
        self.position = if node.entries.is_empty() {
            None
        } else {
            Some(Position {
                leaf,
                slot: node.entries.len() - 1,
            })
        };
        Ok(())
    }

    /// Position the cursor on `key`. Leaves it nil (and returns
    /// `Error::KeyNotFound`) if the key isn't present.
    pub fn find(&mut self, index: &BtreeIndex, pm: &mut PageManager, bm: &BlobManager, key: &[u8]) -> Result<()> {
        let mut addr = index.root;
        loop {
            let node = Self::read_leaf(pm, bm, addr)?;
            if node.is_leaf {
                match node.search(key) {
                    Ok(slot) => {
                        self.position = Some(Position { leaf: addr, slot });
                        return Ok(());
                    }
                    Err(_) => {
                        self.position = None;
                        return Err(Error::KeyNotFound);
                    }
                }
            }
            addr = node.child_for(key);
        }
    }

    pub fn move_next(&mut self, pm: &mut PageManager, bm: &BlobManager) -> Result<()> {
        let Some(pos) = self.position else {
            return Err(Error::CursorIsNil);
        };
        let node = Self::read_leaf(pm, bm, pos.leaf)?;
        if pos.slot + 1 < node.entries.len() {
            self.position = Some(Position {
                leaf: pos.leaf,
                slot: pos.slot + 1,
            });
            return Ok(());
        }
        if node.right_sibling == 0 {
            self.position = None;
            return Ok(());
        }
        let next = Self::read_leaf(pm, bm, node.right_sibling)?;
        self.position = if next.entries.is_empty() {
            None
        } else {
            Some(Position {
                leaf: node.right_sibling,
                slot: 0,
            })
        };
        Ok(())
    }

    pub fn move_prev(&mut self, pm: &mut PageManager, bm: &BlobManager) -> Result<()> {
        let Some(pos) = self.position else {
            return Err(Error::CursorIsNil);
        };
        if pos.slot > 0 {
            self.position = Some(Position {
                leaf: pos.leaf,
                slot: pos.slot - 1,
            });
            return Ok(());
        }
        let node = Self::read_leaf(pm, bm, pos.leaf)?;
        if node.left_sibling == 0 {
            self.position = None;
            return Ok(());
        }
        let prev = Self::read_leaf(pm, bm, node.left_sibling)?;
        self.position = if prev.entries.is_empty() {
            None
        } else {
            Some(Position {
                leaf: node.left_sibling,
                slot: prev.entries.len() - 1,
            })
        };
        Ok(())
    }

    pub fn key(&self, pm: &mut PageManager, bm: &BlobManager) -> Result<Vec<u8>> {
        let pos = self.position.ok_or(Error::CursorIsNil)?;
        let node = Self::read_leaf(pm, bm, pos.leaf)?;
        Ok(node.entries[pos.slot].key.clone())
    }

    pub fn record(&self, pm: &mut PageManager, bm: &BlobManager) -> Result<Found> {
        let pos = self.position.ok_or(Error::CursorIsNil)?;
        let node = Self::read_leaf(pm, bm, pos.leaf)?;
        match &node.entries[pos.slot].value {
            NodeValue::Record(RecordValue::Inline(d)) => Ok(Found::Single(d.clone())),
            NodeValue::Record(RecordValue::Blob(id)) => Ok(Found::Single(bm.read(pm, *id)?)),
            NodeValue::Record(RecordValue::Duplicates(id)) => Ok(Found::Duplicates(*id)),
            NodeValue::Child(_) => unreachable!("leaf node holds only records"),
        }
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobManager;
    use crate::device::MemoryDevice;

    fn setup() -> (PageManager, BlobManager) {
        let pm = PageManager::new(Box::new(MemoryDevice::new(256)), 1 << 20, 64, false);
        let bm = BlobManager::new(64, 256, false);
        (pm, bm)
    }

    #[test]
    fn move_first_and_next_walk_in_key_order() {
        let (mut pm, bm) = setup();
        let mut index = BtreeIndex::create(&mut pm, 1, false).unwrap();
        for (k, v) in [(b"b".to_vec(), b"2"), (b"a".to_vec(), b"1"), (b"c".to_vec(), b"3")] {
            index.insert(&mut pm, &bm, &k, v, None).unwrap();
        }

        let mut cursor = Cursor::new();
        cursor.move_first(&index, &mut pm, &bm).unwrap();
        let mut seen = Vec::new();
        while !cursor.is_nil() {
            seen.push(cursor.key(&mut pm, &bm).unwrap());
            cursor.move_next(&mut pm, &bm).unwrap();
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn find_missing_key_leaves_cursor_nil() {
        let (mut pm, bm) = setup();
        let index = BtreeIndex::create(&mut pm, 1, false).unwrap();
        let mut cursor = Cursor::new();
        assert!(cursor.find(&index, &mut pm, &bm, b"missing").is_err());
        assert!(cursor.is_nil());
    }

    #[test]
    fn move_last_then_prev_walks_backwards() {
        let (mut pm, bm) = setup();
        let mut index = BtreeIndex::create(&mut pm, 1, false).unwrap();
        for k in [b"a", b"b", b"c"] {
            index.insert(&mut pm, &bm, k, b"v", None).unwrap();
        }
        let mut cursor = Cursor::new();
        cursor.move_last(&index, &mut pm, &bm).unwrap();
        assert_eq!(cursor.key(&mut pm, &bm).unwrap(), b"c".to_vec());
        cursor.move_prev(&mut pm, &bm).unwrap();
        assert_eq!(cursor.key(&mut pm, &bm).unwrap(), b"b".to_vec());
    }
}
