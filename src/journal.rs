//! Logical journal: per-transaction operation log used to redo committed
//! work when the `aries_no_force` policy let a commit return before its
//! dirty pages reached disk. Uses a START/UPDATE/COMMIT/ABORT record
//! shape, but at the level of key/value operations rather than page
//! images -- that's [`crate::log::Log`]'s job.
//!
//! Recovery only trusts transactions that reached a `Commit` record;
//! anything still open (a `Begin` with no matching `Commit`) is treated
//! as if it had been aborted, same as a rollback-from-checkpoint scan.

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::device::Device;
use crate::error::Result;

const RECORD_BEGIN: u8 = 1;
const RECORD_INSERT: u8 = 2;
const RECORD_ERASE: u8 = 3;
const RECORD_COMMIT: u8 = 4;
const RECORD_ABORT: u8 = 5;

/// `record_type(1) + txn_id(8) + db(2)`, followed by a record-specific
/// payload for `Insert`/`Erase`.
const RECORD_PREFIX_SIZE: usize = 1 + 8 + 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalOp {
    Insert { key: Vec<u8>, value: Vec<u8> },
    Erase { key: Vec<u8> },
}

/// One redoable operation recovered from a committed transaction, in the
/// order it was originally applied.
#[derive(Debug, Clone)]
pub struct RecoveredOp {
    pub txn_id: u64,
    pub db: u16,
    pub op: JournalOp,
}

pub struct Journal {
    device: Box<dyn Device>,
    tail: u64,
}

impl Journal {
    pub fn new(device: Box<dyn Device>) -> Self {
        Self { device, tail: 0 }
    }

    pub fn open(device: Box<dyn Device>) -> Result<Self> {
        let mut journal = Self { device, tail: 0 };
        journal.tail = journal.device.file_size()?;
        Ok(journal)
    }

    pub fn is_empty(&self) -> bool {
        self.tail == 0
    }

    fn append(&mut self, record_type: u8, txn_id: u64, db: u16, payload: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(RECORD_PREFIX_SIZE + 4 + payload.len());
        buf.push(record_type);
        buf.extend_from_slice(&txn_id.to_le_bytes());
        buf.extend_from_slice(&db.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        self.device.write(self.tail, &buf)?;
        self.tail += buf.len() as u64;
        Ok(())
    }

    pub fn append_begin(&mut self, txn_id: u64) -> Result<()> {
        self.append(RECORD_BEGIN, txn_id, 0, &[])?;
        debug!("journal: begin txn={}", txn_id);
        Ok(())
    }

    pub fn append_insert(&mut self, txn_id: u64, db: u16, key: &[u8], value: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(4 + key.len() + value.len());
        payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
        payload.extend_from_slice(key);
        payload.extend_from_slice(value);
        self.append(RECORD_INSERT, txn_id, db, &payload)
    }

    pub fn append_erase(&mut self, txn_id: u64, db: u16, key: &[u8]) -> Result<()> {
        self.append(RECORD_ERASE, txn_id, db, key)
    }

    pub fn append_commit(&mut self, txn_id: u64) -> Result<()> {
        self.append(RECORD_COMMIT, txn_id, 0, &[])?;
        self.device.flush()?;
        debug!("journal: commit txn={}", txn_id);
        Ok(())
    }

    pub fn append_abort(&mut self, txn_id: u64) -> Result<()> {
        self.append(RECORD_ABORT, txn_id, 0, &[])?;
        debug!("journal: abort txn={}", txn_id);
        Ok(())
    }

    /// Replay every operation belonging to a transaction that reached
    /// `Commit`, in original append order. Transactions with no commit
    /// record (an in-flight or explicitly aborted transaction) contribute
    /// nothing.
    pub fn recover(&mut self) -> Result<Vec<RecoveredOp>> {
        let size = self.device.file_size()?;
        let mut offset = 0u64;
        let mut pending: HashMap<u64, Vec<RecoveredOp>> = HashMap::new();
        let mut committed = Vec::new();

        while offset + RECORD_PREFIX_SIZE as u64 + 4 <= size {
            let mut prefix = [0u8; RECORD_PREFIX_SIZE + 4];
            self.device.read(offset, &mut prefix)?;
            let record_type = prefix[0];
            let txn_id = u64::from_le_bytes(prefix[1..9].try_into().unwrap());
            let db = u16::from_le_bytes(prefix[9..11].try_into().unwrap());
            let payload_len = u32::from_le_bytes(prefix[11..15].try_into().unwrap()) as u64;
            let payload_start = offset + RECORD_PREFIX_SIZE as u64 + 4;
            let record_end = payload_start + payload_len;
            if record_end > size {
                warn!("journal: truncated trailing record at offset {}, discarding", offset);
                break;
            }

            match record_type {
                RECORD_BEGIN => {
                    pending.entry(txn_id).or_default();
                }
                RECORD_INSERT => {
                    let mut payload = vec![0u8; payload_len as usize];
                    self.device.read(payload_start, &mut payload)?;
                    let key_len = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
                    let key = payload[4..4 + key_len].to_vec();
                    let value = payload[4 + key_len..].to_vec();
                    pending.entry(txn_id).or_default().push(RecoveredOp {
                        txn_id,
                        db,
                        op: JournalOp::Insert { key, value },
                    });
                }
                RECORD_ERASE => {
                    let mut key = vec![0u8; payload_len as usize];
                    self.device.read(payload_start, &mut key)?;
                    pending.entry(txn_id).or_default().push(RecoveredOp {
                        txn_id,
                        db,
                        op: JournalOp::Erase { key },
                    });
                }
                RECORD_COMMIT => {
                    if let Some(ops) = pending.remove(&txn_id) {
                        committed.extend(ops);
                    }
                }
                RECORD_ABORT => {
                    pending.remove(&txn_id);
                }
                other => {
                    warn!("journal: unknown record type {} at offset {}, stopping replay", other, offset);
                    break;
                }
            }
            offset = record_end;
        }

        if !pending.is_empty() {
            info!(
                "journal: discarding {} transaction(s) with no commit record",
                pending.len()
            );
        }
        info!("journal: recovered {} operation(s)", committed.len());
        Ok(committed)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.device.truncate(0)?;
        self.tail = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    #[test]
    fn recover_replays_only_committed_transactions() {
        let mut journal = Journal::new(Box::new(MemoryDevice::new(64)));
        journal.append_begin(1).unwrap();
        journal.append_insert(1, 0, b"a", b"1").unwrap();
        journal.append_commit(1).unwrap();

        journal.append_begin(2).unwrap();
        journal.append_insert(2, 0, b"b", b"2").unwrap();
        // txn 2 never commits: simulates a crash before its commit record.

        let ops = journal.recover().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(
            ops[0].op,
            JournalOp::Insert {
                key: b"a".to_vec(),
                value: b"1".to_vec()
            }
        );
    }

    #[test]
    fn explicit_abort_drops_its_operations() {
        let mut journal = Journal::new(Box::new(MemoryDevice::new(64)));
        journal.append_begin(1).unwrap();
        journal.append_erase(1, 0, b"k").unwrap();
        journal.append_abort(1).unwrap();

        let ops = journal.recover().unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn interleaved_transactions_each_recover_independently() {
        let mut journal = Journal::new(Box::new(MemoryDevice::new(64)));
        journal.append_begin(1).unwrap();
        journal.append_begin(2).unwrap();
        journal.append_insert(1, 0, b"a", b"1").unwrap();
        journal.append_insert(2, 0, b"b", b"2").unwrap();
        journal.append_commit(2).unwrap();
        journal.append_commit(1).unwrap();

        let ops = journal.recover().unwrap();
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn clear_empties_the_journal() {
        let mut journal = Journal::new(Box::new(MemoryDevice::new(64)));
        journal.append_begin(1).unwrap();
        journal.append_commit(1).unwrap();
        journal.clear().unwrap();
        assert!(journal.is_empty());
        assert!(journal.recover().unwrap().is_empty());
    }
}
