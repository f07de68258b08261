//! Physical redo log: whole-page-image records written ahead of the page
//! cache flush that makes them durable. Uses a sequential-append/replay
//! shape, recording page bytes rather than record-level before/after
//! tuples.
//!
//! A changeset (the set of pages one commit touches) is written as a run
//! of `PageImage` records followed by a `ChangesetEnd` marker. Recovery
//! replays only changesets whose end marker was actually written --
//! a crash between the last page-image append and the end marker leaves
//! an incomplete trailing run that is discarded, redoing only what's
//! provably durable.

use log::{debug, info, warn};

use crate::device::Device;
use crate::error::Result;

const RECORD_PAGE_IMAGE: u8 = 1;
const RECORD_CHANGESET_END: u8 = 2;

/// `record_type(1) + lsn(8) + address(8) + payload_len(4)`, followed by
/// `payload_len` bytes of page image for `PageImage` records (zero for
/// `ChangesetEnd`).
const RECORD_HEADER_SIZE: usize = 1 + 8 + 8 + 4;

struct RecordHeader {
    record_type: u8,
    lsn: u64,
    address: u64,
    payload_len: u32,
}

impl RecordHeader {
    fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[0] = self.record_type;
        buf[1..9].copy_from_slice(&self.lsn.to_le_bytes());
        buf[9..17].copy_from_slice(&self.address.to_le_bytes());
        buf[17..21].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            record_type: buf[0],
            lsn: u64::from_le_bytes(buf[1..9].try_into().unwrap()),
            address: u64::from_le_bytes(buf[9..17].try_into().unwrap()),
            payload_len: u32::from_le_bytes(buf[17..21].try_into().unwrap()),
        }
    }
}

/// One page image recovered from a complete changeset, ready to be
/// replayed onto the main device.
pub struct RecoveredPage {
    pub address: u64,
    pub bytes: Vec<u8>,
}

pub struct Log {
    device: Box<dyn Device>,
    tail: u64,
    last_complete_lsn: u64,
}

impl Log {
    /// Wrap a freshly created (empty) log device.
    pub fn new(device: Box<dyn Device>) -> Self {
        Self {
            device,
            tail: 0,
            last_complete_lsn: 0,
        }
    }

    /// Re-open an existing log file, scanning it to find the append tail
    /// and the highest `lsn` seen in a `ChangesetEnd` marker.
    pub fn open(device: Box<dyn Device>) -> Result<Self> {
        let mut log = Self {
            device,
            tail: 0,
            last_complete_lsn: 0,
        };
        log.scan_tail()?;
        Ok(log)
    }

    fn scan_tail(&mut self) -> Result<()> {
        let size = self.device.file_size()?;
        let mut offset = 0u64;
        while offset + RECORD_HEADER_SIZE as u64 <= size {
            let mut header_buf = [0u8; RECORD_HEADER_SIZE];
            self.device.read(offset, &mut header_buf)?;
            let header = RecordHeader::decode(&header_buf);
            let record_end = offset + RECORD_HEADER_SIZE as u64 + header.payload_len as u64;
            if record_end > size {
                break;
            }
            if header.record_type == RECORD_CHANGESET_END {
                self.last_complete_lsn = header.lsn;
            }
            offset = record_end;
        }
        self.tail = offset;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.tail == 0
    }

    pub fn last_complete_lsn(&self) -> u64 {
        self.last_complete_lsn
    }

    fn append_record(&mut self, header: RecordHeader, payload: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(payload);
        self.device.write(self.tail, &buf)?;
        self.tail += buf.len() as u64;
        Ok(())
    }

    /// Append one page's before-the-flush image under `lsn`.
    pub fn append_page_image(&mut self, lsn: u64, address: u64, bytes: &[u8]) -> Result<()> {
        self.append_record(
            RecordHeader {
                record_type: RECORD_PAGE_IMAGE,
                lsn,
                address,
                payload_len: bytes.len() as u32,
            },
            bytes,
        )?;
        debug!("log: appended page image lsn={} address={}", lsn, address);
        Ok(())
    }

    /// Close out a changeset: everything appended since the previous
    /// `ChangesetEnd` is now provably durable under `lsn`.
    pub fn append_changeset_end(&mut self, lsn: u64) -> Result<()> {
        self.append_record(
            RecordHeader {
                record_type: RECORD_CHANGESET_END,
                lsn,
                address: 0,
                payload_len: 0,
            },
            &[],
        )?;
        self.device.flush()?;
        self.last_complete_lsn = lsn;
        debug!("log: closed changeset lsn={}", lsn);
        Ok(())
    }

    /// Replay every complete changeset, returning its page images in
    /// append order (a later image for the same address in a later
    /// changeset naturally supersedes an earlier one when applied in
    /// order). A trailing, unterminated changeset is discarded.
    pub fn recover(&mut self) -> Result<Vec<RecoveredPage>> {
        let size = self.device.file_size()?;
        let mut offset = 0u64;
        let mut pending = Vec::new();
        let mut recovered = Vec::new();
        while offset + RECORD_HEADER_SIZE as u64 <= size {
            let mut header_buf = [0u8; RECORD_HEADER_SIZE];
            self.device.read(offset, &mut header_buf)?;
            let header = RecordHeader::decode(&header_buf);
            let payload_start = offset + RECORD_HEADER_SIZE as u64;
            let record_end = payload_start + header.payload_len as u64;
            if record_end > size {
                warn!("log: truncated trailing record at offset {}, discarding", offset);
                break;
            }
            match header.record_type {
                RECORD_PAGE_IMAGE => {
                    let mut bytes = vec![0u8; header.payload_len as usize];
                    self.device.read(payload_start, &mut bytes)?;
                    pending.push(RecoveredPage {
                        address: header.address,
                        bytes,
                    });
                }
                RECORD_CHANGESET_END => {
                    recovered.append(&mut pending);
                    pending.clear();
                }
                other => {
                    warn!("log: unknown record type {} at offset {}, stopping replay", other, offset);
                    break;
                }
            }
            offset = record_end;
        }
        if !pending.is_empty() {
            info!(
                "log: discarding {} page image(s) from an incomplete trailing changeset",
                pending.len()
            );
        }
        info!("log: recovered {} page image(s)", recovered.len());
        Ok(recovered)
    }

    /// Discard the log's contents after a successful recovery or a
    /// clean shutdown checkpoint.
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
    fn recover_replays_only_complete_changesets() {
        let mut log = Log::new(Box::new(MemoryDevice::new(256)));
        log.append_page_image(1, 4096, &[1u8; 16]).unwrap();
        log.append_page_image(1, 8192, &[2u8; 16]).unwrap();
        log.append_changeset_end(1).unwrap();
        // simulate a crash mid-changeset: no matching end record.
        log.append_page_image(2, 4096, &[9u8; 16]).unwrap();

        let recovered = log.recover().unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[0].address, 4096);
        assert_eq!(recovered[0].bytes, vec![1u8; 16]);
        assert_eq!(recovered[1].bytes, vec![2u8; 16]);
    }

    #[test]
    fn later_changeset_supersedes_earlier_image_for_same_address() {
        let mut log = Log::new(Box::new(MemoryDevice::new(256)));
        log.append_page_image(1, 4096, &[1u8; 8]).unwrap();
        log.append_changeset_end(1).unwrap();
        log.append_page_image(2, 4096, &[2u8; 8]).unwrap();
        log.append_changeset_end(2).unwrap();

        let recovered = log.recover().unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered.last().unwrap().bytes, vec![2u8; 8]);
    }

    #[test]
    fn clear_truncates_log_to_empty() {
        let mut log = Log::new(Box::new(MemoryDevice::new(256)));
        log.append_page_image(1, 4096, &[1u8; 8]).unwrap();
        log.append_changeset_end(1).unwrap();
        log.clear().unwrap();
        assert!(log.is_empty());
        assert!(log.recover().unwrap().is_empty());
    }

    #[test]
    fn open_scans_existing_log_to_find_tail_and_last_lsn() {
        let mut log = Log::new(Box::new(MemoryDevice::new(256)));
        log.append_page_image(1, 4096, &[1u8; 8]).unwrap();
        log.append_changeset_end(5).unwrap();
        let tail = log.tail;

        // Re-open the same bytes as if we'd reloaded the process.
        let mut reopened_device = MemoryDevice::new(256);
        reopened_device.write(0, &vec![0u8; tail as usize]).unwrap();
        let mut buf = vec![0u8; tail as usize];
        log.device.read(0, &mut buf).unwrap();
        reopened_device.write(0, &buf).unwrap();

        let reopened = Log::open(Box::new(reopened_device)).unwrap();
        assert_eq!(reopened.tail, tail);
        assert_eq!(reopened.last_complete_lsn(), 5);
    }
}
