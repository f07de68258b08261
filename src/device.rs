//! Raw byte storage backing an [`Environment`](crate::environment::Environment).
//!
//! Two concrete devices exist: [`FileDevice`], a real file on disk, and
//! [`MemoryDevice`], a growable in-memory region used for transient or
//! test-only environments. Both implement [`Device`] and never cache --
//! caching is the [`crate::cache::Cache`]'s job.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// Byte-range I/O bypassing any page cache.
///
/// `alloc` extends the backing store by `aligned_size` bytes and returns
/// the offset of the new region; callers are responsible for keeping
/// `aligned_size` a multiple of the page size where that matters.
pub trait Device: std::fmt::Debug {
    fn pagesize(&self) -> u32;
    fn set_pagesize(&mut self, pagesize: u32);

    fn is_open(&self) -> bool;
    fn close(&mut self) -> Result<()>;

    fn alloc(&mut self, aligned_size: u64) -> Result<u64>;
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Current size of the backing store in bytes.
    fn file_size(&self) -> Result<u64>;
    /// Truncate (or, for the log, discard) the backing store to `size` bytes.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Request an OS-level durability hint; used when fsync is configured.
    fn flush(&mut self) -> Result<()>;

    /// True for the in-memory variant; the `Environment` uses this to skip
    /// log/journal/freelist work entirely.
    fn is_in_memory(&self) -> bool {
        false
    }

    fn alloc_page(&mut self, page_size: u32) -> Result<u64> {
        self.alloc(page_size as u64)
    }

    fn read_page(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.read(address, buf)
    }

    fn write_page(&mut self, address: u64, buf: &[u8]) -> Result<()> {
        self.write(address, buf)
    }

    /// Devices never reclaim file space themselves -- that's the
    /// freelist's job. This exists only so higher layers have a single
    /// symmetric `alloc_page`/`free_page` vocabulary.
    fn free_page(&mut self, _address: u64) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct FileDevice {
    file: File,
    pagesize: u32,
    open: bool,
}

impl FileDevice {
    pub fn create<P: AsRef<Path>>(path: P, pagesize: u32, mode: u32) -> Result<Self> {
        #[cfg(unix)]
        let file = {
            use std::os::unix::fs::OpenOptionsExt;
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .mode(mode)
                .open(path)?
        };
        #[cfg(not(unix))]
        let file = {
            let _ = mode;
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?
        };
        Ok(Self {
            file,
            pagesize,
            open: true,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, pagesize: u32) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::FileNotFound);
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file,
            pagesize,
            open: true,
        })
    }
}

impl Device for FileDevice {
    fn pagesize(&self) -> u32 {
        self.pagesize
    }

    fn set_pagesize(&mut self, pagesize: u32) {
        self.pagesize = pagesize;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn alloc(&mut self, aligned_size: u64) -> Result<u64> {
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.set_len(offset + aligned_size)?;
        Ok(offset)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        self.file.seek(SeekFrom::Start(size))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Growable in-memory region. No log/journal/freelist path ever touches
/// this device; the `Environment` detects `is_in_memory()` and skips that
/// machinery entirely.
#[derive(Debug, Default)]
pub struct MemoryDevice {
    buf: Vec<u8>,
    pagesize: u32,
    open: bool,
}

impl MemoryDevice {
    pub fn new(pagesize: u32) -> Self {
        Self {
            buf: Vec::new(),
            pagesize,
            open: true,
        }
    }
}

impl Device for MemoryDevice {
    fn pagesize(&self) -> u32 {
        self.pagesize
    }

    fn set_pagesize(&mut self, pagesize: u32) {
        self.pagesize = pagesize;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn alloc(&mut self, aligned_size: u64) -> Result<u64> {
        let offset = self.buf.len() as u64;
        self.buf.resize(self.buf.len() + aligned_size as usize, 0);
        Ok(offset)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.buf.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of in-memory device",
            )));
        }
        buf.copy_from_slice(&self.buf[start..end]);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.buf.len() as u64)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.buf.truncate(size as usize);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_in_memory(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_device_alloc_read_write_roundtrip() {
        let mut dev = MemoryDevice::new(1024);
        let addr = dev.alloc(1024).unwrap();
        assert_eq!(addr, 0);
        dev.write(addr, &[7u8; 1024]).unwrap();
        let mut buf = [0u8; 1024];
        dev.read(addr, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 1024]);
    }

    #[test]
    fn memory_device_read_past_end_errors() {
        let dev = MemoryDevice::new(1024);
        let mut buf = [0u8; 16];
        assert!(dev.read(0, &mut buf).is_err());
    }

    #[test]
    fn file_device_create_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.db");
        {
            let mut dev = FileDevice::create(&path, 1024, 0o644).unwrap();
            let addr = dev.alloc(1024).unwrap();
            dev.write(addr, &[9u8; 1024]).unwrap();
            dev.flush().unwrap();
        }
        let dev = FileDevice::open(&path, 1024).unwrap();
        let mut buf = [0u8; 1024];
        dev.read(0, &mut buf).unwrap();
        assert_eq!(buf, [9u8; 1024]);
    }

    #[test]
    fn file_device_open_missing_file_fails() {
        let result = FileDevice::open("/nonexistent/path/to/db", 1024);
        assert!(matches!(result, Err(Error::FileNotFound)));
    }
}
