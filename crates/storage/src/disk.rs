//! Page-file disk manager.
//!
//! Invariants:
//! - Page 0 is reserved for the allocation header (next_page_id as u64).
//! - Page ids grow monotonically and are never reused.
//! - The header is persisted after every allocation, data before header.

use std::fs::{File, OpenOptions};
use std::io::{Error, ErrorKind, Result};
use std::os::unix::fs::FileExt;
use std::path::Path;

pub type PageId = u64;
pub const PAGE_SIZE: usize = 4096;

struct FileHeader {
    next_page_id: PageId,
}

impl FileHeader {
    fn to_bytes(&self) -> [u8; PAGE_SIZE] {
        let mut buf = [0u8; PAGE_SIZE];
        buf[..8].copy_from_slice(&self.next_page_id.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[..8]);
        Self {
            next_page_id: PageId::from_le_bytes(raw),
        }
    }
}

/// Disk manager owning a single page file.
pub struct DiskManager {
    file: File,
    header: FileHeader,
}

impl DiskManager {
    /// Opens or creates the page file and loads the allocation header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let header = Self::load_or_init_header(&file)?;
        Ok(Self { file, header })
    }

    fn load_or_init_header(file: &File) -> Result<FileHeader> {
        if file.metadata()?.len() < PAGE_SIZE as u64 {
            let header = FileHeader { next_page_id: 1 };
            file.write_at(&header.to_bytes(), 0)?;
            Ok(header)
        } else {
            let mut buf = [0u8; PAGE_SIZE];
            file.read_at(&mut buf, 0)?;
            Ok(FileHeader::from_bytes(&buf))
        }
    }

    /// Reads the page at `page_id` into `buf`, which must be exactly one page.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            return Err(Error::new(ErrorKind::InvalidInput, "buffer is not one page"));
        }
        self.file.read_at(buf, page_id * PAGE_SIZE as u64)?;
        Ok(())
    }

    /// Writes `buf` to the page at `page_id`.
    pub fn write_page(&mut self, page_id: PageId, buf: &[u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            return Err(Error::new(ErrorKind::InvalidInput, "buffer is not one page"));
        }
        self.file.write_at(buf, page_id * PAGE_SIZE as u64)?;
        Ok(())
    }

    /// Forces buffered data to disk.
    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data()
    }

    /// Allocates a fresh zeroed page and persists the updated header.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        let page_id = self.header.next_page_id;
        let zeroed = [0u8; PAGE_SIZE];
        self.file.write_at(&zeroed, page_id * PAGE_SIZE as u64)?;
        self.header.next_page_id += 1;
        self.file.write_at(&self.header.to_bytes(), 0)?;
        self.file.sync_data()?;
        Ok(page_id)
    }

    /// Returns the id the next allocation will hand out.
    pub fn next_page_id(&self) -> PageId {
        self.header.next_page_id
    }
}
