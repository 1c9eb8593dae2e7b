//! Slotted-page row heap.
//!
//! Pages are chained through a next-page pointer in the header. Each page
//! keeps a slot directory growing down from the header while row payloads
//! grow up from the end of the page. Deleting a row zeroes its slot length
//! and leaves the slot in place, so surviving RIDs stay stable.

use storage::{BufferPoolManager, PageId, PAGE_SIZE};

use crate::error::{EngineError, EngineResult};
use crate::row::{decode_values, encode_values, DataType, Row};

const HEAP_HEADER_SIZE: usize = 16;
const SLOT_SIZE: usize = 8;
/// Sentinel for "no next page"; page 0 is the disk allocation header.
const NO_PAGE: u64 = 0;

/// Physical row address: page plus slot number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: u16,
}

#[derive(Debug, Clone, Copy)]
struct HeapPageHeader {
    next_page_id: u64,
    slot_count: u32,
    free_space_offset: u32,
}

impl HeapPageHeader {
    fn read(data: &[u8]) -> Self {
        Self {
            next_page_id: u64::from_le_bytes(data[0..8].try_into().unwrap_or_default()),
            slot_count: u32::from_le_bytes(data[8..12].try_into().unwrap_or_default()),
            free_space_offset: u32::from_le_bytes(data[12..16].try_into().unwrap_or_default()),
        }
    }

    fn write(&self, data: &mut [u8]) {
        data[0..8].copy_from_slice(&self.next_page_id.to_le_bytes());
        data[8..12].copy_from_slice(&self.slot_count.to_le_bytes());
        data[12..16].copy_from_slice(&self.free_space_offset.to_le_bytes());
    }

    fn fresh() -> Self {
        Self {
            next_page_id: NO_PAGE,
            slot_count: 0,
            free_space_offset: PAGE_SIZE as u32,
        }
    }

    fn free_space(&self) -> usize {
        self.free_space_offset as usize - HEAP_HEADER_SIZE - self.slot_count as usize * SLOT_SIZE
    }
}

fn slot_at(data: &[u8], slot: usize) -> (usize, usize) {
    let base = HEAP_HEADER_SIZE + slot * SLOT_SIZE;
    let offset = u32::from_le_bytes(data[base..base + 4].try_into().unwrap_or_default());
    let len = u32::from_le_bytes(data[base + 4..base + 8].try_into().unwrap_or_default());
    (offset as usize, len as usize)
}

fn write_slot(data: &mut [u8], slot: usize, offset: usize, len: usize) {
    let base = HEAP_HEADER_SIZE + slot * SLOT_SIZE;
    data[base..base + 4].copy_from_slice(&(offset as u32).to_le_bytes());
    data[base + 4..base + 8].copy_from_slice(&(len as u32).to_le_bytes());
}

/// Heap of rows for a single table.
#[derive(Clone)]
pub struct RowHeap {
    buffer_pool: BufferPoolManager,
    column_types: Vec<DataType>,
    first_page_id: PageId,
}

impl RowHeap {
    /// Creates an empty heap with one allocated page.
    pub fn create(
        buffer_pool: BufferPoolManager,
        column_types: Vec<DataType>,
    ) -> EngineResult<Self> {
        let first_page_id = allocate_page(&buffer_pool)?;
        init_heap_page(&buffer_pool, first_page_id)?;
        Ok(Self {
            buffer_pool,
            column_types,
            first_page_id,
        })
    }

    /// Reopens a heap whose first page is already on disk.
    pub fn open(
        buffer_pool: BufferPoolManager,
        column_types: Vec<DataType>,
        first_page_id: PageId,
    ) -> Self {
        Self {
            buffer_pool,
            column_types,
            first_page_id,
        }
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    pub fn column_types(&self) -> &[DataType] {
        &self.column_types
    }

    /// Inserts a row into the first page with enough free space, allocating a
    /// new page at the tail of the chain when none has room.
    pub fn insert(&self, row: &Row) -> EngineResult<Rid> {
        let bytes = encode_values(row, &self.column_types)?;
        if bytes.len() + SLOT_SIZE > PAGE_SIZE - HEAP_HEADER_SIZE {
            return Err(EngineError::Schema(format!(
                "row of {} bytes cannot fit in one page",
                bytes.len()
            )));
        }
        let mut page_id = self.first_page_id;
        loop {
            let (header, inserted) = self.try_insert_into(page_id, &bytes)?;
            if let Some(slot) = inserted {
                return Ok(Rid { page_id, slot });
            }
            if header.next_page_id != NO_PAGE {
                page_id = header.next_page_id;
                continue;
            }
            let new_page_id = allocate_page(&self.buffer_pool)?;
            init_heap_page(&self.buffer_pool, new_page_id)?;
            self.link_next(page_id, new_page_id)?;
            page_id = new_page_id;
        }
    }

    fn try_insert_into(
        &self,
        page_id: PageId,
        bytes: &[u8],
    ) -> EngineResult<(HeapPageHeader, Option<u16>)> {
        let mut guard = fetch(&self.buffer_pool, page_id)?;
        let mut header = HeapPageHeader::read(guard.data());
        if header.free_space() < bytes.len() + SLOT_SIZE {
            let header_copy = header;
            drop(guard);
            self.buffer_pool.unpin_page(page_id, false)?;
            return Ok((header_copy, None));
        }
        let offset = header.free_space_offset as usize - bytes.len();
        let slot = header.slot_count as usize;
        let data = guard.data_mut();
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        write_slot(data, slot, offset, bytes.len());
        header.slot_count += 1;
        header.free_space_offset = offset as u32;
        header.write(data);
        drop(guard);
        self.buffer_pool.unpin_page(page_id, true)?;
        Ok((header, Some(slot as u16)))
    }

    fn link_next(&self, page_id: PageId, next: PageId) -> EngineResult<()> {
        let mut guard = fetch(&self.buffer_pool, page_id)?;
        let mut header = HeapPageHeader::read(guard.data());
        header.next_page_id = next;
        header.write(guard.data_mut());
        drop(guard);
        self.buffer_pool.unpin_page(page_id, true)?;
        Ok(())
    }

    /// Fetches a row; None for tombstoned slots or out-of-range RIDs.
    pub fn get(&self, rid: Rid) -> EngineResult<Option<Row>> {
        let guard = fetch(&self.buffer_pool, rid.page_id)?;
        let header = HeapPageHeader::read(guard.data());
        if rid.slot as u32 >= header.slot_count {
            drop(guard);
            self.buffer_pool.unpin_page(rid.page_id, false)?;
            return Ok(None);
        }
        let (offset, len) = slot_at(guard.data(), rid.slot as usize);
        if len == 0 {
            drop(guard);
            self.buffer_pool.unpin_page(rid.page_id, false)?;
            return Ok(None);
        }
        let bytes = guard.data()[offset..offset + len].to_vec();
        drop(guard);
        self.buffer_pool.unpin_page(rid.page_id, false)?;
        Ok(Some(decode_values(&bytes, &self.column_types)?))
    }

    /// Tombstones a slot. Returns false when the slot is already empty.
    pub fn delete(&self, rid: Rid) -> EngineResult<bool> {
        let mut guard = fetch(&self.buffer_pool, rid.page_id)?;
        let header = HeapPageHeader::read(guard.data());
        if rid.slot as u32 >= header.slot_count {
            drop(guard);
            self.buffer_pool.unpin_page(rid.page_id, false)?;
            return Ok(false);
        }
        let (offset, len) = slot_at(guard.data(), rid.slot as usize);
        if len == 0 {
            drop(guard);
            self.buffer_pool.unpin_page(rid.page_id, false)?;
            return Ok(false);
        }
        write_slot(guard.data_mut(), rid.slot as usize, offset, 0);
        drop(guard);
        self.buffer_pool.unpin_page(rid.page_id, true)?;
        Ok(true)
    }

    /// Rewrites a row in place when the new encoding fits the old slot,
    /// otherwise deletes and reinserts, returning the (possibly new) RID.
    pub fn update(&self, rid: Rid, row: &Row) -> EngineResult<Rid> {
        let bytes = encode_values(row, &self.column_types)?;
        let mut guard = fetch(&self.buffer_pool, rid.page_id)?;
        let header = HeapPageHeader::read(guard.data());
        if rid.slot as u32 >= header.slot_count {
            drop(guard);
            self.buffer_pool.unpin_page(rid.page_id, false)?;
            return Err(EngineError::RowNotFound(rid));
        }
        let (offset, len) = slot_at(guard.data(), rid.slot as usize);
        if len == 0 {
            drop(guard);
            self.buffer_pool.unpin_page(rid.page_id, false)?;
            return Err(EngineError::RowNotFound(rid));
        }
        if bytes.len() <= len {
            let data = guard.data_mut();
            data[offset..offset + bytes.len()].copy_from_slice(&bytes);
            write_slot(data, rid.slot as usize, offset, bytes.len());
            drop(guard);
            self.buffer_pool.unpin_page(rid.page_id, true)?;
            return Ok(rid);
        }
        drop(guard);
        self.buffer_pool.unpin_page(rid.page_id, false)?;
        self.delete(rid)?;
        self.insert(row)
    }

    /// Visits every live row in page-chain order.
    pub fn scan(&self) -> EngineResult<Vec<(Rid, Row)>> {
        let mut rows = Vec::new();
        let mut page_id = self.first_page_id;
        loop {
            let guard = fetch(&self.buffer_pool, page_id)?;
            let header = HeapPageHeader::read(guard.data());
            let mut raw = Vec::new();
            for slot in 0..header.slot_count as usize {
                let (offset, len) = slot_at(guard.data(), slot);
                if len == 0 {
                    continue;
                }
                raw.push((slot as u16, guard.data()[offset..offset + len].to_vec()));
            }
            drop(guard);
            self.buffer_pool.unpin_page(page_id, false)?;
            for (slot, bytes) in raw {
                rows.push((
                    Rid { page_id, slot },
                    decode_values(&bytes, &self.column_types)?,
                ));
            }
            if header.next_page_id == NO_PAGE {
                return Ok(rows);
            }
            page_id = header.next_page_id;
        }
    }

    /// All page ids in the chain, in order. Used for lock acquisition.
    pub fn page_ids(&self) -> EngineResult<Vec<PageId>> {
        let mut ids = Vec::new();
        let mut page_id = self.first_page_id;
        loop {
            ids.push(page_id);
            let guard = fetch(&self.buffer_pool, page_id)?;
            let next = HeapPageHeader::read(guard.data()).next_page_id;
            drop(guard);
            self.buffer_pool.unpin_page(page_id, false)?;
            if next == NO_PAGE {
                return Ok(ids);
            }
            page_id = next;
        }
    }
}

pub(crate) fn allocate_page(buffer_pool: &BufferPoolManager) -> EngineResult<PageId> {
    let page_id = buffer_pool.new_page()?.ok_or(EngineError::PoolExhausted)?;
    // Drop the allocation pin; callers pin through fetch/unpin pairs.
    buffer_pool.unpin_page(page_id, true)?;
    Ok(page_id)
}

pub(crate) fn fetch(
    buffer_pool: &BufferPoolManager,
    page_id: PageId,
) -> EngineResult<storage::PageGuard<'_>> {
    buffer_pool
        .fetch_page(page_id)?
        .ok_or(EngineError::PoolExhausted)
}

fn init_heap_page(buffer_pool: &BufferPoolManager, page_id: PageId) -> EngineResult<()> {
    let mut guard = fetch(buffer_pool, page_id)?;
    HeapPageHeader::fresh().write(guard.data_mut());
    drop(guard);
    buffer_pool.unpin_page(page_id, true)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Value;
    use storage::DiskManager;
    use tempfile::TempDir;

    fn heap(dir: &TempDir) -> RowHeap {
        let path = dir.path().join("heap.db");
        let disk_manager = DiskManager::open(path.to_str().unwrap()).unwrap();
        let buffer_pool = BufferPoolManager::new(disk_manager, 16);
        RowHeap::create(
            buffer_pool,
            vec![DataType::Integer, DataType::Text],
        )
        .unwrap()
    }

    fn row(id: i64, name: &str) -> Row {
        vec![Value::Integer(id), Value::Text(name.into())]
    }

    #[test]
    fn insert_then_get() {
        let dir = TempDir::new().unwrap();
        let heap = heap(&dir);
        let rid = heap.insert(&row(1, "smith")).unwrap();
        assert_eq!(heap.get(rid).unwrap(), Some(row(1, "smith")));
    }

    #[test]
    fn delete_tombstones_and_keeps_other_rids_stable() {
        let dir = TempDir::new().unwrap();
        let heap = heap(&dir);
        let first = heap.insert(&row(1, "smith")).unwrap();
        let second = heap.insert(&row(2, "jones")).unwrap();
        assert!(heap.delete(first).unwrap());
        assert!(!heap.delete(first).unwrap());
        assert_eq!(heap.get(first).unwrap(), None);
        assert_eq!(heap.get(second).unwrap(), Some(row(2, "jones")));
    }

    #[test]
    fn update_in_place_keeps_rid() {
        let dir = TempDir::new().unwrap();
        let heap = heap(&dir);
        let rid = heap.insert(&row(1, "abcdef")).unwrap();
        let new_rid = heap.update(rid, &row(1, "abc")).unwrap();
        assert_eq!(new_rid, rid);
        assert_eq!(heap.get(rid).unwrap(), Some(row(1, "abc")));
    }

    #[test]
    fn growing_update_relocates() {
        let dir = TempDir::new().unwrap();
        let heap = heap(&dir);
        let rid = heap.insert(&row(1, "a")).unwrap();
        let big = "x".repeat(200);
        let new_rid = heap.update(rid, &row(1, &big)).unwrap();
        assert_ne!(new_rid, rid);
        assert_eq!(heap.get(rid).unwrap(), None);
        assert_eq!(heap.get(new_rid).unwrap(), Some(row(1, &big)));
    }

    #[test]
    fn insert_overflows_onto_new_page() {
        let dir = TempDir::new().unwrap();
        let heap = heap(&dir);
        let filler = "f".repeat(500);
        let mut rids = Vec::new();
        for i in 0..40 {
            rids.push(heap.insert(&row(i, &filler)).unwrap());
        }
        let pages = heap.page_ids().unwrap();
        assert!(pages.len() > 1, "expected the chain to grow");
        let scanned = heap.scan().unwrap();
        assert_eq!(scanned.len(), 40);
        assert_eq!(scanned.iter().map(|(rid, _)| *rid).collect::<Vec<_>>(), rids);
    }

    #[test]
    fn missing_update_reports_row_not_found() {
        let dir = TempDir::new().unwrap();
        let heap = heap(&dir);
        let rid = heap.insert(&row(1, "smith")).unwrap();
        heap.delete(rid).unwrap();
        assert!(matches!(
            heap.update(rid, &row(1, "jones")),
            Err(EngineError::RowNotFound(_))
        ));
    }
}
