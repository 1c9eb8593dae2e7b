use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::page::Page;
use crate::replacer::{FrameId, LruReplacer, Replacer};
use crate::{DiskManager, PageId};

/// Errors returned by the buffer pool manager.
#[derive(Debug, Error)]
pub enum BufferPoolError {
    /// The buffer pool lock was poisoned.
    #[error("buffer pool lock poisoned")]
    LockPoisoned,
    /// The underlying disk manager failed.
    #[error("disk manager error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for buffer pool results.
pub type BufferPoolResult<T> = Result<T, BufferPoolError>;

/// Guard that provides access to a pinned page while holding the pool lock.
pub struct PageGuard<'a> {
    state: MutexGuard<'a, PoolState>,
    frame_id: FrameId,
}

impl Deref for PageGuard<'_> {
    type Target = Page;

    fn deref(&self) -> &Self::Target {
        &self.state.pages[self.frame_id]
    }
}

impl DerefMut for PageGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state.pages[self.frame_id]
    }
}

struct PoolState {
    disk_manager: DiskManager,
    replacer: LruReplacer,
    pages: Vec<Page>,
    page_table: HashMap<PageId, FrameId>,
    free_list: Vec<FrameId>,
}

/// Buffer pool manager caching pages between disk and memory.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<Mutex<PoolState>>,
}

impl BufferPoolManager {
    /// Creates a buffer pool with a fixed number of frames.
    pub fn new(disk_manager: DiskManager, pool_size: usize) -> Self {
        let state = PoolState {
            disk_manager,
            replacer: LruReplacer::new(pool_size),
            pages: vec![Page::new(); pool_size],
            page_table: HashMap::new(),
            free_list: (0..pool_size).rev().collect(),
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    fn lock_state(&self) -> BufferPoolResult<MutexGuard<'_, PoolState>> {
        self.inner.lock().map_err(|_| BufferPoolError::LockPoisoned)
    }

    fn take_frame(state: &mut PoolState) -> Option<FrameId> {
        state.free_list.pop().or_else(|| state.replacer.victim())
    }

    fn evict_resident(state: &mut PoolState, frame_id: FrameId) -> BufferPoolResult<()> {
        if let Some(old_page_id) = state.pages[frame_id].page_id {
            if state.pages[frame_id].is_dirty {
                let data = state.pages[frame_id].data;
                state.disk_manager.write_page(old_page_id, &data)?;
            }
            state.page_table.remove(&old_page_id);
        }
        Ok(())
    }

    /// Allocates a new page on disk and pins it; None when no frame is free.
    pub fn new_page(&self) -> BufferPoolResult<Option<PageId>> {
        let mut state = self.lock_state()?;
        let Some(frame_id) = Self::take_frame(&mut state) else {
            return Ok(None);
        };
        Self::evict_resident(&mut state, frame_id)?;

        let page_id = state.disk_manager.allocate_page()?;
        {
            let page = &mut state.pages[frame_id];
            page.reset();
            page.page_id = Some(page_id);
            page.pin_count = 1;
        }
        state.page_table.insert(page_id, frame_id);
        state.replacer.pin(frame_id);
        Ok(Some(page_id))
    }

    /// Fetches a page into memory and pins it behind a guard.
    pub fn fetch_page(&self, page_id: PageId) -> BufferPoolResult<Option<PageGuard<'_>>> {
        let mut state = self.lock_state()?;
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            state.pages[frame_id].pin_count += 1;
            state.replacer.pin(frame_id);
            return Ok(Some(PageGuard { state, frame_id }));
        }

        let Some(frame_id) = Self::take_frame(&mut state) else {
            return Ok(None);
        };
        Self::evict_resident(&mut state, frame_id)?;
        {
            let state = &mut *state;
            let page = &mut state.pages[frame_id];
            page.reset();
            state.disk_manager.read_page(page_id, page.data_mut())?;
            page.page_id = Some(page_id);
            page.pin_count = 1;
        }
        state.page_table.insert(page_id, frame_id);
        state.replacer.pin(frame_id);
        Ok(Some(PageGuard { state, frame_id }))
    }

    /// Unpins a page and optionally marks it dirty.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> BufferPoolResult<bool> {
        let mut state = self.lock_state()?;
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(false);
        };
        let page = &mut state.pages[frame_id];
        if page.pin_count == 0 {
            return Ok(false);
        }
        if is_dirty {
            page.is_dirty = true;
        }
        page.pin_count -= 1;
        if page.pin_count == 0 {
            state.replacer.unpin(frame_id);
        }
        Ok(true)
    }

    /// Flushes one page to disk, if resident.
    pub fn flush_page(&self, page_id: PageId) -> BufferPoolResult<bool> {
        let mut state = self.lock_state()?;
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(false);
        };
        let state = &mut *state;
        let page = &mut state.pages[frame_id];
        state.disk_manager.write_page(page_id, page.data())?;
        page.is_dirty = false;
        Ok(true)
    }

    /// Flushes every resident page to disk.
    pub fn flush_all_pages(&self) -> BufferPoolResult<()> {
        let mut state = self.lock_state()?;
        let state = &mut *state;
        for page in state.pages.iter_mut() {
            if let Some(page_id) = page.page_id {
                state.disk_manager.write_page(page_id, page.data())?;
                page.is_dirty = false;
            }
        }
        Ok(())
    }
}
