use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::{BirchError, BufferPoolConfig, FrameId, PageId, Result, PAGE_SIZE};
use crate::hash::{ExtendibleHashTable, IdentityHashBuilder};
use crate::storage::disk::{DiskManager, DiskScheduler};

use super::{FrameHeader, LruReplacer, PageHandle, ReadPageGuard, WritePageGuard};

/// Maps resident page ids to the frames holding them
type PageTable = ExtendibleHashTable<PageId, FrameId, IdentityHashBuilder>;

/// State shared between the manager and the release callbacks of its guards
struct BufferPoolState {
    frames: Vec<Arc<FrameHeader>>,
    page_table: PageTable,
    /// Frames with a pin count of zero, eviction candidates
    replacer: LruReplacer<FrameId>,
    /// Frames holding no page. This mutex is also the pool's bookkeeping
    /// latch: every page table, pin count and replacer transition happens
    /// while it is held.
    free_list: Mutex<VecDeque<FrameId>>,
    disk_scheduler: DiskScheduler,
}

impl BufferPoolState {
    fn frame(&self, frame_id: FrameId) -> &Arc<FrameHeader> {
        &self.frames[frame_id.as_usize()]
    }

    /// Takes a frame from the free list, or evicts the least recently used
    /// unpinned page, writing it back first if dirty.
    fn acquire_frame(&self, free_list: &mut VecDeque<FrameId>) -> Result<FrameId> {
        if let Some(frame_id) = free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = self
            .replacer
            .select_victim()
            .ok_or(BirchError::BufferPoolFull)?;
        let frame = self.frame(frame_id);
        let victim = frame.page_id();

        if frame.is_dirty() {
            if let Err(e) = self.disk_scheduler.schedule_write_sync(victim, frame.snapshot()) {
                self.replacer.track(frame_id);
                return Err(e);
            }
        }

        self.page_table.remove(&victim);
        frame.reset();
        debug!(page_id = victim.as_u32(), frame_id = frame_id.as_u32(), "evicted page");
        Ok(frame_id)
    }

    /// Drops one pin on `page_id`. Returns false if the page is not resident
    /// or not pinned.
    fn unpin(&self, page_id: PageId, is_dirty: bool) -> bool {
        let _latch = self.free_list.lock();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return false;
        };
        let frame = self.frame(frame_id);
        if frame.pin_count() == 0 {
            return false;
        }

        if is_dirty {
            frame.set_dirty(true);
        }
        if let Some(0) = frame.unpin() {
            self.replacer.track(frame_id);
        }
        trace!(page_id = page_id.as_u32(), pin_count = frame.pin_count(), "unpinned page");
        true
    }
}

/// BufferPoolManager caches disk pages in a fixed number of frames.
///
/// Pages are pinned while any [`PageHandle`] or page guard for them is alive;
/// pinned pages are never evicted. Among unpinned pages the least recently
/// unpinned one is evicted first.
pub struct BufferPoolManager {
    pool_size: usize,
    state: Arc<BufferPoolState>,
}

impl BufferPoolManager {
    /// Creates a pool of `pool_size` frames over `disk_manager`.
    ///
    /// # Panics
    /// Panics if `pool_size` is zero; use [`BufferPoolManager::with_config`]
    /// to get an error instead.
    pub fn new(pool_size: usize, disk_manager: Arc<DiskManager>) -> Self {
        match Self::with_config(BufferPoolConfig::with_pool_size(pool_size), disk_manager) {
            Ok(bpm) => bpm,
            Err(e) => panic!("invalid buffer pool size: {}", e),
        }
    }

    pub fn with_config(config: BufferPoolConfig, disk_manager: Arc<DiskManager>) -> Result<Self> {
        config.validate()?;

        let mut frames = Vec::with_capacity(config.pool_size);
        let mut free_list = VecDeque::with_capacity(config.pool_size);
        for i in 0..config.pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(FrameHeader::new(frame_id)));
            free_list.push_back(frame_id);
        }

        let state = Arc::new(BufferPoolState {
            frames,
            page_table: ExtendibleHashTable::with_hasher(
                config.bucket_capacity,
                IdentityHashBuilder::default(),
            ),
            replacer: LruReplacer::new(),
            free_list: Mutex::new(free_list),
            disk_scheduler: DiskScheduler::new(disk_manager),
        });

        Ok(Self {
            pool_size: config.pool_size,
            state,
        })
    }

    fn handle(&self, page_id: PageId, frame_id: FrameId) -> PageHandle {
        let state = Arc::clone(&self.state);
        PageHandle::new(
            page_id,
            Arc::clone(self.state.frame(frame_id)),
            Box::new(move |pid, is_dirty| {
                state.unpin(pid, is_dirty);
            }),
        )
    }

    /// Pins `page_id`, reading it from disk if it is not resident.
    ///
    /// Fails with `BufferPoolFull` if the page must be read in and every
    /// frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PageHandle> {
        if !page_id.is_valid() {
            return Err(BirchError::InvalidPageId(page_id));
        }

        let mut free_list = self.state.free_list.lock();

        if let Some(frame_id) = self.state.page_table.find(&page_id) {
            let frame = self.state.frame(frame_id);
            frame.pin();
            self.state.replacer.untrack(frame_id);
            trace!(page_id = page_id.as_u32(), pin_count = frame.pin_count(), "pinned resident page");
            return Ok(self.handle(page_id, frame_id));
        }

        let frame_id = self.state.acquire_frame(&mut free_list)?;
        let contents = match self.state.disk_scheduler.schedule_read_sync(page_id) {
            Ok(contents) => contents,
            Err(e) => {
                free_list.push_back(frame_id);
                return Err(e);
            }
        };

        let frame = self.state.frame(frame_id);
        frame.load(page_id, &contents);
        frame.pin();
        self.state.page_table.insert(page_id, frame_id);
        trace!(page_id = page_id.as_u32(), frame_id = frame_id.as_u32(), "read page into pool");

        Ok(self.handle(page_id, frame_id))
    }

    /// Allocates a fresh zeroed page on disk and returns it pinned.
    pub fn new_page(&self) -> Result<PageHandle> {
        let mut free_list = self.state.free_list.lock();

        let frame_id = self.state.acquire_frame(&mut free_list)?;
        let page_id = match self.state.disk_scheduler.disk_manager().allocate_page() {
            Ok(page_id) => page_id,
            Err(e) => {
                free_list.push_back(frame_id);
                return Err(e);
            }
        };

        let frame = self.state.frame(frame_id);
        frame.load(page_id, &[0u8; PAGE_SIZE]);
        frame.pin();
        self.state.page_table.insert(page_id, frame_id);
        trace!(page_id = page_id.as_u32(), frame_id = frame_id.as_u32(), "allocated page");

        Ok(self.handle(page_id, frame_id))
    }

    /// Pins and shared-latches `page_id`.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<ReadPageGuard> {
        Ok(self.fetch_page(page_id)?.read())
    }

    /// Pins and exclusively latches `page_id`.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<WritePageGuard> {
        Ok(self.fetch_page(page_id)?.write())
    }

    /// Drops one pin on `page_id`, marking it dirty if `is_dirty`.
    ///
    /// Handles and guards unpin themselves; this is for callers that track
    /// pins by hand. Returns false if the page is not resident or not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        self.state.unpin(page_id, is_dirty)
    }

    /// Removes `page_id` from the pool and frees it on disk.
    ///
    /// Fails with `PageStillPinned` if anyone holds the page. Returns false if
    /// the page was not allocated on disk.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        if !page_id.is_valid() {
            return Err(BirchError::InvalidPageId(page_id));
        }

        let mut free_list = self.state.free_list.lock();

        if let Some(frame_id) = self.state.page_table.find(&page_id) {
            let frame = self.state.frame(frame_id);
            if frame.pin_count() > 0 {
                return Err(BirchError::PageStillPinned(page_id));
            }

            self.state.page_table.remove(&page_id);
            self.state.replacer.untrack(frame_id);
            frame.reset();
            free_list.push_back(frame_id);
        }

        let freed = self
            .state
            .disk_scheduler
            .disk_manager()
            .deallocate_page(page_id)?;
        debug!(page_id = page_id.as_u32(), freed, "deleted page");
        Ok(freed)
    }

    /// Writes `page_id` to disk if it is resident. Returns whether it was.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if !page_id.is_valid() {
            return Err(BirchError::InvalidPageId(page_id));
        }

        // Pin the page so the bookkeeping latch is not held while waiting on
        // the page latch
        let (handle, frame_id) = {
            let _latch = self.state.free_list.lock();
            let Some(frame_id) = self.state.page_table.find(&page_id) else {
                return Ok(false);
            };
            self.state.frame(frame_id).pin();
            self.state.replacer.untrack(frame_id);
            (self.handle(page_id, frame_id), frame_id)
        };

        let frame = self.state.frame(frame_id);
        // Cleared before the copy: a writer finishing later marks it again
        frame.set_dirty(false);
        if let Err(e) = self
            .state
            .disk_scheduler
            .schedule_write_sync(page_id, handle.data())
        {
            frame.set_dirty(true);
            return Err(e);
        }

        trace!(page_id = page_id.as_u32(), "flushed page");
        Ok(true)
    }

    /// Writes every dirty resident page to disk.
    pub fn flush_all_pages(&self) -> Result<()> {
        let dirty: Vec<PageId> = {
            let _latch = self.state.free_list.lock();
            self.state
                .frames
                .iter()
                .filter(|frame| frame.page_id().is_valid() && frame.is_dirty())
                .map(|frame| frame.page_id())
                .collect()
        };

        for page_id in dirty {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Pin count of `page_id`, or None if it is not resident.
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let _latch = self.state.free_list.lock();
        self.state
            .page_table
            .find(&page_id)
            .map(|frame_id| self.state.frame(frame_id).pin_count())
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Number of frames holding no page.
    pub fn free_frame_count(&self) -> usize {
        self.state.free_list.lock().len()
    }

    /// Number of resident pages that could be evicted right now.
    pub fn evictable_count(&self) -> usize {
        self.state.replacer.count()
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        self.state.disk_scheduler.disk_manager()
    }
}
