use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::common::{FrameId, PageId, INVALID_PAGE_ID, PAGE_SIZE};

/// Owned copy of one page's bytes.
pub type PageBuf = Box<[u8; PAGE_SIZE]>;

/// Returns a zero-filled page buffer.
pub fn zeroed_page() -> PageBuf {
    Box::new([0u8; PAGE_SIZE])
}

/// One slot of the buffer pool.
///
/// Metadata (page id, pin count, dirty flag) is only changed while the pool's
/// bookkeeping latch is held. `data` doubles as the page latch: page guards
/// hold its read or write lock for their whole lifetime.
pub struct FrameHeader {
    frame_id: FrameId,
    page_id: AtomicU32,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
    pub(crate) data: RwLock<PageBuf>,
}

impl FrameHeader {
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            page_id: AtomicU32::new(INVALID_PAGE_ID.as_u32()),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            data: RwLock::new(zeroed_page()),
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Page resident in this frame, `INVALID_PAGE_ID` if the frame is free.
    pub fn page_id(&self) -> PageId {
        PageId::new(self.page_id.load(Ordering::Acquire))
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count and returns the new value.
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the pin count and returns the new value.
    /// Returns None if the pin count was already 0.
    pub fn unpin(&self) -> Option<u32> {
        self.pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .ok()
            .map(|previous| previous - 1)
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Installs `page_id` with the given contents, clean and unpinned.
    pub fn load(&self, page_id: PageId, contents: &[u8; PAGE_SIZE]) {
        self.data.write().copy_from_slice(contents);
        self.page_id.store(page_id.as_u32(), Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
    }

    /// Copies the current page contents out of the frame.
    /// Blocks while a writer holds the page latch.
    pub fn snapshot(&self) -> PageBuf {
        let mut buf = zeroed_page();
        buf.copy_from_slice(&self.data.read()[..]);
        buf
    }

    /// Returns the frame to the free state with zeroed contents.
    pub fn reset(&self) {
        self.data.write().fill(0);
        self.page_id.store(INVALID_PAGE_ID.as_u32(), Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
    }
}
