use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{PageId, PAGE_SIZE};

use super::{FrameHeader, PageBuf};

/// Called exactly once when a pin is given up, with the page id and whether
/// the holder modified the page.
pub(crate) type ReleaseCallback = Box<dyn FnOnce(PageId, bool) + Send + Sync>;

/// Pin on a page shared by handles and guards.
struct Pin {
    page_id: PageId,
    /// Keeps the frame alive while a latch guard borrows from it
    frame: Arc<FrameHeader>,
    release: Option<ReleaseCallback>,
}

impl Pin {
    fn release(&mut self, is_dirty: bool) {
        if let Some(callback) = self.release.take() {
            callback(self.page_id, is_dirty);
        }
    }
}

/// A pinned but unlatched page.
///
/// The page stays resident while the handle is alive. Call [`PageHandle::read`]
/// or [`PageHandle::write`] to latch it; dropping the handle unpins the page.
pub struct PageHandle {
    pin: Pin,
}

impl PageHandle {
    pub(crate) fn new(page_id: PageId, frame: Arc<FrameHeader>, release: ReleaseCallback) -> Self {
        Self {
            pin: Pin {
                page_id,
                frame,
                release: Some(release),
            },
        }
    }

    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    /// Current pin count of the underlying frame, this handle included.
    pub fn pin_count(&self) -> u32 {
        self.pin.frame.pin_count()
    }

    /// Copy of the page contents, taken under a shared latch.
    pub fn data(&self) -> PageBuf {
        self.pin.frame.snapshot()
    }

    /// Latches the page in shared mode; the pin moves into the guard.
    pub fn read(mut self) -> ReadPageGuard {
        let pin = self.take_pin();
        ReadPageGuard::new(pin)
    }

    /// Latches the page in exclusive mode; the pin moves into the guard.
    pub fn write(mut self) -> WritePageGuard {
        let pin = self.take_pin();
        WritePageGuard::new(pin)
    }

    fn take_pin(&mut self) -> Pin {
        Pin {
            page_id: self.pin.page_id,
            frame: Arc::clone(&self.pin.frame),
            release: self.pin.release.take(),
        }
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.pin.release(false);
    }
}

/// RAII guard for shared access to a page.
/// Releases the latch, then the pin, when dropped.
pub struct ReadPageGuard {
    pin: Pin,
    latch: Option<RwLockReadGuard<'static, PageBuf>>,
}

impl ReadPageGuard {
    fn new(pin: Pin) -> Self {
        let latch = pin.frame.data.read();
        // SAFETY: `pin.frame` keeps the frame alive, and `latch` is dropped in
        // `Drop` before `pin` is.
        let latch: RwLockReadGuard<'static, PageBuf> = unsafe { std::mem::transmute(latch) };

        Self {
            pin,
            latch: Some(latch),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        match &self.latch {
            Some(latch) => &***latch,
            None => unreachable!("latch is only released on drop"),
        }
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data()[..]
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        self.latch.take();
        self.pin.release(false);
    }
}

/// RAII guard for exclusive access to a page.
/// Mutable access marks the page dirty; the latch is released before the pin.
pub struct WritePageGuard {
    pin: Pin,
    latch: Option<RwLockWriteGuard<'static, PageBuf>>,
    is_dirty: bool,
}

impl WritePageGuard {
    fn new(pin: Pin) -> Self {
        let latch = pin.frame.data.write();
        // SAFETY: see `ReadPageGuard::new`.
        let latch: RwLockWriteGuard<'static, PageBuf> = unsafe { std::mem::transmute(latch) };

        Self {
            pin,
            latch: Some(latch),
            is_dirty: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        match &self.latch {
            Some(latch) => &***latch,
            None => unreachable!("latch is only released on drop"),
        }
    }

    /// Mutable page contents. Marks the page dirty.
    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.is_dirty = true;
        match &mut self.latch {
            Some(latch) => &mut ***latch,
            None => unreachable!("latch is only released on drop"),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }
}

impl Deref for WritePageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data()[..]
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data_mut()[..]
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        self.latch.take();
        self.pin.release(self.is_dirty);
    }
}
