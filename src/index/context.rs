use std::collections::VecDeque;

use parking_lot::RwLockWriteGuard;

use crate::buffer::{PageHandle, WritePageGuard};
use crate::common::{BirchError, PageId, Result};

/// Latches and bookkeeping held by one structural operation on the tree.
///
/// The write set holds the exclusively latched path from the highest node a
/// split or merge may still reach down to the current node. Once a node is
/// known to be safe, everything above it (the root id lock included) is
/// released.
pub struct Context<'a> {
    /// Exclusive hold on the tree's root page id while the root may change
    pub root_guard: Option<RwLockWriteGuard<'a, PageId>>,
    pub write_set: VecDeque<WritePageGuard>,
    /// Pages emptied by merges, deleted once every latch is released
    pub deleted_pages: Vec<PageId>,
    /// Pages reserved up front for the splits an insert will perform
    pub spare_pages: Vec<PageHandle>,
    /// Existing pages a split or merge will rewrite, kept resident so that
    /// no fetch after the first modification can run out of frames
    pub pinned_pages: Vec<PageHandle>,
    /// Pin on the header page, taken while the root may change
    pub header_pin: Option<PageHandle>,
}

impl<'a> Context<'a> {
    pub fn new() -> Self {
        Self {
            root_guard: None,
            write_set: VecDeque::new(),
            deleted_pages: Vec::new(),
            spare_pages: Vec::new(),
            pinned_pages: Vec::new(),
            header_pin: None,
        }
    }

    /// Releases the root id lock and every latched ancestor, oldest first.
    pub fn release_ancestors(&mut self) {
        self.root_guard.take();
        while let Some(guard) = self.write_set.pop_front() {
            drop(guard);
        }
    }

    /// Whether this operation still holds the root id lock.
    pub fn holds_root(&self) -> bool {
        self.root_guard.is_some()
    }

    /// Root page id as seen under the root id lock.
    pub fn root_page_id(&self) -> Result<PageId> {
        self.root_guard
            .as_deref()
            .copied()
            .ok_or_else(|| BirchError::IndexCorrupted("root id lock not held".to_string()))
    }

    /// Replaces the root page id. Requires the root id lock.
    pub fn set_root_page_id(&mut self, root_page_id: PageId) -> Result<()> {
        let guard = self
            .root_guard
            .as_mut()
            .ok_or_else(|| BirchError::IndexCorrupted("root id lock not held".to_string()))?;
        **guard = root_page_id;
        Ok(())
    }

    /// Takes the most recently latched page off the write set.
    pub fn pop_latched(&mut self, expected: PageId) -> Result<WritePageGuard> {
        match self.write_set.pop_back() {
            Some(guard) if guard.page_id() == expected => Ok(guard),
            Some(guard) => Err(BirchError::IndexCorrupted(format!(
                "expected {} to be latched, found {}",
                expected,
                guard.page_id()
            ))),
            None => Err(BirchError::IndexCorrupted(format!(
                "{} is not latched by this operation",
                expected
            ))),
        }
    }
}

impl Default for Context<'_> {
    fn default() -> Self {
        Self::new()
    }
}
