use std::sync::Arc;
use std::vec;

use tracing::trace;

use crate::buffer::BufferPoolManager;
use crate::common::{BirchError, PageId, Result, INVALID_PAGE_ID};

use super::btree_page::{BTreeNode, NodeKind};
use super::storable::Storable;

/// Forward iterator over the leaf chain of a `BPlusTree`.
///
/// Each leaf is copied out under a brief shared latch, so no latch is held
/// between calls to `next`. Entries written concurrently may be missed or
/// seen twice; iteration stops early if the next leaf was merged away.
pub struct BTreeIterator<K, V> {
    bpm: Arc<BufferPoolManager>,
    buffered: vec::IntoIter<(K, V)>,
    next_page_id: PageId,
}

impl<K: Storable, V: Storable> BTreeIterator<K, V> {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, entries: Vec<(K, V)>, next_page_id: PageId) -> Self {
        Self {
            bpm,
            buffered: entries.into_iter(),
            next_page_id,
        }
    }

    pub(crate) fn empty(bpm: Arc<BufferPoolManager>) -> Self {
        Self::new(bpm, Vec::new(), INVALID_PAGE_ID)
    }

    /// True once every entry has been returned.
    pub fn is_end(&self) -> bool {
        self.buffered.len() == 0 && !self.next_page_id.is_valid()
    }

    /// Buffers the next leaf. Returns false if the chain ends at a page that
    /// no longer holds a leaf.
    fn load_next_leaf(&mut self) -> Result<bool> {
        let page_id = std::mem::replace(&mut self.next_page_id, INVALID_PAGE_ID);
        let guard = match self.bpm.fetch_page_read(page_id) {
            Ok(guard) => guard,
            Err(BirchError::PageNotFound(_)) => {
                trace!(page_id = %page_id, "leaf chain ends at a freed page");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        if NodeKind::of_page(&guard[..]) != Some(NodeKind::Leaf) {
            return Ok(false);
        }
        let BTreeNode::Leaf(leaf) = BTreeNode::<K, V>::decode(&guard[..])? else {
            return Ok(false);
        };
        drop(guard);

        self.buffered = leaf.entries.into_iter();
        self.next_page_id = leaf.next_page_id;
        Ok(true)
    }
}

impl<K: Storable, V: Storable> Iterator for BTreeIterator<K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buffered.next() {
                return Some(Ok(entry));
            }
            if !self.next_page_id.is_valid() {
                return None;
            }
            match self.load_next_leaf() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
