use std::cmp::Ordering;

use bytes::{Buf, BufMut};

use crate::common::{BirchError, PageId, Result, INVALID_PAGE_ID, PAGE_SIZE};

use super::key_comparator::KeyComparator;
use super::storable::Storable;

const LEAF_PAGE: u8 = 1;
const INTERNAL_PAGE: u8 = 2;

// page_type (1) | pad (3) | size (4) | max_size (4) | page_id (4) | parent (4) | next (4)
const PAGE_TYPE_OFFSET: usize = 0;
const SIZE_OFFSET: usize = 4;
const PARENT_PAGE_OFFSET: usize = 16;
pub const NODE_HEADER_SIZE: usize = 24;

/// Kind of node stored in a page, read without decoding the slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Internal,
}

impl NodeKind {
    /// Returns None if the page does not hold a tree node.
    pub fn of_page(data: &[u8]) -> Option<NodeKind> {
        match data[PAGE_TYPE_OFFSET] {
            LEAF_PAGE => Some(NodeKind::Leaf),
            INTERNAL_PAGE => Some(NodeKind::Internal),
            _ => None,
        }
    }
}

/// `(size, max_size)` of the node in `data`, read from the header alone.
pub fn node_fill(data: &[u8]) -> (usize, usize) {
    let mut buf = &data[SIZE_OFFSET..SIZE_OFFSET + 8];
    let size = buf.get_u32_le() as usize;
    let max_size = buf.get_u32_le() as usize;
    (size, max_size)
}

/// Rewrites the parent pointer of the node in `data` without decoding it.
pub fn set_parent_page_id(data: &mut [u8], parent: PageId) {
    (&mut data[PARENT_PAGE_OFFSET..PARENT_PAGE_OFFSET + 4]).put_u32_le(parent.as_u32());
}

/// What a latch-crabbing descent is about to do to the leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Delete,
}

/// Fields shared by both node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub page_id: PageId,
    pub parent_page_id: PageId,
    pub max_size: usize,
}

impl NodeHeader {
    pub fn new(page_id: PageId, parent_page_id: PageId, max_size: usize) -> Self {
        Self {
            page_id,
            parent_page_id,
            max_size,
        }
    }

    pub fn min_size(&self) -> usize {
        self.max_size / 2
    }

    pub fn is_root(&self) -> bool {
        !self.parent_page_id.is_valid()
    }
}

/// Internal node: `children.len()` child pointers separated by
/// `children.len() - 1` keys. Every key in `children[i]` (i > 0) is at least
/// `keys[i - 1]` and below `keys[i]`.
#[derive(Debug, Clone)]
pub struct InternalNode<K> {
    pub header: NodeHeader,
    pub keys: Vec<K>,
    pub children: Vec<PageId>,
}

impl<K: Storable> InternalNode<K> {
    pub fn new(page_id: PageId, parent_page_id: PageId, max_size: usize) -> Self {
        Self {
            header: NodeHeader::new(page_id, parent_page_id, max_size),
            keys: Vec::with_capacity(max_size),
            children: Vec::with_capacity(max_size + 1),
        }
    }

    /// Most children a page can hold.
    pub fn capacity() -> usize {
        (PAGE_SIZE - NODE_HEADER_SIZE) / (K::ENCODED_SIZE + PageId::ENCODED_SIZE)
    }

    /// Number of children.
    pub fn size(&self) -> usize {
        self.children.len()
    }

    /// Index of the child whose subtree may contain `key`.
    pub fn child_index<C: KeyComparator<K>>(&self, comparator: &C, key: &K) -> usize {
        self.keys
            .partition_point(|k| comparator.compare(k, key) != Ordering::Greater)
    }

    pub fn child_position(&self, child: PageId) -> Option<usize> {
        self.children.iter().position(|&c| c == child)
    }

    /// Inserts `new_child` right after `existing`, separated from it by `key`.
    pub fn insert_after(&mut self, existing: PageId, key: K, new_child: PageId) -> Result<()> {
        let position = self.child_position(existing).ok_or_else(|| {
            BirchError::IndexCorrupted(format!(
                "{} is not a child of {}",
                existing, self.header.page_id
            ))
        })?;
        self.keys.insert(position, key);
        self.children.insert(position + 1, new_child);
        Ok(())
    }

    /// Removes child `index` (at least 1) and the key separating it from its
    /// left neighbor.
    pub fn remove_child(&mut self, index: usize) {
        debug_assert!(index > 0);
        self.children.remove(index);
        self.keys.remove(index - 1);
    }

    /// Splits an overfull node. The node keeps the lower `size / 2` children;
    /// returns the key that moves up and the upper keys and children.
    pub fn split(&mut self) -> (K, Vec<K>, Vec<PageId>) {
        let keep = self.children.len() / 2;
        let right_children = self.children.split_off(keep);
        let mut upper_keys = self.keys.split_off(keep - 1);
        let right_keys = upper_keys.split_off(1);
        let middle = upper_keys.remove(0);
        (middle, right_keys, right_children)
    }
}

/// Leaf node: sorted entries plus a link to the right sibling.
#[derive(Debug, Clone)]
pub struct LeafNode<K, V> {
    pub header: NodeHeader,
    pub entries: Vec<(K, V)>,
    pub next_page_id: PageId,
}

impl<K: Storable, V: Storable> LeafNode<K, V> {
    pub fn new(page_id: PageId, parent_page_id: PageId, max_size: usize) -> Self {
        Self {
            header: NodeHeader::new(page_id, parent_page_id, max_size),
            entries: Vec::with_capacity(max_size + 1),
            next_page_id: INVALID_PAGE_ID,
        }
    }

    /// Most entries a page can hold.
    pub fn capacity() -> usize {
        (PAGE_SIZE - NODE_HEADER_SIZE) / (K::ENCODED_SIZE + V::ENCODED_SIZE)
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Binary search: Ok(index) of `key`, or Err(insertion point).
    pub fn lookup<C: KeyComparator<K>>(&self, comparator: &C, key: &K) -> std::result::Result<usize, usize> {
        self.entries
            .binary_search_by(|(k, _)| comparator.compare(k, key))
    }

    pub fn get<C: KeyComparator<K>>(&self, comparator: &C, key: &K) -> Option<V> {
        self.lookup(comparator, key)
            .ok()
            .map(|i| self.entries[i].1.clone())
    }

    /// Inserts in key order. Returns false, leaving the node unchanged, if
    /// `key` is already present.
    pub fn insert<C: KeyComparator<K>>(&mut self, comparator: &C, key: K, value: V) -> bool {
        match self.lookup(comparator, &key) {
            Ok(_) => false,
            Err(position) => {
                self.entries.insert(position, (key, value));
                true
            }
        }
    }

    pub fn remove<C: KeyComparator<K>>(&mut self, comparator: &C, key: &K) -> bool {
        match self.lookup(comparator, key) {
            Ok(position) => {
                self.entries.remove(position);
                true
            }
            Err(_) => false,
        }
    }

    /// Moves the upper `ceil(size / 2)` entries out of the node.
    pub fn split(&mut self) -> Vec<(K, V)> {
        let keep = self.entries.len() / 2;
        self.entries.split_off(keep)
    }
}

/// A decoded B+Tree page.
#[derive(Debug, Clone)]
pub enum BTreeNode<K, V> {
    Internal(InternalNode<K>),
    Leaf(LeafNode<K, V>),
}

impl<K: Storable, V: Storable> BTreeNode<K, V> {
    pub fn header(&self) -> &NodeHeader {
        match self {
            BTreeNode::Internal(node) => &node.header,
            BTreeNode::Leaf(node) => &node.header,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.header().page_id
    }

    pub fn parent_page_id(&self) -> PageId {
        self.header().parent_page_id
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, BTreeNode::Leaf(_))
    }

    pub fn is_root(&self) -> bool {
        self.header().is_root()
    }

    /// Entries for a leaf, children for an internal node.
    pub fn size(&self) -> usize {
        match self {
            BTreeNode::Internal(node) => node.size(),
            BTreeNode::Leaf(node) => node.size(),
        }
    }

    pub fn max_size(&self) -> usize {
        self.header().max_size
    }

    pub fn min_size(&self) -> usize {
        self.header().min_size()
    }

    /// Whether `op` on this node's subtree can never propagate a structure
    /// change above it.
    pub fn is_safe(&self, op: Operation) -> bool {
        match op {
            Operation::Insert => self.size() < self.max_size(),
            Operation::Delete => self.size() > self.min_size() + 1,
        }
    }

    /// Whether a non-root node holds too few entries after a delete.
    /// Internal nodes count children and must keep more than `min_size`.
    pub fn is_underflow(&self) -> bool {
        self.underflows_at(self.size())
    }

    /// Whether this node would underflow if it held `size` entries.
    pub fn underflows_at(&self, size: usize) -> bool {
        if self.is_leaf() {
            size < self.min_size()
        } else {
            size <= self.min_size()
        }
    }

    /// Decodes the node stored in `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if buf.len() != PAGE_SIZE {
            return Err(BirchError::IndexCorrupted(format!(
                "page buffer of {} bytes",
                buf.len()
            )));
        }

        let page_type = buf.get_u8();
        buf.advance(3);
        let size = buf.get_u32_le() as usize;
        let max_size = buf.get_u32_le() as usize;
        let page_id = PageId::new(buf.get_u32_le());
        let parent_page_id = PageId::new(buf.get_u32_le());
        let next_page_id = PageId::new(buf.get_u32_le());
        let header = NodeHeader::new(page_id, parent_page_id, max_size);

        match page_type {
            LEAF_PAGE => {
                let capacity = LeafNode::<K, V>::capacity();
                if size > capacity || max_size > capacity {
                    return Err(BirchError::IndexCorrupted(format!(
                        "leaf {} has size {} / max {} beyond capacity {}",
                        page_id, size, max_size, capacity
                    )));
                }

                let mut entries = Vec::with_capacity(max_size + 1);
                for _ in 0..size {
                    let key = K::decode(&mut buf);
                    let value = V::decode(&mut buf);
                    entries.push((key, value));
                }
                Ok(BTreeNode::Leaf(LeafNode {
                    header,
                    entries,
                    next_page_id,
                }))
            }
            INTERNAL_PAGE => {
                let capacity = InternalNode::<K>::capacity();
                if size == 0 || size > capacity || max_size > capacity {
                    return Err(BirchError::IndexCorrupted(format!(
                        "internal node {} has size {} / max {} (capacity {})",
                        page_id, size, max_size, capacity
                    )));
                }

                let mut keys = Vec::with_capacity(max_size);
                let mut children = Vec::with_capacity(max_size + 1);
                for i in 0..size {
                    if i == 0 {
                        buf.advance(K::ENCODED_SIZE);
                    } else {
                        keys.push(K::decode(&mut buf));
                    }
                    children.push(PageId::decode(&mut buf));
                }
                Ok(BTreeNode::Internal(InternalNode {
                    header,
                    keys,
                    children,
                }))
            }
            other => Err(BirchError::IndexCorrupted(format!(
                "page {} has unknown page type {}",
                page_id, other
            ))),
        }
    }

    /// Encodes the node into `data`, which must be a full page.
    pub fn encode(&self, data: &mut [u8]) {
        debug_assert!(self.size() <= self.max_size());
        let header = self.header();
        let mut buf = data;

        let (page_type, next_page_id) = match self {
            BTreeNode::Internal(_) => (INTERNAL_PAGE, INVALID_PAGE_ID),
            BTreeNode::Leaf(node) => (LEAF_PAGE, node.next_page_id),
        };
        buf.put_u8(page_type);
        buf.put_bytes(0, 3);
        buf.put_u32_le(self.size() as u32);
        buf.put_u32_le(header.max_size as u32);
        buf.put_u32_le(header.page_id.as_u32());
        buf.put_u32_le(header.parent_page_id.as_u32());
        buf.put_u32_le(next_page_id.as_u32());

        match self {
            BTreeNode::Internal(node) => {
                for (i, child) in node.children.iter().enumerate() {
                    if i == 0 {
                        buf.put_bytes(0, K::ENCODED_SIZE);
                    } else {
                        node.keys[i - 1].encode(&mut buf);
                    }
                    child.encode(&mut buf);
                }
            }
            BTreeNode::Leaf(node) => {
                for (key, value) in &node.entries {
                    key.encode(&mut buf);
                    value.encode(&mut buf);
                }
            }
        }
    }
}
