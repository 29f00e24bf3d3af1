use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::buffer::{BufferPoolManager, WritePageGuard};
use crate::common::{BTreeConfig, BirchError, PageId, Result, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::storage::page::{HeaderPage, HeaderPageRef, MAX_INDEX_NAME_LEN};

use super::btree_iterator::BTreeIterator;
use super::btree_page::{
    node_fill, set_parent_page_id, BTreeNode, InternalNode, LeafNode, Operation,
};
use super::context::Context;
use super::key_comparator::KeyComparator;
use super::storable::Storable;

/// Shape of a tree, as measured by `BPlusTree::check_integrity`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    /// Levels from the root down to the leaves; 0 for an empty tree
    pub height: usize,
    pub internal_pages: usize,
    pub leaf_pages: usize,
    pub entries: usize,
}

/// A disk-backed B+Tree mapping unique keys to values.
///
/// Pages live in the buffer pool; the root page id of every tree sharing a
/// database file is recorded by name in the header page (page 0), so a tree
/// can be reopened with the same name after a restart.
///
/// Concurrent readers and writers synchronize with latch crabbing: a
/// descent latches the child before releasing the parent. Writers hold the
/// whole path exclusively until they reach a node that cannot split (or
/// merge), at which point every ancestor is released. The root page id has
/// its own lock, held by writers for as long as the root may change.
pub struct BPlusTree<K, V, C> {
    index_name: String,
    bpm: Arc<BufferPoolManager>,
    comparator: C,
    root_page_id: RwLock<PageId>,
    leaf_max_size: usize,
    internal_max_size: usize,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, C> BPlusTree<K, V, C>
where
    K: Storable,
    V: Storable,
    C: KeyComparator<K>,
{
    /// Opens the tree called `name`, creating the header page on a fresh
    /// database file. A name without a header record starts out empty.
    pub fn new(
        name: impl Into<String>,
        bpm: Arc<BufferPoolManager>,
        comparator: C,
        config: BTreeConfig,
    ) -> Result<Self> {
        let index_name = name.into();
        if index_name.len() > MAX_INDEX_NAME_LEN {
            return Err(BirchError::IndexNameTooLong(index_name));
        }
        let (leaf_max_size, internal_max_size) =
            config.resolve(LeafNode::<K, V>::capacity(), InternalNode::<K>::capacity())?;

        let root_page_id = Self::load_root(&bpm, &index_name)?;
        debug!(
            index = %index_name,
            root = %root_page_id,
            leaf_max_size,
            internal_max_size,
            "opened b+tree"
        );

        Ok(Self {
            index_name,
            bpm,
            comparator,
            root_page_id: RwLock::new(root_page_id),
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        })
    }

    fn load_root(bpm: &BufferPoolManager, name: &str) -> Result<PageId> {
        let mut guard = if bpm.disk_manager().get_num_pages() == 0 {
            let handle = bpm.new_page()?;
            if handle.page_id() != HEADER_PAGE_ID {
                return Err(BirchError::IndexCorrupted(format!(
                    "header page allocated as {}",
                    handle.page_id()
                )));
            }
            handle.write()
        } else {
            bpm.fetch_page_write(HEADER_PAGE_ID)?
        };

        if !HeaderPageRef::new(&guard[..]).is_valid() {
            HeaderPage::new(guard.data_mut()).init();
            debug!("initialized header page");
        }
        Ok(HeaderPageRef::new(&guard[..])
            .get_root_id(name)
            .unwrap_or(INVALID_PAGE_ID))
    }

    pub fn name(&self) -> &str {
        &self.index_name
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    pub fn is_empty(&self) -> bool {
        !self.root_page_id().is_valid()
    }

    pub fn leaf_max_size(&self) -> usize {
        self.leaf_max_size
    }

    pub fn internal_max_size(&self) -> usize {
        self.internal_max_size
    }

    /// Point lookup.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self
            .find_leaf_read(Some(key))?
            .and_then(|leaf| leaf.get(&self.comparator, key)))
    }

    /// Inserts `key`. Returns false, changing nothing, if the key exists.
    pub fn insert(&self, key: K, value: V) -> Result<bool> {
        let mut ctx = Context::new();
        let outcome = self.insert_with_context(key, value, &mut ctx);
        self.release_context(&mut ctx);
        outcome
    }

    /// Removes `key`. Returns false if it was not present.
    pub fn remove(&self, key: &K) -> Result<bool> {
        let mut ctx = Context::new();
        let outcome = self.remove_with_context(key, &mut ctx);
        self.release_context(&mut ctx);
        outcome
    }

    /// Inserts every pair, returning how many were new.
    pub fn insert_batch<I>(&self, entries: I) -> Result<usize>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut inserted = 0;
        for (key, value) in entries {
            if self.insert(key, value)? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Removes every key, returning how many were present.
    pub fn remove_batch<I>(&self, keys: I) -> Result<usize>
    where
        I: IntoIterator<Item = K>,
    {
        let mut removed = 0;
        for key in keys {
            if self.remove(&key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Iterates over all entries in key order.
    pub fn begin(&self) -> Result<BTreeIterator<K, V>> {
        Ok(match self.find_leaf_read(None)? {
            Some(leaf) => BTreeIterator::new(Arc::clone(&self.bpm), leaf.entries, leaf.next_page_id),
            None => BTreeIterator::empty(Arc::clone(&self.bpm)),
        })
    }

    /// Iterates in key order starting at the first key not below `key`.
    pub fn begin_at(&self, key: &K) -> Result<BTreeIterator<K, V>> {
        Ok(match self.find_leaf_read(Some(key))? {
            Some(mut leaf) => {
                let (Ok(start) | Err(start)) = leaf.lookup(&self.comparator, key);
                leaf.entries.drain(..start);
                BTreeIterator::new(Arc::clone(&self.bpm), leaf.entries, leaf.next_page_id)
            }
            None => BTreeIterator::empty(Arc::clone(&self.bpm)),
        })
    }

    /// Entries with `start <= key <= end`, in key order.
    pub fn range(&self, start: &K, end: &K) -> Result<Vec<(K, V)>> {
        let mut entries = Vec::new();
        for entry in self.begin_at(start)? {
            let (key, value) = entry?;
            if self.comparator.compare(&key, end) == Ordering::Greater {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }

    /// Descends with shared latches to the leaf that may hold `key`, or the
    /// leftmost leaf if `key` is None. The returned node is a copy taken
    /// under the leaf latch.
    fn find_leaf_read(&self, key: Option<&K>) -> Result<Option<LeafNode<K, V>>> {
        let root_lock = self.root_page_id.read();
        if !root_lock.is_valid() {
            return Ok(None);
        }
        let mut guard = self.bpm.fetch_page_read(*root_lock)?;
        drop(root_lock);

        loop {
            let internal = match BTreeNode::<K, V>::decode(&guard[..])? {
                BTreeNode::Leaf(leaf) => return Ok(Some(leaf)),
                BTreeNode::Internal(internal) => internal,
            };
            let index = match key {
                Some(key) => internal.child_index(&self.comparator, key),
                None => 0,
            };
            let child = internal.children[index];
            trace!(parent = %internal.header.page_id, child = %child, "read crabbing");
            guard = self.bpm.fetch_page_read(child)?;
        }
    }

    /// Descends with exclusive latches to the leaf that may hold `key`.
    /// Requires the root id lock in `ctx`; on return the write set ends with
    /// the leaf and holds every ancestor `op` may still modify.
    fn find_leaf_write<'a>(
        &'a self,
        key: &K,
        op: Operation,
        ctx: &mut Context<'a>,
    ) -> Result<LeafNode<K, V>> {
        let guard = self.bpm.fetch_page_write(ctx.root_page_id()?)?;
        let mut node = BTreeNode::<K, V>::decode(&guard[..])?;
        ctx.write_set.push_back(guard);

        loop {
            let internal = match node {
                BTreeNode::Leaf(leaf) => return Ok(leaf),
                BTreeNode::Internal(internal) => internal,
            };
            let child_id = internal.children[internal.child_index(&self.comparator, key)];
            let child_guard = self.bpm.fetch_page_write(child_id)?;
            let child = BTreeNode::<K, V>::decode(&child_guard[..])?;
            assert_eq!(
                child.parent_page_id(),
                internal.header.page_id,
                "{} does not point back to its parent",
                child_id
            );

            if child.is_safe(op) {
                trace!(page_id = %child_id, ?op, "safe node, releasing ancestors");
                ctx.release_ancestors();
            }
            ctx.write_set.push_back(child_guard);
            node = child;
        }
    }

    fn insert_with_context<'a>(&'a self, key: K, value: V, ctx: &mut Context<'a>) -> Result<bool> {
        ctx.root_guard = Some(self.root_page_id.write());
        if !ctx.root_page_id()?.is_valid() {
            self.start_new_tree(key, value, ctx)?;
            return Ok(true);
        }

        let mut leaf = self.find_leaf_write(&key, Operation::Insert, ctx)?;
        self.pin_header_for_root_change(ctx)?;
        let leaf_id = leaf.header.page_id;
        if leaf.lookup(&self.comparator, &key).is_ok() {
            return Ok(false);
        }

        if leaf.size() < leaf.header.max_size {
            leaf.insert(&self.comparator, key, value);
            let mut guard = ctx.pop_latched(leaf_id)?;
            BTreeNode::Leaf(leaf).encode(guard.data_mut());
            return Ok(true);
        }

        // Every page the split cascade needs is allocated before the first
        // page is modified.
        self.reserve_split_pages(ctx)?;

        let mut leaf_guard = ctx.pop_latched(leaf_id)?;
        let mut sibling_guard = self.allocate_page(ctx)?;
        let sibling_id = sibling_guard.page_id();
        let mut sibling = LeafNode::new(sibling_id, leaf.header.parent_page_id, self.leaf_max_size);
        sibling.entries = leaf.split();
        sibling.next_page_id = leaf.next_page_id;
        leaf.next_page_id = sibling_id;

        if self.comparator.compare(&key, &sibling.entries[0].0) == Ordering::Less {
            leaf.insert(&self.comparator, key, value);
        } else {
            sibling.insert(&self.comparator, key, value);
        }
        let separator = sibling.entries[0].0.clone();
        let parent_id = leaf.header.parent_page_id;
        debug!(
            leaf = %leaf_id,
            sibling = %sibling_id,
            left = leaf.size(),
            right = sibling.size(),
            "split leaf"
        );

        BTreeNode::Leaf(leaf).encode(leaf_guard.data_mut());
        BTreeNode::Leaf(sibling).encode(sibling_guard.data_mut());
        self.insert_into_parent(leaf_guard, parent_id, separator, sibling_guard, ctx)?;
        Ok(true)
    }

    /// Keeps the header page resident while the root id lock is held, so
    /// publishing a new root cannot fail for lack of a frame after the tree
    /// has been modified.
    fn pin_header_for_root_change(&self, ctx: &mut Context<'_>) -> Result<()> {
        if ctx.holds_root() {
            ctx.header_pin = Some(self.bpm.fetch_page(HEADER_PAGE_ID)?);
        }
        Ok(())
    }

    fn start_new_tree(&self, key: K, value: V, ctx: &mut Context<'_>) -> Result<()> {
        let mut guard = self.bpm.new_page()?.write();
        let root_id = guard.page_id();
        let mut leaf = LeafNode::new(root_id, INVALID_PAGE_ID, self.leaf_max_size);
        leaf.insert(&self.comparator, key, value);
        BTreeNode::Leaf(leaf).encode(guard.data_mut());
        drop(guard);

        if let Err(e) = self.set_root(ctx, root_id) {
            ctx.deleted_pages.push(root_id);
            return Err(e);
        }
        Ok(())
    }

    /// Pins one fresh page per node that will split, plus one for a new root
    /// when the split reaches the current root. Also pins every child a
    /// splitting internal node may hand over to its new sibling.
    fn reserve_split_pages(&self, ctx: &mut Context<'_>) -> Result<()> {
        let full = ctx
            .write_set
            .iter()
            .rev()
            .take_while(|guard| {
                let (size, max_size) = node_fill(&guard[..]);
                size >= max_size
            })
            .count();
        let needed = if full == ctx.write_set.len() && ctx.holds_root() {
            full + 1
        } else {
            full
        };

        // The new child lands next to an existing one, so anything from
        // `keep - 1` onward may end up in the upper half.
        let mut moved_children = Vec::new();
        for guard in ctx.write_set.iter().rev().skip(1).take(full.saturating_sub(1)) {
            let node = Self::decode_internal(&guard[..])?;
            let keep = (node.size() + 1) / 2;
            moved_children.extend_from_slice(&node.children[keep.saturating_sub(1)..]);
        }

        for _ in 0..needed {
            ctx.spare_pages.push(self.bpm.new_page()?);
        }
        for child in moved_children {
            ctx.pinned_pages.push(self.bpm.fetch_page(child)?);
        }
        Ok(())
    }

    fn allocate_page(&self, ctx: &mut Context<'_>) -> Result<WritePageGuard> {
        match ctx.spare_pages.pop() {
            Some(handle) => Ok(handle.write()),
            None => Ok(self.bpm.new_page()?.write()),
        }
    }

    /// Links `right` into the tree as the right neighbor of `left`, with
    /// `key` as the separator. Splits the parent, recursively, when it
    /// overflows.
    fn insert_into_parent<'a>(
        &'a self,
        mut left: WritePageGuard,
        parent_id: PageId,
        key: K,
        mut right: WritePageGuard,
        ctx: &mut Context<'a>,
    ) -> Result<()> {
        if !parent_id.is_valid() {
            let mut root_guard = self.allocate_page(ctx)?;
            let root_id = root_guard.page_id();
            let mut root = InternalNode::new(root_id, INVALID_PAGE_ID, self.internal_max_size);
            root.keys.push(key);
            root.children.push(left.page_id());
            root.children.push(right.page_id());
            BTreeNode::<K, V>::Internal(root).encode(root_guard.data_mut());

            set_parent_page_id(left.data_mut(), root_id);
            set_parent_page_id(right.data_mut(), root_id);
            drop((left, right, root_guard));

            debug!(root = %root_id, "grew a new root");
            return self.set_root(ctx, root_id);
        }

        let mut parent_guard = ctx.pop_latched(parent_id)?;
        let mut parent = Self::decode_internal(&parent_guard[..])?;
        parent.insert_after(left.page_id(), key, right.page_id())?;

        if parent.size() <= parent.header.max_size {
            BTreeNode::<K, V>::Internal(parent).encode(parent_guard.data_mut());
            return Ok(());
        }

        let mut sibling_guard = self.allocate_page(ctx)?;
        let sibling_id = sibling_guard.page_id();
        let (middle, keys, children) = parent.split();
        let mut sibling =
            InternalNode::new(sibling_id, parent.header.parent_page_id, self.internal_max_size);
        sibling.keys = keys;
        sibling.children = children;

        for &child in &sibling.children {
            if child == left.page_id() {
                set_parent_page_id(left.data_mut(), sibling_id);
            } else if child == right.page_id() {
                set_parent_page_id(right.data_mut(), sibling_id);
            } else {
                let mut child_guard = self.bpm.fetch_page_write(child)?;
                set_parent_page_id(child_guard.data_mut(), sibling_id);
            }
        }
        drop((left, right));
        debug!(
            node = %parent_id,
            sibling = %sibling_id,
            left = parent.size(),
            right = sibling.size(),
            "split internal node"
        );

        let grandparent_id = parent.header.parent_page_id;
        BTreeNode::<K, V>::Internal(parent).encode(parent_guard.data_mut());
        BTreeNode::<K, V>::Internal(sibling).encode(sibling_guard.data_mut());
        self.insert_into_parent(parent_guard, grandparent_id, middle, sibling_guard, ctx)
    }

    fn remove_with_context<'a>(&'a self, key: &K, ctx: &mut Context<'a>) -> Result<bool> {
        ctx.root_guard = Some(self.root_page_id.write());
        if !ctx.root_page_id()?.is_valid() {
            return Ok(false);
        }

        let mut leaf = self.find_leaf_write(key, Operation::Delete, ctx)?;
        self.pin_header_for_root_change(ctx)?;
        if !leaf.remove(&self.comparator, key) {
            return Ok(false);
        }
        self.reserve_rebalance_pages(leaf.size(), ctx)?;

        let mut guard = ctx.pop_latched(leaf.header.page_id)?;
        let node = BTreeNode::Leaf(leaf);
        node.encode(guard.data_mut());
        self.coalesce_or_redistribute(guard, node, ctx)?;
        Ok(true)
    }

    /// Pins every existing page the rebalancing after a removal will fetch,
    /// given the leaf's size once the key is gone: the sibling chosen at each
    /// level that underflows, and the children whose parent changes. Runs
    /// before the leaf is written, so a full pool fails the removal cleanly.
    fn reserve_rebalance_pages(&self, leaf_size: usize, ctx: &mut Context<'_>) -> Result<()> {
        let mut pins = Vec::new();
        let mut size = leaf_size;

        for level in (0..ctx.write_set.len()).rev() {
            let node = BTreeNode::<K, V>::decode(&ctx.write_set[level][..])?;
            if node.is_root() {
                // A root left with one child hands over to it
                if let BTreeNode::Internal(root) = &node {
                    if size == 1 {
                        pins.extend_from_slice(&root.children);
                    }
                }
                break;
            }
            if level == 0 || !node.underflows_at(size) {
                break;
            }

            let parent = Self::decode_internal(&ctx.write_set[level - 1][..])?;
            let Some(index) = parent.child_position(node.page_id()) else {
                break;
            };
            if parent.size() < 2 {
                break;
            }
            let sibling_index = if index == 0 { 1 } else { index - 1 };
            let handle = self.bpm.fetch_page(parent.children[sibling_index])?;
            let sibling = BTreeNode::<K, V>::decode(&handle.data()[..])?;
            ctx.pinned_pages.push(handle);

            if sibling.size() + size > node.max_size() {
                if let BTreeNode::Internal(sibling) = &sibling {
                    let moved = if index == 0 {
                        sibling.children.first()
                    } else {
                        sibling.children.last()
                    };
                    pins.extend(moved.copied());
                }
                break;
            }

            if let (BTreeNode::Internal(node), BTreeNode::Internal(sibling)) = (&node, &sibling) {
                let right = if index == 0 { sibling } else { node };
                pins.extend_from_slice(&right.children);
            }
            size = parent.size() - 1;
        }

        for page_id in pins {
            ctx.pinned_pages.push(self.bpm.fetch_page(page_id)?);
        }
        Ok(())
    }

    /// Restores the size bound of `node` after a removal by borrowing from,
    /// or merging with, an adjacent sibling under the same parent.
    fn coalesce_or_redistribute<'a>(
        &'a self,
        guard: WritePageGuard,
        node: BTreeNode<K, V>,
        ctx: &mut Context<'a>,
    ) -> Result<()> {
        if node.is_root() {
            return self.adjust_root(guard, node, ctx);
        }
        if !node.is_underflow() {
            return Ok(());
        }

        let node_id = node.page_id();
        let mut parent_guard = ctx.pop_latched(node.parent_page_id())?;
        let mut parent = Self::decode_internal(&parent_guard[..])?;
        let index = parent.child_position(node_id).ok_or_else(|| {
            BirchError::IndexCorrupted(format!(
                "{} is not a child of {}",
                node_id,
                parent_guard.page_id()
            ))
        })?;
        if parent.size() < 2 {
            return Err(BirchError::IndexCorrupted(format!(
                "{} has no sibling to rebalance with",
                node_id
            )));
        }

        // Prefer the left sibling; the first child uses its right one
        let sibling_index = if index == 0 { 1 } else { index - 1 };
        let sibling_guard = self.bpm.fetch_page_write(parent.children[sibling_index])?;
        let sibling = BTreeNode::<K, V>::decode(&sibling_guard[..])?;

        if sibling.size() + node.size() > node.max_size() {
            self.redistribute(guard, node, sibling_guard, sibling, &mut parent, index)?;
            BTreeNode::<K, V>::Internal(parent).encode(parent_guard.data_mut());
            return Ok(());
        }

        let (left_guard, left, right_guard, right, right_index) = if index == 0 {
            (guard, node, sibling_guard, sibling, 1)
        } else {
            (sibling_guard, sibling, guard, node, index)
        };
        let right_id = right.page_id();
        let separator = parent.keys[right_index - 1].clone();
        self.coalesce(left_guard, left, right_guard, right, separator)?;

        parent.remove_child(right_index);
        ctx.deleted_pages.push(right_id);

        let parent = BTreeNode::Internal(parent);
        parent.encode(parent_guard.data_mut());
        self.coalesce_or_redistribute(parent_guard, parent, ctx)
    }

    /// Merges `right` into `left`. `separator` is the parent key between them.
    fn coalesce(
        &self,
        mut left_guard: WritePageGuard,
        left: BTreeNode<K, V>,
        right_guard: WritePageGuard,
        right: BTreeNode<K, V>,
        separator: K,
    ) -> Result<()> {
        let merged = match (left, right) {
            (BTreeNode::Leaf(mut left), BTreeNode::Leaf(right)) => {
                debug!(left = %left.header.page_id, right = %right.header.page_id, "merged leaves");
                left.entries.extend(right.entries);
                left.next_page_id = right.next_page_id;
                BTreeNode::Leaf(left)
            }
            (BTreeNode::Internal(mut left), BTreeNode::Internal(right)) => {
                debug!(
                    left = %left.header.page_id,
                    right = %right.header.page_id,
                    "merged internal nodes"
                );
                let left_id = left.header.page_id;
                for &child in &right.children {
                    let mut child_guard = self.bpm.fetch_page_write(child)?;
                    set_parent_page_id(child_guard.data_mut(), left_id);
                }
                left.keys.push(separator);
                left.keys.extend(right.keys);
                left.children.extend(right.children);
                BTreeNode::Internal(left)
            }
            _ => return Err(Self::mixed_siblings(left_guard.page_id(), right_guard.page_id())),
        };

        merged.encode(left_guard.data_mut());
        Ok(())
    }

    /// Moves one entry from `sibling` into `node`, fixing up the parent key
    /// between them. `index` is the position of `node` in `parent`.
    fn redistribute(
        &self,
        mut node_guard: WritePageGuard,
        node: BTreeNode<K, V>,
        mut sibling_guard: WritePageGuard,
        sibling: BTreeNode<K, V>,
        parent: &mut InternalNode<K>,
        index: usize,
    ) -> Result<()> {
        let node_id = node_guard.page_id();
        let sibling_id = sibling_guard.page_id();
        let from_right = index == 0;
        debug!(node = %node_id, sibling = %sibling_id, from_right, "redistributing");

        let (node, sibling) = match (node, sibling) {
            (BTreeNode::Leaf(mut node), BTreeNode::Leaf(mut sibling)) => {
                if from_right {
                    let entry = sibling.entries.remove(0);
                    node.entries.push(entry);
                    parent.keys[0] = sibling.entries[0].0.clone();
                } else {
                    let entry = sibling
                        .entries
                        .pop()
                        .ok_or_else(|| Self::empty_sibling(sibling_id))?;
                    node.entries.insert(0, entry);
                    parent.keys[index - 1] = node.entries[0].0.clone();
                }
                (BTreeNode::Leaf(node), BTreeNode::Leaf(sibling))
            }
            (BTreeNode::Internal(mut node), BTreeNode::Internal(mut sibling)) => {
                let moved = if from_right {
                    let moved = sibling.children.remove(0);
                    let key = sibling.keys.remove(0);
                    node.children.push(moved);
                    node.keys.push(std::mem::replace(&mut parent.keys[0], key));
                    moved
                } else {
                    let moved = sibling
                        .children
                        .pop()
                        .ok_or_else(|| Self::empty_sibling(sibling_id))?;
                    let key = sibling
                        .keys
                        .pop()
                        .ok_or_else(|| Self::empty_sibling(sibling_id))?;
                    node.children.insert(0, moved);
                    node.keys
                        .insert(0, std::mem::replace(&mut parent.keys[index - 1], key));
                    moved
                };
                let mut child_guard = self.bpm.fetch_page_write(moved)?;
                set_parent_page_id(child_guard.data_mut(), node_id);
                (BTreeNode::Internal(node), BTreeNode::Internal(sibling))
            }
            _ => return Err(Self::mixed_siblings(node_id, sibling_id)),
        };

        node.encode(node_guard.data_mut());
        sibling.encode(sibling_guard.data_mut());
        Ok(())
    }

    /// Shrinks the tree at the root: an empty leaf root empties the tree and
    /// an internal root with a single child hands the root to that child.
    fn adjust_root<'a>(
        &'a self,
        guard: WritePageGuard,
        node: BTreeNode<K, V>,
        ctx: &mut Context<'a>,
    ) -> Result<()> {
        match node {
            BTreeNode::Leaf(leaf) if leaf.entries.is_empty() => {
                ctx.deleted_pages.push(leaf.header.page_id);
                drop(guard);
                debug!(index = %self.index_name, "tree is now empty");
                self.set_root(ctx, INVALID_PAGE_ID)
            }
            BTreeNode::Internal(internal) if internal.children.len() == 1 => {
                let child = internal.children[0];
                let mut child_guard = self.bpm.fetch_page_write(child)?;
                set_parent_page_id(child_guard.data_mut(), INVALID_PAGE_ID);
                drop(child_guard);

                ctx.deleted_pages.push(internal.header.page_id);
                drop(guard);
                debug!(old_root = %internal.header.page_id, root = %child, "collapsed root");
                self.set_root(ctx, child)
            }
            _ => Ok(()),
        }
    }

    /// Publishes a new root page id in memory and in the header page.
    fn set_root(&self, ctx: &mut Context<'_>, root_page_id: PageId) -> Result<()> {
        if !ctx.holds_root() {
            return Err(BirchError::IndexCorrupted("root id lock not held".to_string()));
        }

        {
            let mut guard = self.bpm.fetch_page_write(HEADER_PAGE_ID)?;
            let mut header = HeaderPage::new(guard.data_mut());
            if header.get_root_id(&self.index_name).is_some() {
                header.update_record(&self.index_name, root_page_id)?;
            } else {
                header.insert_record(&self.index_name, root_page_id)?;
            }
        }
        ctx.set_root_page_id(root_page_id)?;
        debug!(index = %self.index_name, root = %root_page_id, "root changed");
        Ok(())
    }

    /// Drops every latch the operation still holds, then deletes the pages
    /// it emptied along with any reserved page it did not use.
    fn release_context(&self, ctx: &mut Context<'_>) {
        ctx.release_ancestors();
        ctx.header_pin.take();
        ctx.pinned_pages.clear();

        for handle in ctx.spare_pages.drain(..) {
            let page_id = handle.page_id();
            drop(handle);
            ctx.deleted_pages.push(page_id);
        }
        for page_id in ctx.deleted_pages.drain(..) {
            match self.bpm.delete_page(page_id) {
                Ok(_) => trace!(page_id = %page_id, "deleted index page"),
                Err(e) => warn!(page_id = %page_id, error = %e, "skipping delete of index page"),
            }
        }
    }

    fn decode_internal(data: &[u8]) -> Result<InternalNode<K>> {
        match BTreeNode::<K, V>::decode(data)? {
            BTreeNode::Internal(node) => Ok(node),
            BTreeNode::Leaf(leaf) => Err(BirchError::IndexCorrupted(format!(
                "{} is a leaf but has children",
                leaf.header.page_id
            ))),
        }
    }

    fn mixed_siblings(a: PageId, b: PageId) -> BirchError {
        BirchError::IndexCorrupted(format!("siblings {} and {} differ in kind", a, b))
    }

    fn empty_sibling(page_id: PageId) -> BirchError {
        BirchError::IndexCorrupted(format!("sibling {} is empty", page_id))
    }

    /// Walks the whole tree under shared latches and verifies its structure:
    /// key order and separator bounds, parent links, node sizes, uniform leaf
    /// depth, and a leaf chain that visits every leaf left to right.
    ///
    /// Meant for tests and diagnostics on a quiescent tree.
    pub fn check_integrity(&self) -> Result<TreeStats> {
        let root_lock = self.root_page_id.read();
        let mut stats = TreeStats::default();
        if !root_lock.is_valid() {
            return Ok(stats);
        }

        let mut leaves = Vec::new();
        stats.height =
            self.check_subtree(*root_lock, INVALID_PAGE_ID, None, None, &mut stats, &mut leaves)?;

        for pair in leaves.windows(2) {
            let (page_id, next_page_id) = pair[0];
            if next_page_id != pair[1].0 {
                return Err(BirchError::IndexCorrupted(format!(
                    "leaf {} links to {}, expected {}",
                    page_id, next_page_id, pair[1].0
                )));
            }
        }
        if let Some(&(page_id, next_page_id)) = leaves.last() {
            if next_page_id.is_valid() {
                return Err(BirchError::IndexCorrupted(format!(
                    "last leaf {} links to {}",
                    page_id, next_page_id
                )));
            }
        }
        Ok(stats)
    }

    /// Returns the height of the subtree at `page_id`.
    fn check_subtree(
        &self,
        page_id: PageId,
        parent_id: PageId,
        lower: Option<&K>,
        upper: Option<&K>,
        stats: &mut TreeStats,
        leaves: &mut Vec<(PageId, PageId)>,
    ) -> Result<usize> {
        let node = {
            let guard = self.bpm.fetch_page_read(page_id)?;
            BTreeNode::<K, V>::decode(&guard[..])?
        };
        let corrupted = |msg: String| BirchError::IndexCorrupted(format!("{}: {}", page_id, msg));

        if node.page_id() != page_id {
            return Err(corrupted(format!("header says {}", node.page_id())));
        }
        if node.parent_page_id() != parent_id {
            return Err(corrupted(format!(
                "parent is {}, expected {}",
                node.parent_page_id(),
                parent_id
            )));
        }
        if node.size() > node.max_size() {
            return Err(corrupted(format!("size {} over max {}", node.size(), node.max_size())));
        }
        let min_size = match (&node, parent_id.is_valid()) {
            (_, true) => node.min_size(),
            (BTreeNode::Leaf(_), false) => 1,
            (BTreeNode::Internal(_), false) => 2,
        };
        if node.size() < min_size {
            return Err(corrupted(format!("size {} under min {}", node.size(), min_size)));
        }

        let in_bounds = |key: &K| {
            lower.map_or(true, |lo| self.comparator.compare(key, lo) != Ordering::Less)
                && upper.map_or(true, |hi| self.comparator.compare(key, hi) == Ordering::Less)
        };
        let ascending = |a: &K, b: &K| self.comparator.compare(a, b) == Ordering::Less;

        match node {
            BTreeNode::Leaf(leaf) => {
                if !leaf.entries.windows(2).all(|w| ascending(&w[0].0, &w[1].0)) {
                    return Err(corrupted("leaf keys out of order".to_string()));
                }
                if !leaf.entries.iter().all(|(key, _)| in_bounds(key)) {
                    return Err(corrupted("leaf key outside parent bounds".to_string()));
                }
                stats.leaf_pages += 1;
                stats.entries += leaf.entries.len();
                leaves.push((page_id, leaf.next_page_id));
                Ok(1)
            }
            BTreeNode::Internal(internal) => {
                if !internal.keys.windows(2).all(|w| ascending(&w[0], &w[1])) {
                    return Err(corrupted("separators out of order".to_string()));
                }
                if !internal.keys.iter().all(|key| in_bounds(key)) {
                    return Err(corrupted("separator outside parent bounds".to_string()));
                }
                stats.internal_pages += 1;

                let mut height = None;
                for (i, &child) in internal.children.iter().enumerate() {
                    let lo = if i == 0 { lower } else { Some(&internal.keys[i - 1]) };
                    let hi = internal.keys.get(i).or(upper);
                    let child_height = self.check_subtree(child, page_id, lo, hi, stats, leaves)?;
                    match height {
                        None => height = Some(child_height),
                        Some(h) if h != child_height => {
                            return Err(corrupted("leaves at different depths".to_string()));
                        }
                        Some(_) => {}
                    }
                }
                Ok(height.unwrap_or(0) + 1)
            }
        }
    }
}
