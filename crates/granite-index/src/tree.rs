//! Concurrent B+Tree over buffer-pool pages.

use crate::context::Context;
use crate::header::{HeaderMut, HeaderRef, HEADER_PAGE_ID};
use crate::iterator::TreeIterator;
use crate::key::{IndexKey, IndexValue};
use crate::node::{
    self, InternalMut, InternalRef, LeafMut, LeafRef, NodeRef, NodeType,
};
use granite_buffer::{BufferPool, PageWriteGuard};
use granite_common::page::PageId;
use granite_common::{GraniteError, Result};
use parking_lot::RwLock;
use std::marker::PhantomData;
use std::sync::Arc;

/// A persistent, order-configurable B+Tree.
///
/// Nodes live in buffer-pool pages and are accessed through the pool's
/// pin/latch protocol. Concurrency uses crab latching: descents latch the
/// child before deciding whether the ancestors can still be affected, and
/// release everything above the first node that is safe for the operation.
/// The root id itself sits behind a tree-level reader/writer latch and is
/// mirrored into the header page whenever it changes.
///
/// Keys are unique; `K`'s `Ord` is the comparator.
pub struct BPlusTree<K: IndexKey, V: IndexValue> {
    name: String,
    pool: Arc<BufferPool>,
    /// Tree latch; the guarded value is the current root page id.
    root: RwLock<PageId>,
    /// A leaf splits when an insert fills it to this size.
    leaf_max_size: usize,
    /// An internal node splits when an insert pushes it past this many children.
    internal_max_size: usize,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: IndexKey, V: IndexValue> BPlusTree<K, V> {
    /// Opens the named index, creating its header record if absent.
    ///
    /// The header page is allocated on first use of a fresh database file
    /// and must land on page 0.
    pub fn new(
        name: &str,
        pool: Arc<BufferPool>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        if leaf_max_size < 2 || leaf_max_size > LeafRef::<K, V>::slot_capacity() {
            return Err(GraniteError::Config(format!(
                "leaf_max_size {} outside [2, {}]",
                leaf_max_size,
                LeafRef::<K, V>::slot_capacity()
            )));
        }
        // Internal nodes transiently hold max_size + 1 children before a
        // split, so the page must have room for one extra slot.
        if internal_max_size < 3 || internal_max_size + 1 > InternalRef::<K>::slot_capacity() {
            return Err(GraniteError::Config(format!(
                "internal_max_size {} outside [3, {}]",
                internal_max_size,
                InternalRef::<K>::slot_capacity() - 1
            )));
        }

        let root_id = {
            let mut guard = match pool.fetch_page_write(HEADER_PAGE_ID) {
                Ok(guard) => guard,
                Err(GraniteError::PageNotFound { .. }) => {
                    let mut guard = pool.new_page()?;
                    if guard.page_id() != HEADER_PAGE_ID {
                        return Err(GraniteError::TreeCorrupted(format!(
                            "header page allocated as {}",
                            guard.page_id()
                        )));
                    }
                    HeaderMut::new(guard.data_mut()).init();
                    guard.mark_dirty();
                    guard
                }
                Err(e) => return Err(e),
            };

            match HeaderRef::new(guard.data()).get_root_id(name) {
                Some(root_id) => root_id,
                None => {
                    HeaderMut::new(guard.data_mut()).insert_record(name, PageId::INVALID)?;
                    guard.mark_dirty();
                    PageId::INVALID
                }
            }
        };

        Ok(Self {
            name: name.to_string(),
            pool,
            root: RwLock::new(root_id),
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        })
    }

    /// Largest leaf order that fits the page for this key/value type.
    pub fn default_leaf_max_size() -> usize {
        LeafRef::<K, V>::slot_capacity()
    }

    /// Largest internal order that fits the page for this key type, leaving
    /// room for the transient pre-split overflow slot.
    pub fn default_internal_max_size() -> usize {
        InternalRef::<K>::slot_capacity() - 1
    }

    /// Returns the index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        !self.root.read().is_valid()
    }

    /// Returns the current root page id (INVALID when empty).
    pub fn root_page_id(&self) -> PageId {
        *self.root.read()
    }

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Point lookup.
    ///
    /// Descends with shared latches hand over hand: the child is latched
    /// before the parent is released, so the path cannot be restructured
    /// underneath the reader.
    pub fn get_value(&self, key: &K) -> Result<Option<V>> {
        let root_guard = self.root.read();
        if !root_guard.is_valid() {
            return Ok(None);
        }
        let mut guard = self.pool.fetch_page_read(*root_guard)?;
        drop(root_guard);

        loop {
            match NodeRef::new(guard.data()).node_type()? {
                NodeType::Leaf => {
                    return Ok(LeafRef::<K, V>::new(guard.data()).lookup(key));
                }
                NodeType::Internal => {
                    let child_id = InternalRef::<K>::new(guard.data()).lookup_child(key);
                    let child = self.pool.fetch_page_read(child_id)?;
                    guard = child;
                }
            }
        }
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Inserts a key/value pair. Returns false when the key already exists;
    /// the tree is not modified in that case.
    pub fn insert(&self, key: &K, value: &V) -> Result<bool> {
        let mut ctx = Context::new();
        let root_guard = self.root.write();
        if !root_guard.is_valid() {
            self.start_new_tree(root_guard, key, value)?;
            return Ok(true);
        }
        let root_id = *root_guard;
        ctx.root_guard = Some(root_guard);

        let mut guard = self.pool.fetch_page_write(root_id)?;
        loop {
            match NodeRef::new(guard.data()).node_type()? {
                NodeType::Leaf => break,
                NodeType::Internal => {
                    let child_id = InternalRef::<K>::new(guard.data()).lookup_child(key);
                    let child = self.pool.fetch_page_write(child_id)?;
                    // Safe: an insert into the child cannot fill it, so no
                    // split can propagate above it.
                    let safe = {
                        let child_node = NodeRef::new(child.data());
                        child_node.size() + 1 < child_node.max_size()
                    };
                    ctx.push(guard);
                    if safe {
                        ctx.release_ancestors();
                    }
                    guard = child;
                }
            }
        }

        let search = LeafRef::<K, V>::new(guard.data()).key_index(key);
        match search {
            Ok(_) => {
                drop(guard);
                ctx.finish(&self.pool);
                Ok(false)
            }
            Err(position) => {
                let full = {
                    let mut leaf = LeafMut::<K, V>::new(guard.data_mut());
                    leaf.insert_at(position, key, value);
                    leaf.as_ref().size() == leaf.as_ref().max_size()
                };
                guard.mark_dirty();
                if full {
                    self.split_leaf(&mut ctx, guard)?;
                } else {
                    drop(guard);
                }
                ctx.finish(&self.pool);
                Ok(true)
            }
        }
    }

    /// Builds a single-leaf tree holding the first pair.
    fn start_new_tree(
        &self,
        mut root_guard: parking_lot::RwLockWriteGuard<'_, PageId>,
        key: &K,
        value: &V,
    ) -> Result<()> {
        let mut guard = self.pool.new_page()?;
        let page_id = guard.page_id();
        {
            let mut leaf = LeafMut::<K, V>::new(guard.data_mut());
            leaf.init(page_id, PageId::INVALID, self.leaf_max_size);
            leaf.insert_at(0, key, value);
        }
        guard.mark_dirty();
        drop(guard);

        *root_guard = page_id;
        self.update_root_record(page_id)?;
        tracing::debug!(index = %self.name, root = page_id.0, "started new tree");
        Ok(())
    }

    /// Splits a just-filled leaf, moving its upper half into a new right
    /// sibling and posting the separator to the parent.
    fn split_leaf(&self, ctx: &mut Context<'_>, mut leaf_guard: PageWriteGuard<'_>) -> Result<()> {
        let mut new_guard = self.pool.new_page()?;
        let new_id = new_guard.page_id();
        {
            let mut leaf = LeafMut::<K, V>::new(leaf_guard.data_mut());
            let mut right = LeafMut::<K, V>::new(new_guard.data_mut());
            right.init(new_id, leaf.as_ref().parent_page_id(), self.leaf_max_size);
            leaf.move_half_to(&mut right);
            right.set_next_page_id(leaf.as_ref().next_page_id());
            leaf.set_next_page_id(new_id);
        }
        leaf_guard.mark_dirty();
        new_guard.mark_dirty();

        let separator = LeafRef::<K, V>::new(new_guard.data()).key_at(0);
        tracing::trace!(
            index = %self.name,
            left = leaf_guard.page_id().0,
            right = new_id.0,
            "leaf split"
        );
        self.insert_into_parent(ctx, leaf_guard, separator, new_guard)
    }

    /// Posts `(separator, right)` into the parent of `left`, growing a new
    /// root when `left` was the root and splitting the parent recursively
    /// when it overflows.
    fn insert_into_parent(
        &self,
        ctx: &mut Context<'_>,
        mut left_guard: PageWriteGuard<'_>,
        separator: K,
        mut right_guard: PageWriteGuard<'_>,
    ) -> Result<()> {
        let left_id = left_guard.page_id();
        let right_id = right_guard.page_id();
        let parent_id = NodeRef::new(left_guard.data()).parent_page_id();

        if !parent_id.is_valid() {
            // The old root split: grow the tree by one level.
            let mut root_page = self.pool.new_page()?;
            let new_root_id = root_page.page_id();
            {
                let mut root = InternalMut::<K>::new(root_page.data_mut());
                root.init(new_root_id, PageId::INVALID, self.internal_max_size);
                root.populate_new_root(left_id, &separator, right_id);
            }
            root_page.mark_dirty();
            node::set_parent_page_id(left_guard.data_mut(), new_root_id);
            left_guard.mark_dirty();
            node::set_parent_page_id(right_guard.data_mut(), new_root_id);
            right_guard.mark_dirty();
            drop(left_guard);
            drop(right_guard);
            drop(root_page);

            let tree_root = ctx
                .root_guard
                .as_mut()
                .expect("tree latch must be held across a root split");
            **tree_root = new_root_id;
            self.update_root_record(new_root_id)?;
            tracing::debug!(index = %self.name, root = new_root_id.0, "root split");
            return Ok(());
        }

        let mut parent_guard = ctx
            .pop()
            .expect("parent latch must be held across a split");
        debug_assert_eq!(parent_guard.page_id(), parent_id);

        let new_size = InternalMut::<K>::new(parent_guard.data_mut()).insert_node_after(
            left_id,
            &separator,
            right_id,
        );
        parent_guard.mark_dirty();
        drop(left_guard);
        drop(right_guard);

        if new_size > self.internal_max_size {
            self.split_internal(ctx, parent_guard)
        } else {
            Ok(())
        }
    }

    /// Splits an overflowing internal node and posts the promoted separator
    /// to its parent.
    fn split_internal(
        &self,
        ctx: &mut Context<'_>,
        mut node_guard: PageWriteGuard<'_>,
    ) -> Result<()> {
        let mut new_guard = self.pool.new_page()?;
        let new_id = new_guard.page_id();
        {
            let mut left = InternalMut::<K>::new(node_guard.data_mut());
            let mut right = InternalMut::<K>::new(new_guard.data_mut());
            right.init(new_id, left.as_ref().parent_page_id(), self.internal_max_size);
            left.move_half_to(&mut right);
        }
        node_guard.mark_dirty();
        new_guard.mark_dirty();

        // Children that crossed into the new node point at the old parent.
        let moved: Vec<PageId> = {
            let right = InternalRef::<K>::new(new_guard.data());
            (0..right.size()).map(|i| right.value_at(i)).collect()
        };
        for child_id in moved {
            self.reparent(child_id, new_id)?;
        }

        let separator = InternalRef::<K>::new(new_guard.data()).key_at(0);
        tracing::trace!(
            index = %self.name,
            left = node_guard.page_id().0,
            right = new_id.0,
            "internal split"
        );
        self.insert_into_parent(ctx, node_guard, separator, new_guard)
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Removes a key. Removing an absent key is a silent no-op.
    pub fn remove(&self, key: &K) -> Result<()> {
        let mut ctx = Context::new();
        let root_guard = self.root.write();
        if !root_guard.is_valid() {
            return Ok(());
        }
        let root_id = *root_guard;
        ctx.root_guard = Some(root_guard);

        let mut guard = self.pool.fetch_page_write(root_id)?;
        loop {
            match NodeRef::new(guard.data()).node_type()? {
                NodeType::Leaf => break,
                NodeType::Internal => {
                    let child_id = InternalRef::<K>::new(guard.data()).lookup_child(key);
                    let child = self.pool.fetch_page_write(child_id)?;
                    // Safe: the child can lose one entry without dropping
                    // below minimum occupancy, so no merge can propagate
                    // above it.
                    let safe = {
                        let child_node = NodeRef::new(child.data());
                        child_node.size() > child_node.min_size()
                    };
                    ctx.push(guard);
                    if safe {
                        ctx.release_ancestors();
                    }
                    guard = child;
                }
            }
        }

        let position = match LeafRef::<K, V>::new(guard.data()).key_index(key) {
            Ok(position) => position,
            Err(_) => {
                drop(guard);
                ctx.finish(&self.pool);
                return Ok(());
            }
        };
        LeafMut::<K, V>::new(guard.data_mut()).remove_at(position);
        guard.mark_dirty();

        let (size, min_size, is_root) = {
            let leaf = NodeRef::new(guard.data());
            (leaf.size(), leaf.min_size(), leaf.is_root())
        };
        if is_root {
            if size == 0 {
                self.adjust_root(&mut ctx, guard)?;
            } else {
                drop(guard);
            }
        } else if size < min_size {
            self.coalesce_or_redistribute(&mut ctx, guard)?;
        } else {
            drop(guard);
        }

        ctx.finish(&self.pool);
        Ok(())
    }

    /// Restores minimum occupancy of an underflowing node by borrowing from
    /// a sibling or merging with it, recursing up when the parent underflows
    /// in turn.
    ///
    /// The sibling is chosen deterministically: the left one when it exists,
    /// otherwise the right. Merges always flow right-into-left.
    fn coalesce_or_redistribute(
        &self,
        ctx: &mut Context<'_>,
        mut node_guard: PageWriteGuard<'_>,
    ) -> Result<()> {
        let node_id = node_guard.page_id();
        let (node_type, parent_id) = {
            let node = NodeRef::new(node_guard.data());
            (node.node_type()?, node.parent_page_id())
        };
        if !parent_id.is_valid() {
            return self.adjust_root(ctx, node_guard);
        }

        let mut parent_guard = ctx
            .pop()
            .expect("parent latch must be held for rebalancing");
        debug_assert_eq!(parent_guard.page_id(), parent_id);

        let (index, sibling_id, node_is_right) = {
            let parent = InternalRef::<K>::new(parent_guard.data());
            let index = parent.value_index(node_id).ok_or_else(|| {
                GraniteError::TreeCorrupted(format!(
                    "{} missing from its parent {}",
                    node_id, parent_id
                ))
            })?;
            if index > 0 {
                (index, parent.value_at(index - 1), true)
            } else {
                (index, parent.value_at(index + 1), false)
            }
        };
        // Sibling latched only after the parent, so sibling order cannot
        // deadlock against another rebalance.
        let mut sibling_guard = self.pool.fetch_page_write(sibling_id)?;

        let (sibling_size, sibling_min) = {
            let sibling = NodeRef::new(sibling_guard.data());
            (sibling.size(), sibling.min_size())
        };

        if sibling_size > sibling_min {
            self.redistribute(
                node_type,
                &mut node_guard,
                &mut sibling_guard,
                &mut parent_guard,
                index,
                node_is_right,
            )?;
            tracing::trace!(
                index = %self.name,
                node = node_id.0,
                sibling = sibling_id.0,
                "redistributed one slot"
            );
            return Ok(());
        }

        // Merge right-into-left.
        let (mut left_guard, mut right_guard, right_index) = if node_is_right {
            (sibling_guard, node_guard, index)
        } else {
            (node_guard, sibling_guard, index + 1)
        };
        let left_id = left_guard.page_id();
        let right_id = right_guard.page_id();

        match node_type {
            NodeType::Leaf => {
                let mut right = LeafMut::<K, V>::new(right_guard.data_mut());
                let mut left = LeafMut::<K, V>::new(left_guard.data_mut());
                right.move_all_to(&mut left);
            }
            NodeType::Internal => {
                let middle_key = InternalRef::<K>::new(parent_guard.data()).key_at(right_index);
                let first_moved = NodeRef::new(left_guard.data()).size();
                {
                    let mut right = InternalMut::<K>::new(right_guard.data_mut());
                    let mut left = InternalMut::<K>::new(left_guard.data_mut());
                    right.move_all_to(&mut left, &middle_key);
                }
                let moved: Vec<PageId> = {
                    let left = InternalRef::<K>::new(left_guard.data());
                    (first_moved..left.size()).map(|i| left.value_at(i)).collect()
                };
                for child_id in moved {
                    self.reparent(child_id, left_id)?;
                }
            }
        }
        left_guard.mark_dirty();
        drop(left_guard);
        drop(right_guard);
        ctx.deleted.push(right_id);

        InternalMut::<K>::new(parent_guard.data_mut()).remove_at(right_index);
        parent_guard.mark_dirty();
        tracing::trace!(index = %self.name, left = left_id.0, right = right_id.0, "coalesced nodes");

        let (parent_size, parent_min, parent_is_root) = {
            let parent = NodeRef::new(parent_guard.data());
            (parent.size(), parent.min_size(), parent.is_root())
        };
        if parent_is_root {
            if parent_size == 1 {
                return self.adjust_root(ctx, parent_guard);
            }
            Ok(())
        } else if parent_size < parent_min {
            self.coalesce_or_redistribute(ctx, parent_guard)
        } else {
            Ok(())
        }
    }

    /// Moves one boundary slot from a sibling into the deficient node and
    /// fixes the parent separator. Internal nodes rotate through the parent:
    /// the separator descends and the sibling's edge key ascends.
    #[allow(clippy::too_many_arguments)]
    fn redistribute(
        &self,
        node_type: NodeType,
        node_guard: &mut PageWriteGuard<'_>,
        sibling_guard: &mut PageWriteGuard<'_>,
        parent_guard: &mut PageWriteGuard<'_>,
        index: usize,
        node_is_right: bool,
    ) -> Result<()> {
        let node_id = node_guard.page_id();
        match node_type {
            NodeType::Leaf => {
                if node_is_right {
                    {
                        let mut sibling = LeafMut::<K, V>::new(sibling_guard.data_mut());
                        let mut node = LeafMut::<K, V>::new(node_guard.data_mut());
                        sibling.move_last_to_front_of(&mut node);
                    }
                    let new_separator = LeafRef::<K, V>::new(node_guard.data()).key_at(0);
                    InternalMut::<K>::new(parent_guard.data_mut())
                        .set_key_at(index, &new_separator);
                } else {
                    {
                        let mut sibling = LeafMut::<K, V>::new(sibling_guard.data_mut());
                        let mut node = LeafMut::<K, V>::new(node_guard.data_mut());
                        sibling.move_first_to_end_of(&mut node);
                    }
                    let new_separator = LeafRef::<K, V>::new(sibling_guard.data()).key_at(0);
                    InternalMut::<K>::new(parent_guard.data_mut())
                        .set_key_at(index + 1, &new_separator);
                }
            }
            NodeType::Internal => {
                if node_is_right {
                    let sibling = InternalRef::<K>::new(sibling_guard.data());
                    let middle_key = InternalRef::<K>::new(parent_guard.data()).key_at(index);
                    let rising_key = sibling.key_at(sibling.size() - 1);
                    {
                        let mut sibling = InternalMut::<K>::new(sibling_guard.data_mut());
                        let mut node = InternalMut::<K>::new(node_guard.data_mut());
                        sibling.move_last_to_front_of(&mut node, &middle_key);
                    }
                    InternalMut::<K>::new(parent_guard.data_mut()).set_key_at(index, &rising_key);
                    let moved_child = InternalRef::<K>::new(node_guard.data()).value_at(0);
                    self.reparent(moved_child, node_id)?;
                } else {
                    let middle_key = InternalRef::<K>::new(parent_guard.data()).key_at(index + 1);
                    let rising_key = InternalRef::<K>::new(sibling_guard.data()).key_at(1);
                    {
                        let mut sibling = InternalMut::<K>::new(sibling_guard.data_mut());
                        let mut node = InternalMut::<K>::new(node_guard.data_mut());
                        sibling.move_first_to_end_of(&mut node, &middle_key);
                    }
                    InternalMut::<K>::new(parent_guard.data_mut())
                        .set_key_at(index + 1, &rising_key);
                    let node = InternalRef::<K>::new(node_guard.data());
                    let moved_child = node.value_at(node.size() - 1);
                    self.reparent(moved_child, node_id)?;
                }
            }
        }
        node_guard.mark_dirty();
        sibling_guard.mark_dirty();
        parent_guard.mark_dirty();
        Ok(())
    }

    /// Handles underflow at the root.
    ///
    /// An internal root reduced to a single child hands the tree to that
    /// child; an emptied leaf root empties the tree. Anything else is left
    /// alone, since the root is exempt from minimum occupancy.
    fn adjust_root(&self, ctx: &mut Context<'_>, root_guard: PageWriteGuard<'_>) -> Result<()> {
        let root_id = root_guard.page_id();
        let (node_type, size) = {
            let node = NodeRef::new(root_guard.data());
            (node.node_type()?, node.size())
        };

        match (node_type, size) {
            (NodeType::Internal, 1) => {
                let child_id = InternalRef::<K>::new(root_guard.data()).value_at(0);
                drop(root_guard);
                self.reparent(child_id, PageId::INVALID)?;
                ctx.deleted.push(root_id);

                let tree_root = ctx
                    .root_guard
                    .as_mut()
                    .expect("tree latch must be held for a root change");
                **tree_root = child_id;
                self.update_root_record(child_id)?;
                tracing::debug!(index = %self.name, old = root_id.0, new = child_id.0, "root collapsed");
            }
            (NodeType::Leaf, 0) => {
                drop(root_guard);
                ctx.deleted.push(root_id);

                let tree_root = ctx
                    .root_guard
                    .as_mut()
                    .expect("tree latch must be held for a root change");
                **tree_root = PageId::INVALID;
                self.update_root_record(PageId::INVALID)?;
                tracing::debug!(index = %self.name, old = root_id.0, "tree emptied");
            }
            _ => {}
        }
        Ok(())
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Iterator positioned at the smallest key.
    pub fn iter(&self) -> Result<TreeIterator<'_, K, V>> {
        let root_guard = self.root.read();
        if !root_guard.is_valid() {
            return Ok(TreeIterator::end_of(self));
        }
        let mut guard = self.pool.fetch_page_read(*root_guard)?;
        drop(root_guard);

        loop {
            match NodeRef::new(guard.data()).node_type()? {
                NodeType::Leaf => {
                    return Ok(TreeIterator::at(self, guard.page_id(), 0));
                }
                NodeType::Internal => {
                    let child_id = InternalRef::<K>::new(guard.data()).leftmost_child();
                    let child = self.pool.fetch_page_read(child_id)?;
                    guard = child;
                }
            }
        }
    }

    /// Iterator positioned at the first key greater than or equal to `key`.
    pub fn iter_from(&self, key: &K) -> Result<TreeIterator<'_, K, V>> {
        let root_guard = self.root.read();
        if !root_guard.is_valid() {
            return Ok(TreeIterator::end_of(self));
        }
        let mut guard = self.pool.fetch_page_read(*root_guard)?;
        drop(root_guard);

        loop {
            match NodeRef::new(guard.data()).node_type()? {
                NodeType::Leaf => {
                    let leaf = LeafRef::<K, V>::new(guard.data());
                    let position = match leaf.key_index(key) {
                        Ok(position) => position,
                        Err(position) => position,
                    };
                    return Ok(TreeIterator::at(self, guard.page_id(), position));
                }
                NodeType::Internal => {
                    let child_id = InternalRef::<K>::new(guard.data()).lookup_child(key);
                    let child = self.pool.fetch_page_read(child_id)?;
                    guard = child;
                }
            }
        }
    }

    /// The end sentinel.
    pub fn end(&self) -> TreeIterator<'_, K, V> {
        TreeIterator::end_of(self)
    }

    // =========================================================================
    // Integrity checking
    // =========================================================================

    /// Walks the whole tree verifying its structural invariants: header
    /// consistency, parent pointers, strictly increasing keys, separator
    /// bounds, occupancy limits, and uniform leaf depth.
    ///
    /// Intended for tests and debugging; must not run concurrently with
    /// writers.
    pub fn check_integrity(&self) -> Result<()> {
        let root_id = *self.root.read();
        if !root_id.is_valid() {
            return Ok(());
        }
        self.check_node(root_id, PageId::INVALID, None, None)?;
        Ok(())
    }

    /// Checks one subtree; returns its leaf depth. Keys must lie in
    /// `[lower, upper)`.
    fn check_node(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        lower: Option<K>,
        upper: Option<K>,
    ) -> Result<usize> {
        let corrupt = |what: String| GraniteError::TreeCorrupted(what);

        let guard = self.pool.fetch_page_read(page_id)?;
        let node = NodeRef::new(guard.data());
        if node.page_id() != page_id {
            return Err(corrupt(format!(
                "{} header records id {}",
                page_id,
                node.page_id()
            )));
        }
        if node.parent_page_id() != expected_parent {
            return Err(corrupt(format!(
                "{} records parent {}, expected {}",
                page_id,
                node.parent_page_id(),
                expected_parent
            )));
        }
        let is_root = !expected_parent.is_valid();

        match node.node_type()? {
            NodeType::Leaf => {
                let leaf = LeafRef::<K, V>::new(guard.data());
                let (size, min_size, max_size) = (leaf.size(), leaf.min_size(), leaf.max_size());
                if is_root {
                    if size == 0 {
                        return Err(corrupt(format!("empty leaf {} left as root", page_id)));
                    }
                } else if size < min_size || size >= max_size {
                    return Err(corrupt(format!(
                        "leaf {} occupancy {} outside [{}, {}]",
                        page_id,
                        size,
                        min_size,
                        max_size - 1
                    )));
                }
                for i in 0..size {
                    let key = leaf.key_at(i);
                    if i > 0 && leaf.key_at(i - 1) >= key {
                        return Err(corrupt(format!("leaf {} keys out of order", page_id)));
                    }
                    if lower.is_some_and(|low| key < low) || upper.is_some_and(|up| key >= up) {
                        return Err(corrupt(format!(
                            "leaf {} key outside separator bounds",
                            page_id
                        )));
                    }
                }
                Ok(1)
            }
            NodeType::Internal => {
                let internal = InternalRef::<K>::new(guard.data());
                let (size, min_size, max_size) =
                    (internal.size(), internal.min_size(), internal.max_size());
                if is_root {
                    if size < 2 {
                        return Err(corrupt(format!(
                            "internal root {} with {} children",
                            page_id, size
                        )));
                    }
                } else if size < min_size || size > max_size {
                    return Err(corrupt(format!(
                        "internal {} occupancy {} outside [{}, {}]",
                        page_id, size, min_size, max_size
                    )));
                }

                let mut children = Vec::with_capacity(size);
                for i in 0..size {
                    if i >= 1 {
                        let key = internal.key_at(i);
                        if i > 1 && internal.key_at(i - 1) >= key {
                            return Err(corrupt(format!(
                                "internal {} separators out of order",
                                page_id
                            )));
                        }
                        if lower.is_some_and(|low| key < low) || upper.is_some_and(|up| key >= up) {
                            return Err(corrupt(format!(
                                "internal {} separator outside bounds",
                                page_id
                            )));
                        }
                    }
                    let child_lower = if i == 0 { lower } else { Some(internal.key_at(i)) };
                    let child_upper = if i + 1 < size {
                        Some(internal.key_at(i + 1))
                    } else {
                        upper
                    };
                    children.push((internal.value_at(i), child_lower, child_upper));
                }
                drop(guard);

                let mut depth = None;
                for (child_id, child_lower, child_upper) in children {
                    let child_depth =
                        self.check_node(child_id, page_id, child_lower, child_upper)?;
                    match depth {
                        None => depth = Some(child_depth),
                        Some(expected) if expected != child_depth => {
                            return Err(corrupt(format!(
                                "leaves under {} at unequal depths",
                                page_id
                            )));
                        }
                        Some(_) => {}
                    }
                }
                Ok(depth.unwrap_or(1) + 1)
            }
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Rewrites a child's parent pointer.
    fn reparent(&self, child_id: PageId, parent_id: PageId) -> Result<()> {
        let mut child = self.pool.fetch_page_write(child_id)?;
        node::set_parent_page_id(child.data_mut(), parent_id);
        child.mark_dirty();
        Ok(())
    }

    /// Mirrors a root change into the header page.
    fn update_root_record(&self, root_id: PageId) -> Result<()> {
        let mut guard = self.pool.fetch_page_write(HEADER_PAGE_ID)?;
        HeaderMut::new(guard.data_mut()).update_record(&self.name, root_id)?;
        guard.mark_dirty();
        Ok(())
    }
}
