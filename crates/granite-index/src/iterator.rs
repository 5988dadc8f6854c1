//! Forward ordered iteration over the leaf chain.

use crate::key::{IndexKey, IndexValue};
use crate::node::LeafRef;
use crate::tree::BPlusTree;
use granite_common::page::PageId;
use granite_common::Result;

/// Forward iterator over a B+Tree's `(key, value)` pairs.
///
/// The position is `(leaf page id, slot index)`; two iterators are equal
/// when they point at the same slot. Each step pins the current leaf and
/// takes a short shared latch to decode one slot, so at most one leaf is
/// held at a time; reaching the end of a leaf follows `next_page_id`, and an
/// invalid id is the end sentinel.
///
/// The iterator is not safe against concurrent writers: a split or merge
/// between steps may skip or repeat keys. Callers that need a stable scan
/// must serialize against writers externally.
pub struct TreeIterator<'a, K: IndexKey, V: IndexValue> {
    tree: &'a BPlusTree<K, V>,
    page_id: PageId,
    index: usize,
}

impl<'a, K: IndexKey, V: IndexValue> TreeIterator<'a, K, V> {
    pub(crate) fn at(tree: &'a BPlusTree<K, V>, page_id: PageId, index: usize) -> Self {
        Self {
            tree,
            page_id,
            index,
        }
    }

    pub(crate) fn end_of(tree: &'a BPlusTree<K, V>) -> Self {
        Self {
            tree,
            page_id: PageId::INVALID,
            index: 0,
        }
    }

    /// Returns true once the iterator has passed the last slot.
    pub fn is_end(&self) -> bool {
        !self.page_id.is_valid()
    }

    /// Yields the next `(key, value)` pair, or `None` at the end.
    pub fn next_entry(&mut self) -> Result<Option<(K, V)>> {
        loop {
            if !self.page_id.is_valid() {
                return Ok(None);
            }

            let guard = self.tree.pool().fetch_page_read(self.page_id)?;
            let leaf = LeafRef::<K, V>::new(guard.data());
            if self.index < leaf.size() {
                let entry = (leaf.key_at(self.index), leaf.value_at(self.index));
                self.index += 1;
                return Ok(Some(entry));
            }

            // Leaf exhausted: hop to the next one in the chain.
            let next = leaf.next_page_id();
            drop(guard);
            self.page_id = next;
            self.index = 0;
        }
    }

    /// Drains the iterator into a vector.
    pub fn collect_entries(mut self) -> Result<Vec<(K, V)>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl<K: IndexKey, V: IndexValue> PartialEq for TreeIterator<'_, K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.page_id == other.page_id && self.index == other.index
    }
}

impl<K: IndexKey, V: IndexValue> Eq for TreeIterator<'_, K, V> {}

impl<K: IndexKey, V: IndexValue> std::fmt::Debug for TreeIterator<'_, K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeIterator")
            .field("page_id", &self.page_id)
            .field("index", &self.index)
            .finish()
    }
}
