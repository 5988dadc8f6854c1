//! Crab-latching context for a single tree operation.

use granite_buffer::{BufferPool, PageWriteGuard};
use granite_common::page::PageId;
use parking_lot::RwLockWriteGuard;
use std::collections::VecDeque;

/// Tracks the latches and deferred page deletions of one structural
/// operation (insert or remove).
///
/// The write set holds the ancestor page guards retained during descent,
/// root side at the front, and the optional tree-latch guard protects the
/// root id. When the descent proves a child safe, everything above it is
/// released at once. Pages emptied by a merge are only recorded here; they
/// are handed to the buffer pool after every latch has dropped, so a page is
/// never freed while its latch is held.
pub(crate) struct Context<'a> {
    /// Tree-level latch guarding the root id, held until the operation
    /// proves it cannot change the root.
    pub(crate) root_guard: Option<RwLockWriteGuard<'a, PageId>>,
    /// Ancestor page guards retained during descent, root side first.
    pub(crate) write_set: VecDeque<PageWriteGuard<'a>>,
    /// Pages emptied during coalescing, freed after all latches drop.
    pub(crate) deleted: Vec<PageId>,
}

impl<'a> Context<'a> {
    pub(crate) fn new() -> Self {
        Self {
            root_guard: None,
            write_set: VecDeque::new(),
            deleted: Vec::new(),
        }
    }

    /// Appends a latched ancestor to the hold queue.
    pub(crate) fn push(&mut self, guard: PageWriteGuard<'a>) {
        self.write_set.push_back(guard);
    }

    /// Takes back the nearest held ancestor (the parent of the node being
    /// worked on).
    pub(crate) fn pop(&mut self) -> Option<PageWriteGuard<'a>> {
        self.write_set.pop_back()
    }

    /// Releases every held ancestor latch, including the tree latch.
    ///
    /// Called when the descent reaches a safe node: nothing above it can be
    /// touched by this operation anymore.
    pub(crate) fn release_ancestors(&mut self) {
        self.write_set.clear();
        self.root_guard = None;
    }

    /// Releases all remaining latches, then frees the pages deferred for
    /// deletion.
    pub(crate) fn finish(mut self, pool: &BufferPool) {
        self.write_set.clear();
        self.root_guard = None;
        for page_id in self.deleted.drain(..) {
            // A false return means a straggling reader still pins the page;
            // it then lingers in the pool until evicted, which is harmless.
            let _ = pool.delete_page(page_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granite_buffer::{BufferPoolConfig, DiskManager, DiskManagerConfig};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn create_test_pool() -> (BufferPool, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(
            DiskManager::new(DiskManagerConfig {
                db_path: dir.path().join("ctx.db"),
                fsync_enabled: false,
            })
            .unwrap(),
        );
        (
            BufferPool::new(BufferPoolConfig { num_frames: 8 }, disk),
            dir,
        )
    }

    #[test]
    fn test_context_release_ancestors_unpins() {
        let (pool, _dir) = create_test_pool();

        let mut ctx = Context::new();
        let guard = pool.new_page().unwrap();
        let page_id = guard.page_id();
        ctx.push(guard);
        assert_eq!(pool.pin_count(page_id), Some(1));

        ctx.release_ancestors();
        assert_eq!(pool.pin_count(page_id), Some(0));
        assert!(ctx.write_set.is_empty());
    }

    #[test]
    fn test_context_pop_returns_nearest_ancestor() {
        let (pool, _dir) = create_test_pool();

        let mut ctx = Context::new();
        let first = pool.new_page().unwrap().page_id();
        let second = pool.new_page().unwrap().page_id();
        ctx.push(pool.fetch_page_write(first).unwrap());
        ctx.push(pool.fetch_page_write(second).unwrap());

        assert_eq!(ctx.pop().unwrap().page_id(), second);
        assert_eq!(ctx.pop().unwrap().page_id(), first);
        assert!(ctx.pop().is_none());
    }

    #[test]
    fn test_context_finish_frees_deferred_pages() {
        let (pool, _dir) = create_test_pool();

        let mut ctx = Context::new();
        let guard = pool.new_page().unwrap();
        let page_id = guard.page_id();
        ctx.push(guard);
        ctx.deleted.push(page_id);

        ctx.finish(&pool);
        // The page was unlatched, unpinned, and then deleted from the pool.
        assert!(!pool.contains(page_id));
    }
}
