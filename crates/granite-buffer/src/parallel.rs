//! Parallel buffer pool: page ids sharded across independent pool instances.

use crate::disk::DiskManager;
use crate::pool::{BufferPool, BufferPoolConfig, PageReadGuard, PageWriteGuard};
use granite_common::page::PageId;
use granite_common::{GraniteError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A buffer pool composed of `N` independent instances.
///
/// Every page-addressed operation routes to `instances[page_id % N]`, and
/// instance `k` allocates only ids congruent to `k` mod `N`, so the routing
/// is stable for a page's whole lifetime. Sharding spreads page-table and
/// replacer contention across `N` mutexes.
pub struct ParallelBufferPool {
    instances: Vec<BufferPool>,
    /// Rotates the instance that serves the next new_page call.
    next_instance: AtomicUsize,
}

impl ParallelBufferPool {
    /// Creates a parallel pool of `num_instances` pools with `config.num_frames`
    /// frames each, all sharing one disk manager.
    pub fn new(config: BufferPoolConfig, disk: Arc<DiskManager>, num_instances: usize) -> Self {
        assert!(num_instances > 0, "parallel pool needs at least one instance");

        let instances = (0..num_instances)
            .map(|i| {
                BufferPool::new_instance(
                    config.clone(),
                    Arc::clone(&disk),
                    i as u32,
                    num_instances as u32,
                )
            })
            .collect();

        Self {
            instances,
            next_instance: AtomicUsize::new(0),
        }
    }

    /// Returns the number of pool instances.
    pub fn num_instances(&self) -> usize {
        self.instances.len()
    }

    /// Returns the total number of frames across all instances.
    pub fn num_frames(&self) -> usize {
        self.instances.iter().map(|p| p.num_frames()).sum()
    }

    /// Returns the instance responsible for a page.
    fn instance_for(&self, page_id: PageId) -> &BufferPool {
        &self.instances[(page_id.0 as usize) % self.instances.len()]
    }

    /// Allocates a fresh page from some instance.
    ///
    /// Starts from a rotating instance and falls over to the next when one is
    /// out of frames; fails only when every instance is full.
    pub fn new_page(&self) -> Result<PageWriteGuard<'_>> {
        let start = self.next_instance.fetch_add(1, Ordering::Relaxed);
        for offset in 0..self.instances.len() {
            let instance = &self.instances[(start + offset) % self.instances.len()];
            match instance.new_page() {
                Ok(guard) => return Ok(guard),
                Err(GraniteError::BufferPoolFull) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(GraniteError::BufferPoolFull)
    }

    /// Fetches a page with a shared latch from its owning instance.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<PageReadGuard<'_>> {
        self.instance_for(page_id).fetch_page_read(page_id)
    }

    /// Fetches a page with an exclusive latch from its owning instance.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<PageWriteGuard<'_>> {
        self.instance_for(page_id).fetch_page_write(page_id)
    }

    /// Unpins a page in its owning instance.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        self.instance_for(page_id).unpin_page(page_id, is_dirty)
    }

    /// Flushes a page in its owning instance.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        self.instance_for(page_id).flush_page(page_id)
    }

    /// Flushes every dirty page in every instance.
    pub fn flush_all(&self) -> Result<usize> {
        let mut flushed = 0;
        for instance in &self.instances {
            flushed += instance.flush_all()?;
        }
        Ok(flushed)
    }

    /// Deletes a page from its owning instance.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        self.instance_for(page_id).delete_page(page_id)
    }

    /// Checks if a page is resident in its owning instance.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.instance_for(page_id).contains(page_id)
    }
}
