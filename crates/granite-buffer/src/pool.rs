//! Buffer pool manager.

use crate::disk::DiskManager;
use crate::frame::{BufferFrame, FrameId};
use crate::replacer::LruReplacer;
use granite_common::page::{PageId, PAGE_SIZE};
use granite_common::{GraniteError, Result};
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { num_frames: 1024 }
    }
}

impl From<&granite_common::StorageConfig> for BufferPoolConfig {
    fn from(config: &granite_common::StorageConfig) -> Self {
        // A parallel pool divides the configured frame budget evenly.
        Self {
            num_frames: config.buffer_pool_frames / config.buffer_pool_instances.max(1),
        }
    }
}

/// Metadata guarded by the pool mutex.
struct PoolState {
    /// Maps resident page IDs to the frames holding them.
    page_table: HashMap<PageId, FrameId>,
    /// Frames never used, or returned by delete_page.
    free_list: Vec<FrameId>,
    /// Next page ID this instance will allocate.
    next_page_id: u32,
}

/// Buffer pool manager.
///
/// Manages a fixed-size pool of page frames with:
/// - Page ID to frame ID mapping (page table)
/// - Free frame list for never-used frames
/// - Strict LRU replacement for eviction
/// - Pin counting and per-frame reader/writer latches
///
/// Access is bracketed by RAII guards: fetching or creating a page pins the
/// frame and acquires its latch; dropping the guard releases the latch and
/// then unpins, handing the frame to the replacer when the pin count reaches
/// zero.
///
/// The pool mutex is never held across disk I/O or a blocking latch
/// acquisition. A victim frame is detached from the page table (and pinned)
/// before the mutex is released, so its write-back and refill happen on a
/// frame no other thread can reach.
pub struct BufferPool {
    config: BufferPoolConfig,
    /// Array of buffer frames, fixed at construction.
    frames: Vec<BufferFrame>,
    /// Page table, free list, and page ID allocator.
    state: Mutex<PoolState>,
    /// Eviction policy.
    replacer: LruReplacer,
    /// Block I/O collaborator.
    disk: Arc<DiskManager>,
    /// Index of this instance within a parallel pool (0 when standalone).
    instance_index: u32,
    /// Total instances in the parallel pool (1 when standalone).
    num_instances: u32,
}

impl BufferPool {
    /// Creates a standalone buffer pool.
    pub fn new(config: BufferPoolConfig, disk: Arc<DiskManager>) -> Self {
        Self::new_instance(config, disk, 0, 1)
    }

    /// Creates one instance of a parallel buffer pool.
    ///
    /// Instance `k` of `n` allocates page IDs `k, k+n, k+2n, …` so that
    /// `page_id % n == k` holds for every page it owns.
    pub fn new_instance(
        config: BufferPoolConfig,
        disk: Arc<DiskManager>,
        instance_index: u32,
        num_instances: u32,
    ) -> Self {
        assert!(num_instances > 0, "parallel pool needs at least one instance");
        assert!(
            instance_index < num_instances,
            "instance index {} out of range for {} instances",
            instance_index,
            num_instances
        );

        let num_frames = config.num_frames;
        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32)))
            .collect();
        let free_list: Vec<_> = (0..num_frames).rev().map(|i| FrameId(i as u32)).collect();

        // Resume allocation past whatever the file already holds, staying on
        // this instance's id stride.
        let existing = disk.num_pages();
        let next_page_id = if existing <= instance_index {
            instance_index
        } else {
            let steps = (existing - instance_index + num_instances - 1) / num_instances;
            instance_index + steps * num_instances
        };

        Self {
            config,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::with_capacity(num_frames),
                free_list,
                next_page_id,
            }),
            replacer: LruReplacer::new(num_frames),
            disk,
            instance_index,
            num_instances,
        }
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns this instance's index within the parallel pool.
    pub fn instance_index(&self) -> u32 {
        self.instance_index
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.state.lock().free_list.len()
    }

    /// Returns the number of pages currently resident.
    pub fn page_count(&self) -> usize {
        self.state.lock().page_table.len()
    }

    /// Checks if a page is resident in the pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.state.lock().page_table.contains_key(&page_id)
    }

    /// Returns the pin count of a resident page.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock();
        let fid = state.page_table.get(&page_id)?;
        Some(self.frames[fid.0 as usize].pin_count())
    }

    /// Allocates a fresh page, returning it pinned, zeroed, and write-latched.
    ///
    /// Returns `Err(BufferPoolFull)` when every frame is pinned.
    pub fn new_page(&self) -> Result<PageWriteGuard<'_>> {
        let mut state = self.state.lock();
        let page_id = PageId::new(state.next_page_id);
        let (frame, mut latch, dirty_victim) = self.claim_frame(&mut state, page_id)?;
        state.next_page_id += self.num_instances;
        drop(state);

        if let Err(e) = self.prepare_new_frame(page_id, &mut latch, dirty_victim) {
            self.abort_claim(page_id, frame, latch);
            return Err(e);
        }

        tracing::trace!(page = page_id.0, frame = frame.frame_id().0, "allocated new page");
        Ok(PageWriteGuard::new(self, page_id, latch))
    }

    /// Fetches a page with a shared latch, reading it from disk on a miss.
    ///
    /// Returns `Err(BufferPoolFull)` when the page is not resident and every
    /// frame is pinned.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<PageReadGuard<'_>> {
        loop {
            let mut state = self.state.lock();
            if let Some(&fid) = state.page_table.get(&page_id) {
                let frame = &self.frames[fid.0 as usize];
                frame.pin();
                self.replacer.pin(fid);
                drop(state);

                let latch = frame.read_data();
                if frame.page_id() == Some(page_id) {
                    return Ok(PageReadGuard::new(self, page_id, latch));
                }
                // The frame was retired by a failed load while we waited on
                // the latch; return it and retry from the page table.
                drop(latch);
                self.release_orphan(frame);
                continue;
            }

            let (frame, mut latch, dirty_victim) = self.claim_frame(&mut state, page_id)?;
            drop(state);

            if let Err(e) = self.load_frame(page_id, &mut latch, dirty_victim) {
                self.abort_claim(page_id, frame, latch);
                return Err(e);
            }
            return Ok(PageReadGuard::new(self, page_id, RwLockWriteGuard::downgrade(latch)));
        }
    }

    /// Fetches a page with an exclusive latch, reading it from disk on a miss.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<PageWriteGuard<'_>> {
        loop {
            let mut state = self.state.lock();
            if let Some(&fid) = state.page_table.get(&page_id) {
                let frame = &self.frames[fid.0 as usize];
                frame.pin();
                self.replacer.pin(fid);
                drop(state);

                let latch = frame.write_data();
                if frame.page_id() == Some(page_id) {
                    return Ok(PageWriteGuard::new(self, page_id, latch));
                }
                drop(latch);
                self.release_orphan(frame);
                continue;
            }

            let (frame, mut latch, dirty_victim) = self.claim_frame(&mut state, page_id)?;
            drop(state);

            if let Err(e) = self.load_frame(page_id, &mut latch, dirty_victim) {
                self.abort_claim(page_id, frame, latch);
                return Err(e);
            }
            return Ok(PageWriteGuard::new(self, page_id, latch));
        }
    }

    /// Unpins a page, ORing `is_dirty` into the frame's dirty bit.
    ///
    /// A page already written back stays clean only if no unpin in between
    /// marked it dirty again; the flag never downgrades dirty to clean. The
    /// frame becomes eviction-eligible when its pin count reaches zero.
    /// Returns true when the page is not resident (no-op).
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let state = self.state.lock();
        let Some(&fid) = state.page_table.get(&page_id) else {
            return true;
        };
        let frame = &self.frames[fid.0 as usize];
        if is_dirty {
            frame.set_dirty(true);
        }
        if frame.unpin() == 0 {
            self.replacer.unpin(fid);
        }
        true
    }

    /// Writes a resident dirty page back to disk and clears its dirty bit.
    ///
    /// Returns false when the page is not resident or not dirty.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let state = self.state.lock();
        let Some(&fid) = state.page_table.get(&page_id) else {
            return Ok(false);
        };
        let frame = &self.frames[fid.0 as usize];
        // Hold a pin across the I/O so the frame cannot be evicted.
        frame.pin();
        self.replacer.pin(fid);
        drop(state);

        let result = (|| {
            let latch = frame.read_data();
            if !frame.is_dirty() {
                return Ok(false);
            }
            self.disk.write_page(page_id, &latch)?;
            frame.set_dirty(false);
            Ok(true)
        })();

        self.unpin_page(page_id, false);
        result
    }

    /// Flushes every dirty resident page. Returns the number flushed.
    pub fn flush_all(&self) -> Result<usize> {
        let resident: Vec<PageId> = self.state.lock().page_table.keys().copied().collect();

        let mut flushed = 0;
        for page_id in resident {
            if self.flush_page(page_id)? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Removes a page from the pool, returning its frame to the free list.
    ///
    /// Returns true when the page is not resident, false when it is pinned.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut state = self.state.lock();
        let Some(&fid) = state.page_table.get(&page_id) else {
            return true;
        };
        let frame = &self.frames[fid.0 as usize];
        if frame.is_pinned() {
            return false;
        }

        state.page_table.remove(&page_id);
        self.replacer.pin(fid);
        // Unpinned frames hold no latch, so the reset cannot block.
        frame.reset();
        state.free_list.push(fid);
        true
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let state = self.state.lock();
        let mut pinned_frames = 0;
        let mut dirty_frames = 0;
        for fid in state.page_table.values() {
            let frame = &self.frames[fid.0 as usize];
            if frame.is_pinned() {
                pinned_frames += 1;
            }
            if frame.is_dirty() {
                dirty_frames += 1;
            }
        }

        BufferPoolStats {
            total_frames: self.config.num_frames,
            free_frames: state.free_list.len(),
            used_frames: state.page_table.len(),
            pinned_frames,
            dirty_frames,
        }
    }

    /// Claims a victim frame for `page_id` while the pool mutex is held.
    ///
    /// On return the frame is pinned once, exclusively latched, mapped to
    /// `page_id`, and its previous mapping is gone, so it is unreachable for
    /// every other thread until the caller finishes filling it. The returned
    /// page ID is the victim's previous page when it must be written back.
    fn claim_frame<'p>(
        &'p self,
        state: &mut PoolState,
        page_id: PageId,
    ) -> Result<(
        &'p BufferFrame,
        RwLockWriteGuard<'p, Box<[u8; PAGE_SIZE]>>,
        Option<PageId>,
    )> {
        let frame_id = if let Some(fid) = state.free_list.pop() {
            fid
        } else if let Some(fid) = self.replacer.victim() {
            fid
        } else {
            return Err(GraniteError::BufferPoolFull);
        };

        let frame = &self.frames[frame_id.0 as usize];
        debug_assert_eq!(frame.pin_count(), 0, "victim frame {} is pinned", frame_id);
        // Latch holders always hold pins, so an unpinned victim cannot be
        // latched and the non-blocking acquisition succeeds.
        let latch = frame
            .try_write_data()
            .expect("victim frame latched while unpinned");

        let old_page = frame.page_id();
        let dirty_victim = if frame.is_dirty() { old_page } else { None };
        if let Some(old_id) = old_page {
            state.page_table.remove(&old_id);
        }
        frame.set_page_id(Some(page_id));
        frame.set_dirty(false);
        frame.pin();
        state.page_table.insert(page_id, frame_id);

        Ok((frame, latch, dirty_victim))
    }

    /// Writes back the victim's old contents if dirty, then reads `page_id`
    /// from disk into the claimed frame.
    fn load_frame(
        &self,
        page_id: PageId,
        latch: &mut RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>>,
        dirty_victim: Option<PageId>,
    ) -> Result<()> {
        if let Some(old_id) = dirty_victim {
            tracing::trace!(victim = old_id.0, "writing back dirty page before frame reuse");
            self.disk.write_page(old_id, latch)?;
        }
        let data = self.disk.read_page(page_id)?;
        latch.copy_from_slice(&data);
        Ok(())
    }

    /// Writes back the victim's old contents if dirty, then zeroes the frame
    /// and zero-extends the file so the new page is readable after eviction.
    fn prepare_new_frame(
        &self,
        page_id: PageId,
        latch: &mut RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>>,
        dirty_victim: Option<PageId>,
    ) -> Result<()> {
        if let Some(old_id) = dirty_victim {
            tracing::trace!(victim = old_id.0, "writing back dirty page before frame reuse");
            self.disk.write_page(old_id, latch)?;
        }
        latch.fill(0);
        self.disk.allocate_page(page_id)?;
        Ok(())
    }

    /// Undoes a claim whose load failed.
    ///
    /// Concurrent fetchers may already hold pins on the doomed mapping; they
    /// revalidate after acquiring the latch and return the frame themselves,
    /// so the frame goes back to the free list only when the last pin drops.
    fn abort_claim(
        &self,
        page_id: PageId,
        frame: &BufferFrame,
        latch: RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>>,
    ) {
        let mut state = self.state.lock();
        state.page_table.remove(&page_id);
        frame.set_page_id(None);
        frame.set_dirty(false);
        let remaining = frame.unpin();
        drop(latch);
        if remaining == 0 {
            state.free_list.push(frame.frame_id());
        }
    }

    /// Drops a pin taken against a mapping that turned out to be retired.
    fn release_orphan(&self, frame: &BufferFrame) {
        if frame.unpin() == 0 {
            self.state.lock().free_list.push(frame.frame_id());
        }
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames holding pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
}

/// RAII guard for reading a page.
///
/// Holds one pin and the frame's shared latch; dropping the guard releases
/// the latch first and then unpins.
pub struct PageReadGuard<'a> {
    pool: &'a BufferPool,
    page_id: PageId,
    latch: Option<RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>>,
}

impl<'a> PageReadGuard<'a> {
    fn new(
        pool: &'a BufferPool,
        page_id: PageId,
        latch: RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>,
    ) -> Self {
        Self {
            pool,
            page_id,
            latch: Some(latch),
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page bytes.
    pub fn data(&self) -> &[u8] {
        let latch = self.latch.as_ref().expect("page latch released");
        &latch[..]
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        // The latch must be released before the unpin: a frame that reaches
        // pin count zero may be claimed for eviction at any moment.
        self.latch.take();
        self.pool.unpin_page(self.page_id, false);
    }
}

/// RAII guard for writing a page.
///
/// Holds one pin and the frame's exclusive latch. Call `mark_dirty` after
/// modifying the page; the drop-time unpin carries the flag into the frame's
/// dirty bit.
pub struct PageWriteGuard<'a> {
    pool: &'a BufferPool,
    page_id: PageId,
    dirty: bool,
    latch: Option<RwLockWriteGuard<'a, Box<[u8; PAGE_SIZE]>>>,
}

impl<'a> PageWriteGuard<'a> {
    fn new(
        pool: &'a BufferPool,
        page_id: PageId,
        latch: RwLockWriteGuard<'a, Box<[u8; PAGE_SIZE]>>,
    ) -> Self {
        Self {
            pool,
            page_id,
            dirty: false,
            latch: Some(latch),
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page bytes.
    pub fn data(&self) -> &[u8] {
        let latch = self.latch.as_ref().expect("page latch released");
        &latch[..]
    }

    /// Returns the page bytes mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let latch = self.latch.as_mut().expect("page latch released");
        &mut latch[..]
    }

    /// Records that the page was modified.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Returns true if the guard was marked dirty.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        self.latch.take();
        self.pool.unpin_page(self.page_id, self.dirty);
    }
}
