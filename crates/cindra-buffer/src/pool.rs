//! Buffer pool manager.

use crate::disk::DiskManager;
use crate::frame::{BufferFrame, FrameId};
use crate::guard::{PageGuard, ReadPageGuard, WritePageGuard};
use crate::page_table::PageTable;
use crate::replacer::{ClockReplacer, Replacer};
use cindra_common::page::{PageId, PAGE_SIZE};
use cindra_common::{CindraError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use sysinfo::System;

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

/// Buffer pool manager.
///
/// Manages a fixed-size pool of page frames with:
/// - Page ID to frame ID mapping (lock-free page table)
/// - Free frame list for new pages
/// - Clock replacement for eviction, with dirty write-back to disk
/// - Pin counting and per-page latches, consumed through scoped guards
pub struct BufferPool {
    /// Configuration.
    config: BufferPoolConfig,
    /// Array of buffer frames.
    frames: Vec<BufferFrame>,
    /// Page ID to frame ID mapping (lock-free reads).
    page_table: PageTable,
    /// List of free frame IDs.
    free_list: Mutex<Vec<FrameId>>,
    /// Page replacement policy.
    replacer: ClockReplacer,
    /// Backing storage for page reads, write-back, and allocation.
    disk: Arc<DiskManager>,
    /// Serializes the fetch-miss path so one page is loaded once.
    miss_lock: Mutex<()>,
}

impl BufferPool {
    /// Creates a new buffer pool backed by the given disk manager.
    pub fn new(config: BufferPoolConfig, disk: Arc<DiskManager>) -> Self {
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32)))
            .collect();

        // All frames start in the free list
        let free_list: Vec<_> = (0..num_frames).map(|i| FrameId(i as u32)).collect();

        Self {
            config,
            frames,
            page_table: PageTable::new(num_frames),
            free_list: Mutex::new(free_list),
            replacer: ClockReplacer::new(num_frames),
            disk,
            miss_lock: Mutex::new(()),
        }
    }

    /// Creates a buffer pool sized to 25% of available system RAM.
    ///
    /// Minimum 1,000 frames to ensure useful caching even on low-memory
    /// systems.
    pub fn auto_sized(disk: Arc<DiskManager>) -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4;
        let num_frames = (target_bytes / PAGE_SIZE).max(1_000);

        Self::new(BufferPoolConfig { num_frames }, disk)
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Returns the number of pages currently in the pool.
    pub fn page_count(&self) -> usize {
        self.page_table.len()
    }

    /// Checks if a page is in the buffer pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.contains(page_id)
    }

    /// Returns the backing disk manager.
    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    /// Returns the pin count of a cached page (0 if absent).
    pub fn pin_count_of(&self, page_id: PageId) -> u32 {
        self.page_table
            .get(page_id)
            .map(|frame_id| self.frames[frame_id.0 as usize].pin_count())
            .unwrap_or(0)
    }

    /// Returns true if a cached page is dirty.
    pub fn is_dirty(&self, page_id: PageId) -> bool {
        self.page_table
            .get(page_id)
            .map(|frame_id| self.frames[frame_id.0 as usize].is_dirty())
            .unwrap_or(false)
    }

    /// Pins a cached page, if present.
    ///
    /// Rechecks the mapping after pinning: a fetch racing with eviction may
    /// pin a frame that has just been recycled, in which case the transient
    /// pin is undone and the lookup retried.
    fn pin_cached(&self, page_id: PageId) -> Option<FrameId> {
        loop {
            let frame_id = self.page_table.get(page_id)?;
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            self.replacer.set_evictable(frame_id, false);
            self.replacer.record_access(frame_id);

            if frame.page_id() == Some(page_id) && self.page_table.get(page_id) == Some(frame_id) {
                return Some(frame_id);
            }

            // Lost a race with eviction; undo and retry
            frame.unpin();
        }
    }

    /// Allocates a frame for a new page.
    ///
    /// Tries the free list first, then evicts an unpinned victim, writing
    /// it back to disk if dirty. The returned frame is reset and unmapped.
    fn allocate_frame(&self) -> Result<FrameId> {
        loop {
            {
                let mut free_list = self.free_list.lock();
                if let Some(frame_id) = free_list.pop() {
                    return Ok(frame_id);
                }
            }

            let victim_id = self
                .replacer
                .evict(&|frame_id| self.frames[frame_id.0 as usize].pin_count() == 0)
                .ok_or(CindraError::BufferPoolFull)?;

            let frame = &self.frames[victim_id.0 as usize];
            let old_page_id = frame.page_id();

            // Unmap first so no new pins can land through the table
            if let Some(old) = old_page_id {
                self.page_table.remove(old);
            }

            // A fetch may have pinned between the evict check and the unmap
            if frame.pin_count() != 0 {
                if let Some(old) = old_page_id {
                    self.page_table.insert(old, victim_id);
                }
                self.replacer.set_evictable(victim_id, true);
                continue;
            }

            if frame.is_dirty() {
                if let Some(old) = old_page_id {
                    let mut data = Box::new([0u8; PAGE_SIZE]);
                    frame.copy_to(&mut data[..]);
                    self.disk.write_page(old, &data)?;
                }
            }

            frame.reset();
            return Ok(victim_id);
        }
    }

    /// Loads a page into a fresh frame, pinned.
    ///
    /// With `read_from_disk`, the page contents are fetched from storage;
    /// otherwise the frame stays zeroed (newly allocated pages).
    fn load_frame(&self, page_id: PageId, read_from_disk: bool) -> Result<FrameId> {
        let _single_flight = self.miss_lock.lock();

        // Another thread may have loaded the page while we waited
        if let Some(frame_id) = self.pin_cached(page_id) {
            return Ok(frame_id);
        }

        let frame_id = self.allocate_frame()?;
        let frame = &self.frames[frame_id.0 as usize];

        if read_from_disk {
            match self.disk.read_page(page_id) {
                Ok(data) => frame.copy_from(&data),
                Err(e) => {
                    self.free_list.lock().push(frame_id);
                    return Err(e);
                }
            }
        }

        frame.set_page_id(Some(page_id));
        frame.pin();
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);
        self.page_table.insert(page_id, frame_id);

        Ok(frame_id)
    }

    /// Pins the frame holding `page_id`, loading it from disk on a miss.
    fn fetch_frame(&self, page_id: PageId) -> Result<FrameId> {
        if let Some(frame_id) = self.pin_cached(page_id) {
            return Ok(frame_id);
        }
        self.load_frame(page_id, true)
    }

    /// Fetches a page and takes its shared latch.
    pub fn fetch_read(self: &Arc<Self>, page_id: PageId) -> Result<ReadPageGuard> {
        let frame_id = self.fetch_frame(page_id)?;
        let latch = self.frames[frame_id.0 as usize].latch_read();
        Ok(ReadPageGuard::new(Arc::clone(self), page_id, latch))
    }

    /// Fetches a page and takes its exclusive latch.
    pub fn fetch_write(self: &Arc<Self>, page_id: PageId) -> Result<WritePageGuard> {
        let frame_id = self.fetch_frame(page_id)?;
        let latch = self.frames[frame_id.0 as usize].latch_write();
        Ok(WritePageGuard::new(Arc::clone(self), page_id, latch))
    }

    /// Allocates a new page in the given file and returns a basic guard.
    ///
    /// The page is pinned but unlatched; callers upgrade the guard before
    /// writing so later fetches of the new page encounter a latched page.
    pub fn allocate_page(self: &Arc<Self>, file_id: u32) -> Result<PageGuard> {
        let page_id = self.disk.allocate_page(file_id)?;
        let frame_id = self.load_frame(page_id, false)?;
        let data = self.frames[frame_id.0 as usize].data_arc();
        Ok(PageGuard::new(Arc::clone(self), page_id, data))
    }

    /// Unpins a page in the buffer pool.
    ///
    /// If the page becomes unpinned (pin count = 0), it becomes evictable.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];

            if is_dirty {
                frame.set_dirty(true);
            }

            if frame.unpin() == 0 {
                self.replacer.set_evictable(frame_id, true);
            }
            return true;
        }
        false
    }

    /// Deletes a page from the buffer pool.
    ///
    /// Returns true if the page was deleted.
    /// Returns false if the page is pinned or not in the pool.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        if let Some(frame_id) = self.page_table.remove(page_id) {
            let frame = &self.frames[frame_id.0 as usize];

            // Cannot delete a pinned page - re-insert if pinned
            if frame.is_pinned() {
                self.page_table.insert(page_id, frame_id);
                return false;
            }

            self.replacer.remove(frame_id);
            frame.reset();
            self.free_list.lock().push(frame_id);

            return true;
        }
        false
    }

    /// Flushes a page to disk if it is cached and dirty.
    ///
    /// Returns true if the page was written.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];

            if frame.is_dirty() {
                let mut data = Box::new([0u8; PAGE_SIZE]);
                frame.copy_to(&mut data[..]);
                self.disk.write_page(page_id, &data)?;
                frame.set_dirty(false);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Flushes all dirty pages to disk.
    ///
    /// Returns the number of pages flushed.
    pub fn flush_all(&self) -> Result<usize> {
        let mut cached = Vec::new();
        self.page_table.for_each(|page_id, _| {
            cached.push(page_id);
            true
        });

        let mut flushed = 0;
        for page_id in cached {
            if self.flush_page(page_id)? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let mut pinned_count = 0;
        let mut dirty_count = 0;

        self.page_table.for_each(|_, frame_id| {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_pinned() {
                pinned_count += 1;
            }
            if frame.is_dirty() {
                dirty_count += 1;
            }
            true
        });

        BufferPoolStats {
            total_frames: self.config.num_frames,
            free_frames: self.free_count(),
            used_frames: self.page_table.len(),
            pinned_frames: pinned_count,
            dirty_frames: dirty_count,
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
    /// Number of frames with pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskManagerConfig;
    use tempfile::tempdir;

    fn create_test_pool(num_frames: usize) -> (Arc<BufferPool>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let disk = DiskManager::new(DiskManagerConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
        })
        .unwrap();
        let pool = Arc::new(BufferPool::new(
            BufferPoolConfig { num_frames },
            Arc::new(disk),
        ));
        (pool, dir)
    }

    #[test]
    fn test_buffer_pool_new() {
        let (pool, _dir) = create_test_pool(10);

        assert_eq!(pool.num_frames(), 10);
        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn test_buffer_pool_allocate_page() {
        let (pool, _dir) = create_test_pool(10);

        let guard = pool.allocate_page(0).unwrap();
        let page_id = guard.page_id();

        assert_eq!(page_id, PageId::new(0, 0));
        assert_eq!(pool.free_count(), 9);
        assert_eq!(pool.page_count(), 1);
        assert!(pool.contains(page_id));
        assert_eq!(pool.pin_count_of(page_id), 1);
    }

    #[test]
    fn test_buffer_pool_fetch_after_drop() {
        let (pool, _dir) = create_test_pool(10);

        let page_id = {
            let guard = pool.allocate_page(0).unwrap();
            let mut write = guard.upgrade_write();
            write.data_mut()[7] = 0x5A;
            write.page_id()
        };

        assert_eq!(pool.pin_count_of(page_id), 0);

        let read = pool.fetch_read(page_id).unwrap();
        assert_eq!(read.data()[7], 0x5A);
        assert_eq!(pool.pin_count_of(page_id), 1);
    }

    #[test]
    fn test_buffer_pool_fetch_nonexistent() {
        let (pool, _dir) = create_test_pool(10);

        let result = pool.fetch_read(PageId::new(0, 99));
        assert!(result.is_err());
        // The failed fetch leaks nothing
        assert_eq!(pool.free_count(), 10);
    }

    #[test]
    fn test_buffer_pool_eviction_with_write_back() {
        let (pool, _dir) = create_test_pool(3);

        // Fill the pool with dirty pages
        let mut page_ids = Vec::new();
        for i in 0..3u8 {
            let guard = pool.allocate_page(0).unwrap();
            let mut write = guard.upgrade_write();
            write.data_mut()[0] = i;
            page_ids.push(write.page_id());
        }

        assert_eq!(pool.free_count(), 0);

        // A fourth page forces an eviction
        let guard = pool.allocate_page(0).unwrap();
        drop(guard);
        assert_eq!(pool.page_count(), 3);

        // Every page still reads back with its contents, evicted or not
        for (i, page_id) in page_ids.iter().enumerate() {
            let read = pool.fetch_read(*page_id).unwrap();
            assert_eq!(read.data()[0], i as u8);
            drop(read);
        }
    }

    #[test]
    fn test_buffer_pool_pinned_pages_not_evicted() {
        let (pool, _dir) = create_test_pool(2);

        let g1 = pool.allocate_page(0).unwrap().upgrade_read();
        let g2 = pool.allocate_page(0).unwrap().upgrade_read();

        // Both frames pinned: allocation must fail, not evict
        let result = pool.allocate_page(0);
        assert!(matches!(result, Err(CindraError::BufferPoolFull)));

        drop(g1);
        drop(g2);

        // Now allocation succeeds again
        assert!(pool.allocate_page(0).is_ok());
    }

    #[test]
    fn test_buffer_pool_delete_page() {
        let (pool, _dir) = create_test_pool(10);

        let page_id = pool.allocate_page(0).unwrap().page_id();

        assert!(pool.delete_page(page_id));
        assert!(!pool.contains(page_id));
        assert_eq!(pool.free_count(), 10);
    }

    #[test]
    fn test_buffer_pool_delete_pinned_page_fails() {
        let (pool, _dir) = create_test_pool(10);

        let guard = pool.allocate_page(0).unwrap();
        let page_id = guard.page_id();

        assert!(!pool.delete_page(page_id));
        assert!(pool.contains(page_id));

        drop(guard);
        assert!(pool.delete_page(page_id));
    }

    #[test]
    fn test_buffer_pool_flush_page() {
        let (pool, _dir) = create_test_pool(10);

        let page_id = {
            let guard = pool.allocate_page(0).unwrap();
            let mut write = guard.upgrade_write();
            write.data_mut()[0] = 0xCC;
            write.page_id()
        };

        assert!(pool.is_dirty(page_id));
        assert!(pool.flush_page(page_id).unwrap());
        assert!(!pool.is_dirty(page_id));

        // Clean page flushes as a no-op
        assert!(!pool.flush_page(page_id).unwrap());

        // Contents reached disk
        assert_eq!(pool.disk().read_page(page_id).unwrap()[0], 0xCC);
    }

    #[test]
    fn test_buffer_pool_flush_all() {
        let (pool, _dir) = create_test_pool(10);

        for _ in 0..3 {
            let guard = pool.allocate_page(0).unwrap();
            let mut write = guard.upgrade_write();
            write.data_mut()[0] = 0x01;
        }

        assert_eq!(pool.flush_all().unwrap(), 3);
        assert_eq!(pool.flush_all().unwrap(), 0);
    }

    #[test]
    fn test_buffer_pool_stats() {
        let (pool, _dir) = create_test_pool(10);

        // One dirty page: the flag propagates when the write guard drops
        let dirty_page = {
            let guard = pool.allocate_page(0).unwrap();
            let mut write = guard.upgrade_write();
            write.data_mut()[0] = 1;
            write.page_id()
        };
        // Keep it pinned through a read guard
        let _read = pool.fetch_read(dirty_page).unwrap();

        // One clean, unpinned page
        let clean = pool.allocate_page(0).unwrap();
        drop(clean);

        let stats = pool.stats();
        assert_eq!(stats.total_frames, 10);
        assert_eq!(stats.used_frames, 2);
        assert_eq!(stats.pinned_frames, 1);
        assert_eq!(stats.dirty_frames, 1);
        assert_eq!(stats.free_frames, 8);
    }

    #[test]
    fn test_buffer_pool_concurrent_fetches() {
        use std::thread;

        let (pool, _dir) = create_test_pool(8);

        let page_id = {
            let guard = pool.allocate_page(0).unwrap();
            let mut write = guard.upgrade_write();
            write.data_mut()[0] = 0x77;
            write.page_id()
        };

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let read = pool.fetch_read(page_id).unwrap();
                    assert_eq!(read.data()[0], 0x77);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pool.pin_count_of(page_id), 0);
    }
}
