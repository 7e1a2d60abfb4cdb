//! Scoped page guards.
//!
//! A guard owns one fetched page: it holds the buffer pool pin and, for the
//! read/write variants, the per-page latch. Dropping a guard releases the
//! latch and returns the pin exactly once, propagating the dirty flag for
//! write guards. Guards are movable but not copyable.

use crate::frame::{FrameReadLatch, FrameWriteLatch};
use crate::pool::BufferPool;
use cindra_common::page::{PageId, PAGE_SIZE};
use parking_lot::RwLock;
use std::sync::Arc;

/// A basic (unlatched) guard on a pinned page.
///
/// Returned by page allocation. Supports a one-shot upgrade to a read or
/// write guard, taken immediately after allocation so later fetches of the
/// new page encounter a latched page.
pub struct PageGuard {
    pool: Arc<BufferPool>,
    page_id: PageId,
    data: Arc<RwLock<Box<[u8; PAGE_SIZE]>>>,
    /// Set when the pin has been handed to an upgraded guard.
    upgraded: bool,
}

impl PageGuard {
    pub(crate) fn new(
        pool: Arc<BufferPool>,
        page_id: PageId,
        data: Arc<RwLock<Box<[u8; PAGE_SIZE]>>>,
    ) -> Self {
        Self {
            pool,
            page_id,
            data,
            upgraded: false,
        }
    }

    /// Returns the underlying page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Upgrades this guard to a read guard, acquiring the shared latch.
    pub fn upgrade_read(mut self) -> ReadPageGuard {
        self.upgraded = true;
        let pool = Arc::clone(&self.pool);
        let page_id = self.page_id;
        let latch = self.data.read_arc();
        ReadPageGuard {
            pool,
            page_id,
            latch: Some(latch),
        }
    }

    /// Upgrades this guard to a write guard, acquiring the exclusive latch.
    pub fn upgrade_write(mut self) -> WritePageGuard {
        self.upgraded = true;
        let pool = Arc::clone(&self.pool);
        let page_id = self.page_id;
        let latch = self.data.write_arc();
        WritePageGuard {
            pool,
            page_id,
            latch: Some(latch),
            dirty: false,
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if !self.upgraded {
            self.pool.unpin_page(self.page_id, false);
        }
    }
}

/// An RAII guard holding the shared latch on a pinned page.
pub struct ReadPageGuard {
    pool: Arc<BufferPool>,
    page_id: PageId,
    latch: Option<FrameReadLatch>,
}

impl ReadPageGuard {
    pub(crate) fn new(pool: Arc<BufferPool>, page_id: PageId, latch: FrameReadLatch) -> Self {
        Self {
            pool,
            page_id,
            latch: Some(latch),
        }
    }

    /// Returns the underlying page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page bytes.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        self.latch.as_ref().expect("page latch already released")
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        // Latch first, then the pin, so the replacer never sees a
        // latched-but-unpinned frame.
        self.latch.take();
        self.pool.unpin_page(self.page_id, false);
    }
}

/// An RAII guard holding the exclusive latch on a pinned page.
///
/// Mutable access through [`data_mut`](Self::data_mut) marks the page
/// dirty; the flag propagates to the frame when the guard drops, including
/// for guards created through the upgrade path.
pub struct WritePageGuard {
    pool: Arc<BufferPool>,
    page_id: PageId,
    latch: Option<FrameWriteLatch>,
    dirty: bool,
}

impl WritePageGuard {
    pub(crate) fn new(pool: Arc<BufferPool>, page_id: PageId, latch: FrameWriteLatch) -> Self {
        Self {
            pool,
            page_id,
            latch: Some(latch),
            dirty: false,
        }
    }

    /// Returns the underlying page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page bytes.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        self.latch.as_ref().expect("page latch already released")
    }

    /// Returns the page bytes mutably and marks the page dirty.
    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.dirty = true;
        self.latch.as_mut().expect("page latch already released")
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        self.latch.take();
        self.pool.unpin_page(self.page_id, self.dirty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DiskManager, DiskManagerConfig};
    use crate::pool::BufferPoolConfig;
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
    fn test_basic_guard_pins_page() {
        let (pool, _dir) = create_test_pool(4);

        let guard = pool.allocate_page(0).unwrap();
        let page_id = guard.page_id();
        assert_eq!(pool.pin_count_of(page_id), 1);

        drop(guard);
        assert_eq!(pool.pin_count_of(page_id), 0);
    }

    #[test]
    fn test_upgrade_write_then_read_back() {
        let (pool, _dir) = create_test_pool(4);

        let guard = pool.allocate_page(0).unwrap();
        let page_id = guard.page_id();

        {
            let mut write = guard.upgrade_write();
            write.data_mut()[0] = 0xAB;
        }

        // Pin released exactly once through the upgrade path
        assert_eq!(pool.pin_count_of(page_id), 0);

        let read = pool.fetch_read(page_id).unwrap();
        assert_eq!(read.data()[0], 0xAB);
    }

    #[test]
    fn test_upgrade_read_allows_shared_access() {
        let (pool, _dir) = create_test_pool(4);

        let guard = pool.allocate_page(0).unwrap();
        let page_id = guard.page_id();

        let r1 = guard.upgrade_read();
        let r2 = pool.fetch_read(page_id).unwrap();
        assert_eq!(r1.data()[0], r2.data()[0]);
    }

    #[test]
    fn test_write_guard_marks_dirty_only_on_mutation() {
        let (pool, _dir) = create_test_pool(4);

        let page_id = pool.allocate_page(0).unwrap().page_id();

        {
            let write = pool.fetch_write(page_id).unwrap();
            // No data_mut call: page stays clean
            let _ = write.data();
        }
        assert!(!pool.is_dirty(page_id));

        {
            let mut write = pool.fetch_write(page_id).unwrap();
            write.data_mut()[1] = 0x42;
        }
        assert!(pool.is_dirty(page_id));
    }

    #[test]
    fn test_write_guard_excludes_readers() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc as StdArc;

        let (pool, _dir) = create_test_pool(4);
        let page_id = pool.allocate_page(0).unwrap().page_id();

        let mut write = pool.fetch_write(page_id).unwrap();
        write.data_mut()[0] = 1;

        let reader_ran = StdArc::new(AtomicBool::new(false));
        let flag = StdArc::clone(&reader_ran);
        let pool2 = StdArc::clone(&pool);
        let handle = std::thread::spawn(move || {
            let read = pool2.fetch_read(page_id).unwrap();
            flag.store(true, Ordering::SeqCst);
            read.data()[0]
        });

        // Reader must block while the write latch is held
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!reader_ran.load(Ordering::SeqCst));

        drop(write);
        assert_eq!(handle.join().unwrap(), 1);
    }
}
