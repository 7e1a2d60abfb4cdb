//! Per-operation bookkeeping for tree mutations.

use cindra_buffer::WritePageGuard;
use cindra_common::page::INVALID_PAGE_NUM;
use std::collections::VecDeque;

/// State carried through one insert or remove.
///
/// Holds the header write guard (until the operation proves the root
/// cannot change), the root page number observed under that guard, and
/// the ordered deque of write guards on the current root-to-leaf path.
/// Guards release their latches when the context drops; ancestor release
/// during crabbing drains the deque from the front.
pub(crate) struct Context {
    /// Write guard on the header page, released once the root is safe.
    pub header: Option<WritePageGuard>,
    /// Root page number observed at the start of the operation.
    pub root_page_num: u32,
    /// Write guards from the root (front) down to the current node (back).
    pub write_set: VecDeque<WritePageGuard>,
    /// Pages logically freed by this operation, reclaimed after all
    /// guards have dropped.
    pub freed: Vec<u32>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            header: None,
            root_page_num: INVALID_PAGE_NUM,
            write_set: VecDeque::new(),
            freed: Vec::new(),
        }
    }

    /// Releases every ancestor latch plus the header latch.
    ///
    /// Called when the node currently being latched is proven safe; its
    /// own guard is not yet in the deque.
    pub fn release_ancestors(&mut self) {
        while let Some(guard) = self.write_set.pop_front() {
            drop(guard);
        }
        self.header = None;
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Path latches release in reverse order of acquisition; the
        // header guard, acquired first, drops last as a field.
        while let Some(guard) = self.write_set.pop_back() {
            drop(guard);
        }
    }
}
