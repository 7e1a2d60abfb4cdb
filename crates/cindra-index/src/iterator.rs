//! Forward iteration over the leaf sibling chain.

use crate::key::IndexKey;
use crate::page::LeafPageRef;
use cindra_buffer::{BufferPool, ReadPageGuard};
use cindra_common::page::{PageId, INVALID_PAGE_NUM};
use cindra_common::RecordId;
use std::marker::PhantomData;
use std::sync::Arc;

/// Forward iterator over a tree's (key, record id) pairs.
///
/// Positioned as (leaf page, slot); advancing walks the leaf and then
/// follows the next-leaf pointer. At most one read-latched leaf is held
/// at a time, and the current leaf is released before the next one is
/// fetched, so the iterator does not see a consistent snapshot across
/// concurrent mutations: a structural change to the current leaf
/// invalidates the iteration (documented behavior).
pub struct TreeIterator<K> {
    pool: Arc<BufferPool>,
    file_id: u32,
    leaf: Option<ReadPageGuard>,
    slot: usize,
    _marker: PhantomData<K>,
}

impl<K: IndexKey> TreeIterator<K> {
    pub(crate) fn new(pool: Arc<BufferPool>, file_id: u32, leaf: ReadPageGuard, slot: usize) -> Self {
        Self {
            pool,
            file_id,
            leaf: Some(leaf),
            slot,
            _marker: PhantomData,
        }
    }

    /// The past-the-end iterator.
    pub(crate) fn end(pool: Arc<BufferPool>, file_id: u32) -> Self {
        Self {
            pool,
            file_id,
            leaf: None,
            slot: 0,
            _marker: PhantomData,
        }
    }

    /// Returns true once iteration is exhausted.
    pub fn is_end(&self) -> bool {
        self.leaf.is_none()
    }

    /// Returns the current (leaf page number, slot) position, if any.
    pub fn position(&self) -> Option<(u32, usize)> {
        self.leaf
            .as_ref()
            .map(|guard| (guard.page_id().page_num, self.slot))
    }
}

impl<K: IndexKey> Iterator for TreeIterator<K> {
    type Item = (K, RecordId);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let guard = self.leaf.as_ref()?;
            let next_num = {
                let view = LeafPageRef::<K>::new(guard.data());
                if self.slot < view.size() as usize {
                    let item = (view.key_at(self.slot), view.record_at(self.slot));
                    self.slot += 1;
                    return Some(item);
                }
                view.next_page_num()
            };

            // Past the last slot: release this leaf, then follow the chain.
            self.leaf = None;
            self.slot = 0;
            if next_num == INVALID_PAGE_NUM {
                return None;
            }
            match self.pool.fetch_read(PageId::new(self.file_id, next_num)) {
                Ok(guard) => self.leaf = Some(guard),
                // A vanished leaf means the chain mutated under us;
                // iteration ends rather than reporting phantom state.
                Err(_) => return None,
            }
        }
    }
}
