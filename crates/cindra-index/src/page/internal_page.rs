//! Internal page layout and operations.

use super::{
    read_u32, write_u32, TreePageType, MAX_SIZE_OFFSET, PAGE_TYPE_OFFSET, SIZE_OFFSET,
    TREE_PAGE_HEADER_SIZE,
};
use crate::key::{IndexKey, KeyComparator};
use cindra_common::page::PAGE_SIZE;
use std::cmp::Ordering;
use std::marker::PhantomData;

/// Size of the internal page header (just the shared prefix).
pub const INTERNAL_HEADER_SIZE: usize = TREE_PAGE_HEADER_SIZE;

/// Returns how many (key, child) pairs fit in one internal page.
pub fn internal_capacity<K: IndexKey>() -> usize {
    (PAGE_SIZE - INTERNAL_HEADER_SIZE) / (K::ENCODED_SIZE + 4)
}

#[inline(always)]
fn entry_offset<K: IndexKey>(slot: usize) -> usize {
    INTERNAL_HEADER_SIZE + slot * (K::ENCODED_SIZE + 4)
}

#[inline(always)]
fn entry_size<K: IndexKey>() -> usize {
    K::ENCODED_SIZE + 4
}

/// Read-only view of an internal page.
///
/// Layout after the shared prefix: a dense array of (key, child page
/// number) pairs of length `size`. The key in slot 0 is unused; `size`
/// counts children, so a page with `size` entries holds `size - 1`
/// separator keys. Child `i` covers keys in `[key_at(i), key_at(i + 1))`
/// with the slot-0 key read as negative infinity.
pub struct InternalPageRef<'a, K> {
    data: &'a [u8],
    _marker: PhantomData<K>,
}

impl<'a, K: IndexKey> InternalPageRef<'a, K> {
    /// Creates a view over internal page bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }

    /// Returns the number of children.
    pub fn size(&self) -> u32 {
        read_u32(self.data, SIZE_OFFSET)
    }

    /// Returns the configured maximum size.
    pub fn max_size(&self) -> u32 {
        read_u32(self.data, MAX_SIZE_OFFSET)
    }

    /// Returns the minimum size a non-root internal page must keep.
    pub fn min_size(&self) -> u32 {
        (self.max_size() + 1) / 2
    }

    /// Returns the separator key at `slot` (meaningful for `slot >= 1`).
    pub fn key_at(&self, slot: usize) -> K {
        K::decode(&self.data[entry_offset::<K>(slot)..])
    }

    /// Returns the child page number at `slot`.
    pub fn child_at(&self, slot: usize) -> u32 {
        read_u32(self.data, entry_offset::<K>(slot) + K::ENCODED_SIZE)
    }

    /// Returns the slot of the child to descend into for `key`.
    ///
    /// Binary search over slots `1..size` for the largest separator
    /// `<=` the target; slot 0 acts as negative infinity, so a key below
    /// every separator lands on slot 0. An exact separator match descends
    /// into that separator's right child.
    pub fn child_index_for<C: KeyComparator<K>>(&self, comparator: &C, key: &K) -> usize {
        let mut low = 1usize;
        let mut high = self.size() as usize;

        while low < high {
            let mid = low + (high - low) / 2;
            match comparator.compare(&self.key_at(mid), key) {
                Ordering::Greater => high = mid,
                _ => low = mid + 1,
            }
        }
        low - 1
    }

    /// Returns the slot whose child equals `page_num`, by linear scan.
    pub fn value_index(&self, page_num: u32) -> Option<usize> {
        (0..self.size() as usize).find(|&slot| self.child_at(slot) == page_num)
    }
}

/// Mutable view of an internal page.
pub struct InternalPageMut<'a, K> {
    data: &'a mut [u8],
    _marker: PhantomData<K>,
}

impl<'a, K: IndexKey> InternalPageMut<'a, K> {
    /// Creates a mutable view over internal page bytes.
    pub fn new(data: &'a mut [u8]) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }

    fn view(&self) -> InternalPageRef<'_, K> {
        InternalPageRef::new(self.data)
    }

    /// Initializes an empty internal page with the given maximum size.
    pub fn init(&mut self, max_size: u32) {
        write_u32(self.data, PAGE_TYPE_OFFSET, TreePageType::Internal as u32);
        write_u32(self.data, SIZE_OFFSET, 0);
        write_u32(self.data, MAX_SIZE_OFFSET, max_size);
    }

    /// Returns the number of children.
    pub fn size(&self) -> u32 {
        self.view().size()
    }

    /// Returns the configured maximum size.
    pub fn max_size(&self) -> u32 {
        self.view().max_size()
    }

    /// Returns the minimum size a non-root internal page must keep.
    pub fn min_size(&self) -> u32 {
        self.view().min_size()
    }

    /// Returns the separator key at `slot`.
    pub fn key_at(&self, slot: usize) -> K {
        self.view().key_at(slot)
    }

    /// Returns the child page number at `slot`.
    pub fn child_at(&self, slot: usize) -> u32 {
        self.view().child_at(slot)
    }

    /// See [`InternalPageRef::value_index`].
    pub fn value_index(&self, page_num: u32) -> Option<usize> {
        self.view().value_index(page_num)
    }

    /// Sets the stored size.
    pub fn set_size(&mut self, size: u32) {
        write_u32(self.data, SIZE_OFFSET, size);
    }

    /// Overwrites the separator key at `slot`.
    pub fn set_key_at(&mut self, slot: usize, key: &K) {
        key.encode_into(&mut self.data[entry_offset::<K>(slot)..]);
    }

    /// Overwrites the child page number at `slot`.
    pub fn set_child_at(&mut self, slot: usize, page_num: u32) {
        write_u32(self.data, entry_offset::<K>(slot) + K::ENCODED_SIZE, page_num);
    }

    /// Rebuilds the page as `first_child` plus the given separator pairs.
    pub fn set_entries(&mut self, first_child: u32, entries: &[(K, u32)]) {
        self.set_child_at(0, first_child);
        for (i, (key, child)) in entries.iter().enumerate() {
            self.set_key_at(i + 1, key);
            self.set_child_at(i + 1, *child);
        }
        self.set_size(entries.len() as u32 + 1);
    }

    /// Inserts a (key, child) pair at `slot`, shifting the suffix up.
    ///
    /// Inserting at slot 0 shifts the old slot-0 child into slot 1, where
    /// its key position becomes meaningful; callers overwrite it.
    pub fn insert_entry_at(&mut self, slot: usize, key: &K, child: u32) {
        let size = self.size() as usize;
        let start = entry_offset::<K>(slot);
        let end = entry_offset::<K>(size);
        self.data.copy_within(start..end, start + entry_size::<K>());
        self.set_key_at(slot, key);
        self.set_child_at(slot, child);
        self.set_size(size as u32 + 1);
    }

    /// Removes the (key, child) pair at `slot`, shifting the suffix down.
    ///
    /// Removing slot 0 drops the first child; the old slot-1 key shifts
    /// into the unused slot-0 key position.
    pub fn remove_entry_at(&mut self, slot: usize) {
        let size = self.size() as usize;
        let start = entry_offset::<K>(slot + 1);
        let end = entry_offset::<K>(size);
        self.data.copy_within(start..end, entry_offset::<K>(slot));
        self.set_size(size as u32 - 1);
    }
}
