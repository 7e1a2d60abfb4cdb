//! Leaf page layout and operations.

use super::{
    read_u32, write_u32, TreePageType, MAX_SIZE_OFFSET, PAGE_TYPE_OFFSET, SIZE_OFFSET,
    TREE_PAGE_HEADER_SIZE,
};
use crate::key::{IndexKey, KeyComparator};
use cindra_common::page::{INVALID_PAGE_NUM, PAGE_SIZE};
use cindra_common::RecordId;
use std::cmp::Ordering;
use std::marker::PhantomData;

/// Byte offset of the next-leaf page number.
const NEXT_PAGE_OFFSET: usize = TREE_PAGE_HEADER_SIZE;

/// Size of the leaf page header: shared prefix plus the next pointer.
pub const LEAF_HEADER_SIZE: usize = TREE_PAGE_HEADER_SIZE + 4;

/// Returns how many (key, record id) pairs fit in one leaf page.
pub fn leaf_capacity<K: IndexKey>() -> usize {
    (PAGE_SIZE - LEAF_HEADER_SIZE) / (K::ENCODED_SIZE + RecordId::ENCODED_SIZE)
}

#[inline(always)]
fn entry_offset<K: IndexKey>(slot: usize) -> usize {
    LEAF_HEADER_SIZE + slot * (K::ENCODED_SIZE + RecordId::ENCODED_SIZE)
}

#[inline(always)]
fn entry_size<K: IndexKey>() -> usize {
    K::ENCODED_SIZE + RecordId::ENCODED_SIZE
}

/// Read-only view of a leaf page.
///
/// Layout after the shared prefix:
///
/// ```text
/// [12..16)  next leaf page number (sentinel at the rightmost leaf)
/// [16..)    dense array of (key, record id) pairs, sorted ascending
/// ```
pub struct LeafPageRef<'a, K> {
    data: &'a [u8],
    _marker: PhantomData<K>,
}

impl<'a, K: IndexKey> LeafPageRef<'a, K> {
    /// Creates a view over leaf page bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }

    /// Returns the number of stored pairs.
    pub fn size(&self) -> u32 {
        read_u32(self.data, SIZE_OFFSET)
    }

    /// Returns the configured maximum size.
    pub fn max_size(&self) -> u32 {
        read_u32(self.data, MAX_SIZE_OFFSET)
    }

    /// Returns the minimum size a non-root leaf must keep.
    pub fn min_size(&self) -> u32 {
        self.max_size() / 2
    }

    /// Returns the next-leaf page number (sentinel at the rightmost leaf).
    pub fn next_page_num(&self) -> u32 {
        read_u32(self.data, NEXT_PAGE_OFFSET)
    }

    /// Returns the key at `slot`.
    pub fn key_at(&self, slot: usize) -> K {
        K::decode(&self.data[entry_offset::<K>(slot)..])
    }

    /// Returns the record id at `slot`.
    pub fn record_at(&self, slot: usize) -> RecordId {
        RecordId::decode(&self.data[entry_offset::<K>(slot) + K::ENCODED_SIZE..])
    }

    /// Binary-searches for `key`.
    ///
    /// Returns `Ok(slot)` on an exact match and `Err(slot)` with the
    /// insertion point otherwise; equivalently, the largest slot whose key
    /// is `<=` the target is `Ok(slot)` or `Err(slot) - 1` (none when the
    /// insertion point is 0).
    pub fn search<C: KeyComparator<K>>(
        &self,
        comparator: &C,
        key: &K,
    ) -> std::result::Result<usize, usize> {
        let mut low = 0usize;
        let mut high = self.size() as usize;

        while low < high {
            let mid = low + (high - low) / 2;
            match comparator.compare(&self.key_at(mid), key) {
                Ordering::Equal => return Ok(mid),
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
            }
        }
        Err(low)
    }
}

/// Mutable view of a leaf page.
pub struct LeafPageMut<'a, K> {
    data: &'a mut [u8],
    _marker: PhantomData<K>,
}

impl<'a, K: IndexKey> LeafPageMut<'a, K> {
    /// Creates a mutable view over leaf page bytes.
    pub fn new(data: &'a mut [u8]) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }

    fn view(&self) -> LeafPageRef<'_, K> {
        LeafPageRef::new(self.data)
    }

    /// Initializes an empty leaf with the given maximum size.
    pub fn init(&mut self, max_size: u32) {
        write_u32(self.data, PAGE_TYPE_OFFSET, TreePageType::Leaf as u32);
        write_u32(self.data, SIZE_OFFSET, 0);
        write_u32(self.data, MAX_SIZE_OFFSET, max_size);
        write_u32(self.data, NEXT_PAGE_OFFSET, INVALID_PAGE_NUM);
    }

    /// Returns the number of stored pairs.
    pub fn size(&self) -> u32 {
        self.view().size()
    }

    /// Returns the configured maximum size.
    pub fn max_size(&self) -> u32 {
        self.view().max_size()
    }

    /// Returns the minimum size a non-root leaf must keep.
    pub fn min_size(&self) -> u32 {
        self.view().min_size()
    }

    /// Returns the next-leaf page number.
    pub fn next_page_num(&self) -> u32 {
        self.view().next_page_num()
    }

    /// Returns the key at `slot`.
    pub fn key_at(&self, slot: usize) -> K {
        self.view().key_at(slot)
    }

    /// Returns the record id at `slot`.
    pub fn record_at(&self, slot: usize) -> RecordId {
        self.view().record_at(slot)
    }

    /// Binary-searches for `key`; see [`LeafPageRef::search`].
    pub fn search<C: KeyComparator<K>>(
        &self,
        comparator: &C,
        key: &K,
    ) -> std::result::Result<usize, usize> {
        self.view().search(comparator, key)
    }

    /// Sets the stored size.
    pub fn set_size(&mut self, size: u32) {
        write_u32(self.data, SIZE_OFFSET, size);
    }

    /// Sets the next-leaf page number.
    pub fn set_next_page_num(&mut self, page_num: u32) {
        write_u32(self.data, NEXT_PAGE_OFFSET, page_num);
    }

    /// Writes the pair at `slot` without adjusting the size.
    pub fn set_at(&mut self, slot: usize, key: &K, rid: RecordId) {
        let offset = entry_offset::<K>(slot);
        key.encode_into(&mut self.data[offset..]);
        rid.encode_into(&mut self.data[offset + K::ENCODED_SIZE..]);
    }

    /// Overwrites the key at `slot`.
    pub fn set_key_at(&mut self, slot: usize, key: &K) {
        key.encode_into(&mut self.data[entry_offset::<K>(slot)..]);
    }

    /// Inserts a pair at `slot`, shifting the suffix up by one.
    pub fn insert_at(&mut self, slot: usize, key: &K, rid: RecordId) {
        let size = self.size() as usize;
        let start = entry_offset::<K>(slot);
        let end = entry_offset::<K>(size);
        self.data.copy_within(start..end, start + entry_size::<K>());
        self.set_at(slot, key, rid);
        self.set_size(size as u32 + 1);
    }

    /// Removes the pair at `slot`, shifting the suffix down by one.
    pub fn remove_at(&mut self, slot: usize) {
        let size = self.size() as usize;
        let start = entry_offset::<K>(slot + 1);
        let end = entry_offset::<K>(size);
        self.data.copy_within(start..end, entry_offset::<K>(slot));
        self.set_size(size as u32 - 1);
    }

    /// Moves the last `count` pairs into the front of an empty `dst`.
    ///
    /// Used by leaf split: the receiving page must be freshly initialized.
    pub fn move_tail_to(&mut self, dst: &mut LeafPageMut<'_, K>, count: usize) {
        let size = self.size() as usize;
        let start = entry_offset::<K>(size - count);
        let end = entry_offset::<K>(size);
        dst.data[LEAF_HEADER_SIZE..LEAF_HEADER_SIZE + (end - start)]
            .copy_from_slice(&self.data[start..end]);
        dst.set_size(count as u32);
        self.set_size((size - count) as u32);
    }

    /// Appends every pair of this page to the end of `dst`.
    ///
    /// Used by leaf merge; the caller fixes the sibling chain.
    pub fn move_all_to(&mut self, dst: &mut LeafPageMut<'_, K>) {
        let size = self.size() as usize;
        let dst_size = dst.size() as usize;
        let start = LEAF_HEADER_SIZE;
        let end = entry_offset::<K>(size);
        dst.data[entry_offset::<K>(dst_size)..entry_offset::<K>(dst_size) + (end - start)]
            .copy_from_slice(&self.data[start..end]);
        dst.set_size((dst_size + size) as u32);
        self.set_size(0);
    }

    /// Moves this page's first pair to the end of the left sibling `dst`.
    pub fn move_first_to_end_of(&mut self, dst: &mut LeafPageMut<'_, K>) {
        let dst_size = dst.size() as usize;
        let key = self.key_at(0);
        let rid = self.record_at(0);
        dst.set_at(dst_size, &key, rid);
        dst.set_size(dst_size as u32 + 1);
        self.remove_at(0);
    }

    /// Moves this page's last pair to the front of the right sibling `dst`.
    pub fn move_last_to_front_of(&mut self, dst: &mut LeafPageMut<'_, K>) {
        let size = self.size() as usize;
        let key = self.key_at(size - 1);
        let rid = self.record_at(size - 1);
        dst.insert_at(0, &key, rid);
        self.set_size(size as u32 - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{GenericKey, OrdComparator};
    use cindra_common::PageId;

    type Key = GenericKey<8>;

    fn rid(n: u64) -> RecordId {
        RecordId::new(PageId::new(0, n as u32), 0)
    }

    fn leaf_with_keys(buf: &mut [u8], max_size: u32, keys: &[u64]) {
        let mut leaf = LeafPageMut::<Key>::new(buf);
        leaf.init(max_size);
        for (i, &k) in keys.iter().enumerate() {
            leaf.set_at(i, &Key::from(k), rid(k));
        }
        leaf.set_size(keys.len() as u32);
    }

    #[test]
    fn test_leaf_init() {
        let mut buf = [0u8; PAGE_SIZE];
        let mut leaf = LeafPageMut::<Key>::new(&mut buf);
        leaf.init(8);

        assert_eq!(leaf.size(), 0);
        assert_eq!(leaf.max_size(), 8);
        assert_eq!(leaf.min_size(), 4);
        assert_eq!(leaf.next_page_num(), INVALID_PAGE_NUM);
        assert_eq!(
            super::super::tree_page_type(&buf).unwrap(),
            TreePageType::Leaf
        );
    }

    #[test]
    fn test_leaf_min_size_odd_max() {
        let mut buf = [0u8; PAGE_SIZE];
        let mut leaf = LeafPageMut::<Key>::new(&mut buf);
        leaf.init(3);
        assert_eq!(leaf.min_size(), 1);
    }

    #[test]
    fn test_leaf_set_and_read_entries() {
        let mut buf = [0u8; PAGE_SIZE];
        leaf_with_keys(&mut buf, 8, &[10, 20, 30]);

        let leaf = LeafPageRef::<Key>::new(&buf);
        assert_eq!(leaf.size(), 3);
        assert_eq!(leaf.key_at(1).as_u64(), 20);
        assert_eq!(leaf.record_at(2), rid(30));
    }

    #[test]
    fn test_leaf_search_contract() {
        let mut buf = [0u8; PAGE_SIZE];
        leaf_with_keys(&mut buf, 8, &[10, 20, 30]);
        let leaf = LeafPageRef::<Key>::new(&buf);
        let cmp = OrdComparator;

        assert_eq!(leaf.search(&cmp, &Key::from(20)), Ok(1));
        assert_eq!(leaf.search(&cmp, &Key::from(5)), Err(0));
        assert_eq!(leaf.search(&cmp, &Key::from(25)), Err(2));
        assert_eq!(leaf.search(&cmp, &Key::from(35)), Err(3));
    }

    #[test]
    fn test_leaf_search_empty() {
        let mut buf = [0u8; PAGE_SIZE];
        leaf_with_keys(&mut buf, 8, &[]);
        let leaf = LeafPageRef::<Key>::new(&buf);
        assert_eq!(leaf.search(&OrdComparator, &Key::from(1)), Err(0));
    }

    #[test]
    fn test_leaf_insert_at_keeps_order() {
        let mut buf = [0u8; PAGE_SIZE];
        leaf_with_keys(&mut buf, 8, &[10, 30]);

        let mut leaf = LeafPageMut::<Key>::new(&mut buf);
        leaf.insert_at(1, &Key::from(20), rid(20));

        assert_eq!(leaf.size(), 3);
        assert_eq!(leaf.key_at(0).as_u64(), 10);
        assert_eq!(leaf.key_at(1).as_u64(), 20);
        assert_eq!(leaf.key_at(2).as_u64(), 30);
        assert_eq!(leaf.record_at(1), rid(20));
    }

    #[test]
    fn test_leaf_remove_at_shifts_down() {
        let mut buf = [0u8; PAGE_SIZE];
        leaf_with_keys(&mut buf, 8, &[10, 20, 30]);

        let mut leaf = LeafPageMut::<Key>::new(&mut buf);
        leaf.remove_at(1);

        assert_eq!(leaf.size(), 2);
        assert_eq!(leaf.key_at(0).as_u64(), 10);
        assert_eq!(leaf.key_at(1).as_u64(), 30);
    }

    #[test]
    fn test_leaf_move_tail_to() {
        let mut left_buf = [0u8; PAGE_SIZE];
        let mut right_buf = [0u8; PAGE_SIZE];
        leaf_with_keys(&mut left_buf, 4, &[10, 20, 30, 40]);

        let mut left = LeafPageMut::<Key>::new(&mut left_buf);
        let mut right = LeafPageMut::<Key>::new(&mut right_buf);
        right.init(4);
        left.move_tail_to(&mut right, 2);

        assert_eq!(left.size(), 2);
        assert_eq!(right.size(), 2);
        assert_eq!(left.key_at(1).as_u64(), 20);
        assert_eq!(right.key_at(0).as_u64(), 30);
        assert_eq!(right.record_at(1), rid(40));
    }

    #[test]
    fn test_leaf_move_all_to() {
        let mut left_buf = [0u8; PAGE_SIZE];
        let mut right_buf = [0u8; PAGE_SIZE];
        leaf_with_keys(&mut left_buf, 8, &[10, 20]);
        leaf_with_keys(&mut right_buf, 8, &[30, 40]);

        let mut left = LeafPageMut::<Key>::new(&mut left_buf);
        let mut right = LeafPageMut::<Key>::new(&mut right_buf);
        right.move_all_to(&mut left);

        assert_eq!(left.size(), 4);
        assert_eq!(right.size(), 0);
        let keys: Vec<u64> = (0..4).map(|i| left.key_at(i).as_u64()).collect();
        assert_eq!(keys, vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_leaf_borrow_moves() {
        let mut left_buf = [0u8; PAGE_SIZE];
        let mut right_buf = [0u8; PAGE_SIZE];
        leaf_with_keys(&mut left_buf, 8, &[10, 20, 30]);
        leaf_with_keys(&mut right_buf, 8, &[40, 50]);

        let mut left = LeafPageMut::<Key>::new(&mut left_buf);
        let mut right = LeafPageMut::<Key>::new(&mut right_buf);

        // Borrow from left: left's last moves to right's front
        left.move_last_to_front_of(&mut right);
        assert_eq!(left.size(), 2);
        assert_eq!(right.size(), 3);
        assert_eq!(right.key_at(0).as_u64(), 30);

        // Borrow from right: right's first moves back to left's end
        right.move_first_to_end_of(&mut left);
        assert_eq!(left.size(), 3);
        assert_eq!(right.size(), 2);
        assert_eq!(left.key_at(2).as_u64(), 30);
        assert_eq!(right.key_at(0).as_u64(), 40);
    }

    #[test]
    fn test_leaf_capacity_scales_with_key_width() {
        assert!(leaf_capacity::<GenericKey<4>>() > leaf_capacity::<GenericKey<64>>());
        // 16 KB page, 8-byte keys, 10-byte record ids
        assert_eq!(
            leaf_capacity::<GenericKey<8>>(),
            (PAGE_SIZE - LEAF_HEADER_SIZE) / 18
        );
    }
}
