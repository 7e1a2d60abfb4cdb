//! Concurrent B+ tree index over buffer-pool pages.
//!
//! The tree maps unique ordered keys to record ids. All state lives on
//! fixed-size pages borrowed from the buffer pool through scoped guards;
//! a header page anchors the current root. Mutations descend root-to-leaf
//! under the latch-crabbing protocol: write latches couple top-down and
//! ancestors are released as soon as a child is proven safe (it cannot
//! split on insert, nor underflow on remove). Structural changes then
//! propagate back up through the retained, still-latched path.

use crate::context::Context;
use crate::iterator::TreeIterator;
use crate::key::{IndexKey, KeyComparator};
use crate::page::{
    internal_capacity, leaf_capacity, tree_page_type, HeaderPageMut, HeaderPageRef,
    InternalPageMut, InternalPageRef, LeafPageMut, LeafPageRef, TreePageType,
    INTERNAL_HEADER_SIZE, LEAF_HEADER_SIZE,
};
use cindra_buffer::{BufferPool, WritePageGuard};
use cindra_common::page::{INVALID_PAGE_NUM, PAGE_SIZE};
use cindra_common::{CindraError, PageId, RecordId, Result};
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, trace};

/// A templated B+ tree index.
///
/// Generic over the key type and its comparator; record ids are the fixed
/// value type. One instance owns all pages of one file, with the header
/// page id supplied (pre-allocated) by the caller.
pub struct BPlusTree<K, C>
where
    K: IndexKey,
    C: KeyComparator<K>,
{
    name: String,
    header_page_id: PageId,
    pool: Arc<BufferPool>,
    comparator: C,
    leaf_max_size: u32,
    internal_max_size: u32,
    _marker: PhantomData<K>,
}

impl<K, C> BPlusTree<K, C>
where
    K: IndexKey,
    C: KeyComparator<K>,
{
    /// Opens a tree over an existing header page.
    pub fn open(
        name: impl Into<String>,
        header_page_id: PageId,
        pool: Arc<BufferPool>,
        comparator: C,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Result<Self> {
        if leaf_max_size < 2 {
            return Err(CindraError::Internal(format!(
                "leaf_max_size must be at least 2, got {leaf_max_size}"
            )));
        }
        if internal_max_size < 3 {
            return Err(CindraError::Internal(format!(
                "internal_max_size must be at least 3, got {internal_max_size}"
            )));
        }
        // The requested fanout bounds how wide a key can be: every page
        // must hold max_size dense entries.
        if leaf_max_size as usize > leaf_capacity::<K>() {
            let widest = ((PAGE_SIZE - LEAF_HEADER_SIZE) / leaf_max_size as usize)
                .saturating_sub(RecordId::ENCODED_SIZE);
            return Err(CindraError::KeyTooLarge {
                size: K::ENCODED_SIZE,
                max: widest,
            });
        }
        if internal_max_size as usize > internal_capacity::<K>() {
            let widest =
                ((PAGE_SIZE - INTERNAL_HEADER_SIZE) / internal_max_size as usize).saturating_sub(4);
            return Err(CindraError::KeyTooLarge {
                size: K::ENCODED_SIZE,
                max: widest,
            });
        }

        Ok(Self {
            name: name.into(),
            header_page_id,
            pool,
            comparator,
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        })
    }

    /// Creates a fresh tree, resetting the header page to the empty state.
    pub fn create(
        name: impl Into<String>,
        header_page_id: PageId,
        pool: Arc<BufferPool>,
        comparator: C,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Result<Self> {
        let tree = Self::open(
            name,
            header_page_id,
            pool,
            comparator,
            leaf_max_size,
            internal_max_size,
        )?;
        let mut header = tree.pool.fetch_write(tree.header_page_id)?;
        HeaderPageMut::new(header.data_mut()).set_root_page_num(INVALID_PAGE_NUM);
        Ok(tree)
    }

    /// Returns the tree name.
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn file_id(&self) -> u32 {
        self.header_page_id.file_id
    }

    #[inline]
    fn page(&self, page_num: u32) -> PageId {
        PageId::new(self.file_id(), page_num)
    }

    /// Returns the current root page number (sentinel if empty).
    pub fn root_page_num(&self) -> Result<u32> {
        let header = self.pool.fetch_read(self.header_page_id)?;
        Ok(HeaderPageRef::new(header.data()).root_page_num())
    }

    /// Returns true if the tree holds no keys.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.root_page_num()? == INVALID_PAGE_NUM)
    }

    /// Point lookup: returns the record id stored under `key`.
    ///
    /// The read path couples latches downward, holding exactly one read
    /// latch after the first release.
    pub fn get(&self, key: &K) -> Result<Option<RecordId>> {
        let header = self.pool.fetch_read(self.header_page_id)?;
        let root_num = HeaderPageRef::new(header.data()).root_page_num();
        if root_num == INVALID_PAGE_NUM {
            return Ok(None);
        }

        let mut guard = self.pool.fetch_read(self.page(root_num))?;
        drop(header);

        loop {
            if matches!(tree_page_type(guard.data())?, TreePageType::Leaf) {
                let view = LeafPageRef::<K>::new(guard.data());
                return Ok(view
                    .search(&self.comparator, key)
                    .ok()
                    .map(|slot| view.record_at(slot)));
            }
            let child = {
                let view = InternalPageRef::<K>::new(guard.data());
                view.child_at(view.child_index_for(&self.comparator, key))
            };
            let next = self.pool.fetch_read(self.page(child))?;
            guard = next;
        }
    }

    /// Inserts a (key, record id) pair.
    ///
    /// Returns false (and changes nothing) if the key already exists.
    pub fn insert(&self, key: &K, rid: RecordId) -> Result<bool> {
        let mut ctx = Context::new();
        let inserted = self.insert_inner(&mut ctx, key, rid)?;
        self.reclaim(ctx);
        Ok(inserted)
    }

    /// Removes `key` if present; absent keys are a silent no-op.
    pub fn remove(&self, key: &K) -> Result<()> {
        let mut ctx = Context::new();
        self.remove_inner(&mut ctx, key)?;
        self.reclaim(ctx);
        Ok(())
    }

    /// Drops every guard the operation still holds, then hands the pages
    /// it logically freed back to the buffer pool.
    fn reclaim(&self, mut ctx: Context) {
        let freed = std::mem::take(&mut ctx.freed);
        drop(ctx);
        for page_num in freed {
            self.pool.delete_page(self.page(page_num));
        }
    }

    fn insert_inner(&self, ctx: &mut Context, key: &K, rid: RecordId) -> Result<bool> {
        let mut header = self.pool.fetch_write(self.header_page_id)?;
        let root_num = HeaderPageRef::new(header.data()).root_page_num();

        if root_num == INVALID_PAGE_NUM {
            // Empty tree: the first leaf becomes the root.
            let new_page = self.pool.allocate_page(self.file_id())?;
            let new_num = new_page.page_id().page_num;
            let mut leaf_guard = new_page.upgrade_write();
            let mut leaf = LeafPageMut::<K>::new(leaf_guard.data_mut());
            leaf.init(self.leaf_max_size);
            leaf.set_at(0, key, rid);
            leaf.set_size(1);
            HeaderPageMut::new(header.data_mut()).set_root_page_num(new_num);
            debug!(tree = %self.name, root = new_num, "started new tree");
            return Ok(true);
        }

        ctx.root_page_num = root_num;
        ctx.header = Some(header);

        // Descend, crabbing on the insert-safe predicate.
        let mut guard = self.pool.fetch_write(self.page(root_num))?;
        loop {
            let is_leaf = matches!(tree_page_type(guard.data())?, TreePageType::Leaf);
            let safe = if is_leaf {
                let view = LeafPageRef::<K>::new(guard.data());
                view.size() + 1 < view.max_size()
            } else {
                let view = InternalPageRef::<K>::new(guard.data());
                view.size() < view.max_size()
            };
            if safe {
                ctx.release_ancestors();
            }
            if is_leaf {
                ctx.write_set.push_back(guard);
                break;
            }
            let child = {
                let view = InternalPageRef::<K>::new(guard.data());
                view.child_at(view.child_index_for(&self.comparator, key))
            };
            trace!(tree = %self.name, child, "descending for insert");
            ctx.write_set.push_back(guard);
            guard = self.pool.fetch_write(self.page(child))?;
        }

        // Reject duplicates and decide whether the leaf will overflow,
        // before any mutation.
        let will_split = {
            let leaf_guard = ctx
                .write_set
                .back()
                .ok_or_else(|| CindraError::Internal("insert path lost its leaf".to_string()))?;
            let view = LeafPageRef::<K>::new(leaf_guard.data());
            if view.search(&self.comparator, key).is_ok() {
                return Ok(false);
            }
            view.size() + 1 == view.max_size()
        };

        // Every page the split chain will need is allocated up-front, so
        // an allocation failure leaves the tree untouched.
        let mut fresh_pages = Vec::new();
        if will_split {
            let mut needed = 1usize;
            let mut chain_all_full = true;
            for idx in (0..ctx.write_set.len().saturating_sub(1)).rev() {
                let view = InternalPageRef::<K>::new(ctx.write_set[idx].data());
                if view.size() == view.max_size() {
                    needed += 1;
                } else {
                    chain_all_full = false;
                    break;
                }
            }
            if chain_all_full {
                // The chain reaches a full root: one more page for the new root.
                needed += 1;
            }
            for _ in 0..needed {
                fresh_pages.push(self.pool.allocate_page(self.file_id())?);
            }
        }
        let mut fresh = fresh_pages.into_iter();

        let mut leaf_guard = ctx
            .write_set
            .pop_back()
            .ok_or_else(|| CindraError::Internal("insert path lost its leaf".to_string()))?;
        let leaf_num = leaf_guard.page_id().page_num;

        {
            let mut leaf = LeafPageMut::<K>::new(leaf_guard.data_mut());
            let slot = match leaf.search(&self.comparator, key) {
                Ok(_) => return Ok(false),
                Err(slot) => slot,
            };
            leaf.insert_at(slot, key, rid);
        }

        if !will_split {
            return Ok(true);
        }

        // Overflow: split the leaf and hand the separator upward.
        let new_guard = fresh
            .next()
            .ok_or_else(|| CindraError::Internal("split page budget exhausted".to_string()))?;
        let new_num = new_guard.page_id().page_num;
        let mut new_write = new_guard.upgrade_write();
        let sep0 = {
            let mut leaf = LeafPageMut::<K>::new(leaf_guard.data_mut());
            let mut new_leaf = LeafPageMut::<K>::new(new_write.data_mut());
            new_leaf.init(self.leaf_max_size);
            let total = leaf.size();
            let keep = (total + 1) / 2;
            leaf.move_tail_to(&mut new_leaf, (total - keep) as usize);
            new_leaf.set_next_page_num(leaf.next_page_num());
            leaf.set_next_page_num(new_num);
            new_leaf.key_at(0)
        };
        debug!(tree = %self.name, page = leaf_num, new_page = new_num, "leaf split");
        drop(new_write);
        drop(leaf_guard);

        let mut sep = sep0;
        let mut right_num = new_num;
        let mut cur_num = leaf_num;

        loop {
            let Some(mut parent_guard) = ctx.write_set.pop_back() else {
                // The split node was the root: grow a new root above it.
                let root_guard = fresh.next().ok_or_else(|| {
                    CindraError::Internal("split page budget exhausted".to_string())
                })?;
                let new_root_num = root_guard.page_id().page_num;
                let mut root_write = root_guard.upgrade_write();
                {
                    let mut root = InternalPageMut::<K>::new(root_write.data_mut());
                    root.init(self.internal_max_size);
                    root.set_entries(cur_num, &[(sep, right_num)]);
                }
                let header = ctx.header.as_mut().ok_or_else(|| {
                    CindraError::Internal("root split without header latch".to_string())
                })?;
                HeaderPageMut::new(header.data_mut()).set_root_page_num(new_root_num);
                debug!(tree = %self.name, root = new_root_num, "root grew");
                return Ok(true);
            };

            let parent_num = parent_guard.page_id().page_num;

            {
                let mut parent = InternalPageMut::<K>::new(parent_guard.data_mut());
                let slot = parent.value_index(cur_num).ok_or_else(|| {
                    CindraError::IndexCorrupted("split child missing from its parent".to_string())
                })?;
                if parent.size() < parent.max_size() {
                    parent.insert_entry_at(slot + 1, &sep, right_num);
                    return Ok(true);
                }
            }

            // The parent is full too: split it around the pending separator.
            let new_guard = fresh
                .next()
                .ok_or_else(|| CindraError::Internal("split page budget exhausted".to_string()))?;
            let new_internal_num = new_guard.page_id().page_num;
            let mut new_write = new_guard.upgrade_write();
            let promoted = {
                let mut parent = InternalPageMut::<K>::new(parent_guard.data_mut());
                let slot = parent.value_index(cur_num).ok_or_else(|| {
                    CindraError::IndexCorrupted("split child missing from its parent".to_string())
                })?;
                let first_child = parent.child_at(0);
                let size = parent.size() as usize;
                let mut pairs: Vec<(K, u32)> = (1..size)
                    .map(|i| (parent.key_at(i), parent.child_at(i)))
                    .collect();
                pairs.insert(slot, (sep, right_num));

                // max + 1 children total; the left page keeps the ceiling half.
                let left_children = (self.internal_max_size as usize + 2) / 2;
                let (promoted_key, right_first_child) = pairs[left_children - 1];
                let mut new_page = InternalPageMut::<K>::new(new_write.data_mut());
                new_page.init(self.internal_max_size);
                new_page.set_entries(right_first_child, &pairs[left_children..]);
                parent.set_entries(first_child, &pairs[..left_children - 1]);
                promoted_key
            };
            debug!(
                tree = %self.name,
                page = parent_num,
                new_page = new_internal_num,
                "internal split"
            );

            sep = promoted;
            right_num = new_internal_num;
            cur_num = parent_num;
        }
    }

    fn remove_inner(&self, ctx: &mut Context, key: &K) -> Result<()> {
        let header = self.pool.fetch_write(self.header_page_id)?;
        let root_num = HeaderPageRef::new(header.data()).root_page_num();
        if root_num == INVALID_PAGE_NUM {
            return Ok(());
        }

        ctx.root_page_num = root_num;
        ctx.header = Some(header);

        // Descend, crabbing on the remove-safe predicate. The root obeys
        // the weaker rule: it shrinks rather than underflows.
        let mut guard = self.pool.fetch_write(self.page(root_num))?;
        loop {
            let is_root = guard.page_id().page_num == ctx.root_page_num;
            let is_leaf = matches!(tree_page_type(guard.data())?, TreePageType::Leaf);
            let safe = if is_leaf {
                let view = LeafPageRef::<K>::new(guard.data());
                if is_root {
                    view.size() > 1
                } else {
                    view.size() > view.min_size()
                }
            } else {
                let view = InternalPageRef::<K>::new(guard.data());
                if is_root {
                    view.size() > 2
                } else {
                    view.size() > view.min_size()
                }
            };
            if safe {
                ctx.release_ancestors();
            }
            if is_leaf {
                ctx.write_set.push_back(guard);
                break;
            }
            let child = {
                let view = InternalPageRef::<K>::new(guard.data());
                view.child_at(view.child_index_for(&self.comparator, key))
            };
            trace!(tree = %self.name, child, "descending for remove");
            ctx.write_set.push_back(guard);
            guard = self.pool.fetch_write(self.page(child))?;
        }

        let mut leaf_guard = ctx
            .write_set
            .pop_back()
            .ok_or_else(|| CindraError::Internal("remove path lost its leaf".to_string()))?;
        let leaf_num = leaf_guard.page_id().page_num;

        let slot = {
            let view = LeafPageRef::<K>::new(leaf_guard.data());
            match view.search(&self.comparator, key) {
                Ok(slot) => slot,
                Err(_) => return Ok(()),
            }
        };

        let (size, min_size) = {
            let mut leaf = LeafPageMut::<K>::new(leaf_guard.data_mut());
            leaf.remove_at(slot);
            (leaf.size(), leaf.min_size())
        };

        if leaf_num == ctx.root_page_num {
            if size == 0 {
                // The last key is gone: free the root leaf and empty the tree.
                let header = ctx.header.as_mut().ok_or_else(|| {
                    CindraError::Internal("root removal without header latch".to_string())
                })?;
                HeaderPageMut::new(header.data_mut()).set_root_page_num(INVALID_PAGE_NUM);
                ctx.freed.push(leaf_num);
                debug!(tree = %self.name, root = leaf_num, "tree emptied");
            }
            return Ok(());
        }
        if size >= min_size {
            return Ok(());
        }

        self.fix_leaf_underflow(ctx, &mut leaf_guard)
    }

    /// Repairs an underfull non-root leaf: borrow from a sibling if one
    /// can spare an entry, else merge. The left sibling is preferred in
    /// both cases; sibling latches are taken while the parent is held.
    fn fix_leaf_underflow(&self, ctx: &mut Context, leaf_guard: &mut WritePageGuard) -> Result<()> {
        let leaf_num = leaf_guard.page_id().page_num;

        let (slot, left_num, right_num) = {
            let parent_guard = ctx.write_set.back().ok_or_else(|| {
                CindraError::IndexCorrupted("underfull leaf with no parent on the path".to_string())
            })?;
            let parent = InternalPageRef::<K>::new(parent_guard.data());
            let slot = parent.value_index(leaf_num).ok_or_else(|| {
                CindraError::IndexCorrupted("leaf missing from its parent".to_string())
            })?;
            let left = (slot > 0).then(|| parent.child_at(slot - 1));
            let right = (slot + 1 < parent.size() as usize).then(|| parent.child_at(slot + 1));
            (slot, left, right)
        };

        let mut left_guard = match left_num {
            Some(num) => Some(self.pool.fetch_write(self.page(num))?),
            None => None,
        };

        if let Some(lg) = left_guard.as_mut() {
            let can_spare = {
                let view = LeafPageRef::<K>::new(lg.data());
                view.size() > view.min_size()
            };
            if can_spare {
                let new_first = {
                    let mut left = LeafPageMut::<K>::new(lg.data_mut());
                    let mut leaf = LeafPageMut::<K>::new(leaf_guard.data_mut());
                    left.move_last_to_front_of(&mut leaf);
                    leaf.key_at(0)
                };
                let parent_guard = ctx.write_set.back_mut().ok_or_else(|| {
                    CindraError::IndexCorrupted("parent latch lost during borrow".to_string())
                })?;
                InternalPageMut::<K>::new(parent_guard.data_mut()).set_key_at(slot, &new_first);
                debug!(tree = %self.name, page = leaf_num, "leaf borrowed from left sibling");
                return Ok(());
            }
        }

        let mut right_guard = match right_num {
            Some(num) => Some(self.pool.fetch_write(self.page(num))?),
            None => None,
        };

        if let Some(rg) = right_guard.as_mut() {
            let can_spare = {
                let view = LeafPageRef::<K>::new(rg.data());
                view.size() > view.min_size()
            };
            if can_spare {
                let new_first = {
                    let mut right = LeafPageMut::<K>::new(rg.data_mut());
                    let mut leaf = LeafPageMut::<K>::new(leaf_guard.data_mut());
                    right.move_first_to_end_of(&mut leaf);
                    right.key_at(0)
                };
                let parent_guard = ctx.write_set.back_mut().ok_or_else(|| {
                    CindraError::IndexCorrupted("parent latch lost during borrow".to_string())
                })?;
                InternalPageMut::<K>::new(parent_guard.data_mut()).set_key_at(slot + 1, &new_first);
                debug!(tree = %self.name, page = leaf_num, "leaf borrowed from right sibling");
                return Ok(());
            }
        }

        // Neither sibling can spare an entry: merge across the nearest
        // boundary and remove the separator one level up.
        if let Some(mut lg) = left_guard {
            {
                let mut left = LeafPageMut::<K>::new(lg.data_mut());
                let mut leaf = LeafPageMut::<K>::new(leaf_guard.data_mut());
                let next = leaf.next_page_num();
                leaf.move_all_to(&mut left);
                left.set_next_page_num(next);
            }
            ctx.freed.push(leaf_num);
            debug!(tree = %self.name, page = leaf_num, "leaf merged into left sibling");
            return self.remove_entry_up(ctx, slot);
        }

        if let Some(mut rg) = right_guard {
            let right_page_num = rg.page_id().page_num;
            {
                let mut right = LeafPageMut::<K>::new(rg.data_mut());
                let mut leaf = LeafPageMut::<K>::new(leaf_guard.data_mut());
                let next = right.next_page_num();
                right.move_all_to(&mut leaf);
                leaf.set_next_page_num(next);
            }
            ctx.freed.push(right_page_num);
            debug!(tree = %self.name, page = right_page_num, "right sibling merged into leaf");
            return self.remove_entry_up(ctx, slot + 1);
        }

        Err(CindraError::IndexCorrupted(
            "leaf with no siblings under a non-root parent".to_string(),
        ))
    }

    /// Removes the separator at `slot` (and its right-child pointer) from
    /// the node at the back of the path, then repairs that node in turn:
    /// shrink the root, or borrow/merge a non-root page that underflowed.
    fn remove_entry_up(&self, ctx: &mut Context, slot: usize) -> Result<()> {
        let mut cur_guard = ctx.write_set.pop_back().ok_or_else(|| {
            CindraError::IndexCorrupted("separator removal with no page on the path".to_string())
        })?;
        let cur_num = cur_guard.page_id().page_num;

        let (size, min_size) = {
            let mut cur = InternalPageMut::<K>::new(cur_guard.data_mut());
            cur.remove_entry_at(slot);
            (cur.size(), cur.min_size())
        };

        if cur_num == ctx.root_page_num {
            if size == 1 {
                // Root shrink: the single surviving child becomes the root.
                let only_child = InternalPageRef::<K>::new(cur_guard.data()).child_at(0);
                let header = ctx.header.as_mut().ok_or_else(|| {
                    CindraError::Internal("root shrink without header latch".to_string())
                })?;
                HeaderPageMut::new(header.data_mut()).set_root_page_num(only_child);
                ctx.freed.push(cur_num);
                debug!(tree = %self.name, root = only_child, "root shrank");
            }
            return Ok(());
        }
        if size >= min_size {
            return Ok(());
        }

        self.fix_internal_underflow(ctx, &mut cur_guard)
    }

    /// Repairs an underfull non-root internal page with the same
    /// borrow-then-merge policy as leaves, using internal move semantics:
    /// separators rotate through (or are pulled down from) the parent.
    fn fix_internal_underflow(
        &self,
        ctx: &mut Context,
        cur_guard: &mut WritePageGuard,
    ) -> Result<()> {
        let cur_num = cur_guard.page_id().page_num;

        let (slot, left_num, right_num) = {
            let parent_guard = ctx.write_set.back().ok_or_else(|| {
                CindraError::IndexCorrupted("underfull page with no parent on the path".to_string())
            })?;
            let parent = InternalPageRef::<K>::new(parent_guard.data());
            let slot = parent.value_index(cur_num).ok_or_else(|| {
                CindraError::IndexCorrupted("page missing from its parent".to_string())
            })?;
            let left = (slot > 0).then(|| parent.child_at(slot - 1));
            let right = (slot + 1 < parent.size() as usize).then(|| parent.child_at(slot + 1));
            (slot, left, right)
        };

        let mut left_guard = match left_num {
            Some(num) => Some(self.pool.fetch_write(self.page(num))?),
            None => None,
        };

        if let Some(lg) = left_guard.as_mut() {
            let can_spare = {
                let view = InternalPageRef::<K>::new(lg.data());
                view.size() > view.min_size()
            };
            if can_spare {
                let sep = {
                    let parent_guard = ctx.write_set.back().ok_or_else(|| {
                        CindraError::IndexCorrupted("parent latch lost during borrow".to_string())
                    })?;
                    InternalPageRef::<K>::new(parent_guard.data()).key_at(slot)
                };
                // The parent separator comes down in front of our first
                // child; the left sibling's last child takes its place.
                let moved_key = {
                    let mut left = InternalPageMut::<K>::new(lg.data_mut());
                    let mut cur = InternalPageMut::<K>::new(cur_guard.data_mut());
                    let left_size = left.size() as usize;
                    let last_key = left.key_at(left_size - 1);
                    let last_child = left.child_at(left_size - 1);
                    let old_first = cur.child_at(0);
                    cur.insert_entry_at(1, &sep, old_first);
                    cur.set_child_at(0, last_child);
                    left.set_size(left_size as u32 - 1);
                    last_key
                };
                let parent_guard = ctx.write_set.back_mut().ok_or_else(|| {
                    CindraError::IndexCorrupted("parent latch lost during borrow".to_string())
                })?;
                InternalPageMut::<K>::new(parent_guard.data_mut()).set_key_at(slot, &moved_key);
                debug!(tree = %self.name, page = cur_num, "internal borrowed from left sibling");
                return Ok(());
            }
        }

        let mut right_guard = match right_num {
            Some(num) => Some(self.pool.fetch_write(self.page(num))?),
            None => None,
        };

        if let Some(rg) = right_guard.as_mut() {
            let can_spare = {
                let view = InternalPageRef::<K>::new(rg.data());
                view.size() > view.min_size()
            };
            if can_spare {
                let sep = {
                    let parent_guard = ctx.write_set.back().ok_or_else(|| {
                        CindraError::IndexCorrupted("parent latch lost during borrow".to_string())
                    })?;
                    InternalPageRef::<K>::new(parent_guard.data()).key_at(slot + 1)
                };
                let new_sep = {
                    let mut right = InternalPageMut::<K>::new(rg.data_mut());
                    let mut cur = InternalPageMut::<K>::new(cur_guard.data_mut());
                    let cur_size = cur.size() as usize;
                    cur.set_key_at(cur_size, &sep);
                    cur.set_child_at(cur_size, right.child_at(0));
                    cur.set_size(cur_size as u32 + 1);
                    let new_sep = right.key_at(1);
                    right.remove_entry_at(0);
                    new_sep
                };
                let parent_guard = ctx.write_set.back_mut().ok_or_else(|| {
                    CindraError::IndexCorrupted("parent latch lost during borrow".to_string())
                })?;
                InternalPageMut::<K>::new(parent_guard.data_mut()).set_key_at(slot + 1, &new_sep);
                debug!(tree = %self.name, page = cur_num, "internal borrowed from right sibling");
                return Ok(());
            }
        }

        if let Some(mut lg) = left_guard {
            // Merge into the left sibling; the parent separator is pulled
            // down as the key over our first child.
            let sep = {
                let parent_guard = ctx.write_set.back().ok_or_else(|| {
                    CindraError::IndexCorrupted("parent latch lost during merge".to_string())
                })?;
                InternalPageRef::<K>::new(parent_guard.data()).key_at(slot)
            };
            {
                let mut left = InternalPageMut::<K>::new(lg.data_mut());
                let cur = InternalPageRef::<K>::new(cur_guard.data());
                let left_size = left.size() as usize;
                let cur_size = cur.size() as usize;
                left.set_key_at(left_size, &sep);
                left.set_child_at(left_size, cur.child_at(0));
                for i in 1..cur_size {
                    left.set_key_at(left_size + i, &cur.key_at(i));
                    left.set_child_at(left_size + i, cur.child_at(i));
                }
                left.set_size((left_size + cur_size) as u32);
            }
            ctx.freed.push(cur_num);
            debug!(tree = %self.name, page = cur_num, "internal merged into left sibling");
            return self.remove_entry_up(ctx, slot);
        }

        if let Some(mut rg) = right_guard {
            let right_page_num = rg.page_id().page_num;
            let sep = {
                let parent_guard = ctx.write_set.back().ok_or_else(|| {
                    CindraError::IndexCorrupted("parent latch lost during merge".to_string())
                })?;
                InternalPageRef::<K>::new(parent_guard.data()).key_at(slot + 1)
            };
            {
                let mut cur = InternalPageMut::<K>::new(cur_guard.data_mut());
                let right = InternalPageRef::<K>::new(rg.data());
                let cur_size = cur.size() as usize;
                let right_size = right.size() as usize;
                cur.set_key_at(cur_size, &sep);
                cur.set_child_at(cur_size, right.child_at(0));
                for i in 1..right_size {
                    cur.set_key_at(cur_size + i, &right.key_at(i));
                    cur.set_child_at(cur_size + i, right.child_at(i));
                }
                cur.set_size((cur_size + right_size) as u32);
            }
            ctx.freed.push(right_page_num);
            debug!(tree = %self.name, page = right_page_num, "right sibling merged into internal");
            return self.remove_entry_up(ctx, slot + 1);
        }

        Err(CindraError::IndexCorrupted(
            "internal page with no siblings under a non-root parent".to_string(),
        ))
    }

    /// Returns an iterator positioned at the leftmost key.
    pub fn iter(&self) -> Result<TreeIterator<K>> {
        let header = self.pool.fetch_read(self.header_page_id)?;
        let root_num = HeaderPageRef::new(header.data()).root_page_num();
        if root_num == INVALID_PAGE_NUM {
            return Ok(TreeIterator::end(Arc::clone(&self.pool), self.file_id()));
        }

        let mut guard = self.pool.fetch_read(self.page(root_num))?;
        drop(header);

        loop {
            if matches!(tree_page_type(guard.data())?, TreePageType::Leaf) {
                return Ok(TreeIterator::new(
                    Arc::clone(&self.pool),
                    self.file_id(),
                    guard,
                    0,
                ));
            }
            let child = InternalPageRef::<K>::new(guard.data()).child_at(0);
            let next = self.pool.fetch_read(self.page(child))?;
            guard = next;
        }
    }

    /// Returns the past-the-end iterator.
    pub fn iter_end(&self) -> TreeIterator<K> {
        TreeIterator::end(Arc::clone(&self.pool), self.file_id())
    }

    /// Returns an iterator positioned at the smallest key `>=` the target
    /// (the end iterator if every key is smaller).
    pub fn iter_from(&self, key: &K) -> Result<TreeIterator<K>> {
        let header = self.pool.fetch_read(self.header_page_id)?;
        let root_num = HeaderPageRef::new(header.data()).root_page_num();
        if root_num == INVALID_PAGE_NUM {
            return Ok(TreeIterator::end(Arc::clone(&self.pool), self.file_id()));
        }

        let mut guard = self.pool.fetch_read(self.page(root_num))?;
        drop(header);

        loop {
            if matches!(tree_page_type(guard.data())?, TreePageType::Leaf) {
                let (slot, next_num) = {
                    let view = LeafPageRef::<K>::new(guard.data());
                    match view.search(&self.comparator, key) {
                        Ok(slot) => (Some(slot), 0),
                        Err(slot) if slot < view.size() as usize => (Some(slot), 0),
                        Err(_) => (None, view.next_page_num()),
                    }
                };
                if let Some(slot) = slot {
                    return Ok(TreeIterator::new(
                        Arc::clone(&self.pool),
                        self.file_id(),
                        guard,
                        slot,
                    ));
                }
                // Every key here is smaller: the answer starts at the next leaf.
                drop(guard);
                if next_num == INVALID_PAGE_NUM {
                    return Ok(TreeIterator::end(Arc::clone(&self.pool), self.file_id()));
                }
                let next = self.pool.fetch_read(self.page(next_num))?;
                return Ok(TreeIterator::new(
                    Arc::clone(&self.pool),
                    self.file_id(),
                    next,
                    0,
                ));
            }
            let child = {
                let view = InternalPageRef::<K>::new(guard.data());
                view.child_at(view.child_index_for(&self.comparator, key))
            };
            let next = self.pool.fetch_read(self.page(child))?;
            guard = next;
        }
    }

    /// Walks the whole tree under read latches and verifies its
    /// structural invariants: in-page key order, size bounds, separator
    /// ranges, uniform leaf depth, and agreement between the leaf sibling
    /// chain and the in-order traversal.
    pub fn check_integrity(&self) -> Result<()> {
        let header = self.pool.fetch_read(self.header_page_id)?;
        let root_num = HeaderPageRef::new(header.data()).root_page_num();
        drop(header);
        if root_num == INVALID_PAGE_NUM {
            return Ok(());
        }

        let mut walk = IntegrityWalk {
            leaves: Vec::new(),
            keys: Vec::new(),
            leaf_depth: None,
        };
        self.verify_node(root_num, None, None, true, 0, &mut walk)?;

        for pair in walk.keys.windows(2) {
            if self.comparator.compare(&pair[0], &pair[1]) != Ordering::Less {
                return Err(CindraError::IndexCorrupted(
                    "keys are not strictly ascending across leaves".to_string(),
                ));
            }
        }

        // The sibling chain from the leftmost leaf must visit exactly the
        // leaves the in-order traversal saw.
        let mut chain = Vec::new();
        let mut cursor = walk.leaves.first().copied();
        while let Some(page_num) = cursor {
            chain.push(page_num);
            if chain.len() > walk.leaves.len() {
                return Err(CindraError::IndexCorrupted(
                    "leaf chain is longer than the tree's leaf set".to_string(),
                ));
            }
            let guard = self.pool.fetch_read(self.page(page_num))?;
            let next = LeafPageRef::<K>::new(guard.data()).next_page_num();
            cursor = (next != INVALID_PAGE_NUM).then_some(next);
        }
        if chain != walk.leaves {
            return Err(CindraError::IndexCorrupted(
                "leaf chain disagrees with in-order traversal".to_string(),
            ));
        }

        Ok(())
    }

    fn verify_node(
        &self,
        page_num: u32,
        lower: Option<K>,
        upper: Option<K>,
        is_root: bool,
        depth: u32,
        walk: &mut IntegrityWalk<K>,
    ) -> Result<()> {
        let corrupt = |reason: String| CindraError::IndexCorrupted(reason);
        let guard = self.pool.fetch_read(self.page(page_num))?;

        match tree_page_type(guard.data())? {
            TreePageType::Leaf => {
                let view = LeafPageRef::<K>::new(guard.data());
                let size = view.size();
                if is_root {
                    if size == 0 {
                        return Err(corrupt(format!("empty root leaf {page_num}")));
                    }
                } else if size < view.min_size() || size > view.max_size() - 1 {
                    return Err(corrupt(format!(
                        "leaf {page_num} size {size} out of bounds"
                    )));
                }
                for i in 0..size as usize {
                    let key = view.key_at(i);
                    if let Some(lo) = lower.as_ref() {
                        if self.comparator.compare(lo, &key) == Ordering::Greater {
                            return Err(corrupt(format!(
                                "leaf {page_num} key below its separator range"
                            )));
                        }
                    }
                    if let Some(hi) = upper.as_ref() {
                        if self.comparator.compare(&key, hi) != Ordering::Less {
                            return Err(corrupt(format!(
                                "leaf {page_num} key above its separator range"
                            )));
                        }
                    }
                    walk.keys.push(key);
                }
                match walk.leaf_depth {
                    None => walk.leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return Err(corrupt(format!("leaf {page_num} at uneven depth")));
                    }
                    _ => {}
                }
                walk.leaves.push(page_num);
            }
            TreePageType::Internal => {
                let view = InternalPageRef::<K>::new(guard.data());
                let size = view.size();
                if is_root {
                    if size < 2 {
                        return Err(corrupt(format!("internal root {page_num} size {size}")));
                    }
                } else if size < view.min_size() || size > view.max_size() {
                    return Err(corrupt(format!(
                        "internal {page_num} size {size} out of bounds"
                    )));
                }
                for i in 1..size as usize {
                    let key = view.key_at(i);
                    if i > 1
                        && self.comparator.compare(&view.key_at(i - 1), &key) != Ordering::Less
                    {
                        return Err(corrupt(format!(
                            "internal {page_num} separators out of order"
                        )));
                    }
                    if let Some(lo) = lower.as_ref() {
                        if self.comparator.compare(lo, &key) == Ordering::Greater {
                            return Err(corrupt(format!(
                                "internal {page_num} separator below range"
                            )));
                        }
                    }
                    if let Some(hi) = upper.as_ref() {
                        if self.comparator.compare(&key, hi) != Ordering::Less {
                            return Err(corrupt(format!(
                                "internal {page_num} separator above range"
                            )));
                        }
                    }
                }
                for i in 0..size as usize {
                    let child_lower = if i == 0 { lower } else { Some(view.key_at(i)) };
                    let child_upper = if i + 1 < size as usize {
                        Some(view.key_at(i + 1))
                    } else {
                        upper
                    };
                    self.verify_node(
                        view.child_at(i),
                        child_lower,
                        child_upper,
                        false,
                        depth + 1,
                        walk,
                    )?;
                }
            }
            TreePageType::Invalid => {
                return Err(corrupt(format!("page {page_num} has an invalid type tag")));
            }
        }
        Ok(())
    }
}

struct IntegrityWalk<K> {
    leaves: Vec<u32>,
    keys: Vec<K>,
    leaf_depth: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{GenericKey, OrdComparator};
    use cindra_buffer::{BufferPoolConfig, DiskManager, DiskManagerConfig};
    use tempfile::tempdir;

    type Key = GenericKey<8>;
    type Tree = BPlusTree<Key, OrdComparator>;

    fn rid(n: u64) -> RecordId {
        RecordId::new(PageId::new(0, (n >> 16) as u32), n as u16)
    }

    fn create_test_tree(
        leaf_max: u32,
        internal_max: u32,
    ) -> (Tree, Arc<BufferPool>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let disk = DiskManager::new(DiskManagerConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
        })
        .unwrap();
        let pool = Arc::new(BufferPool::new(
            BufferPoolConfig { num_frames: 64 },
            Arc::new(disk),
        ));
        let header = pool.allocate_page(0).unwrap();
        let header_page_id = header.page_id();
        drop(header);
        let tree = Tree::create(
            "test_index",
            header_page_id,
            Arc::clone(&pool),
            OrdComparator,
            leaf_max,
            internal_max,
        )
        .unwrap();
        (tree, pool, dir)
    }

    #[test]
    fn test_new_tree_is_empty() {
        let (tree, _pool, _dir) = create_test_tree(3, 4);
        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.root_page_num().unwrap(), INVALID_PAGE_NUM);
        assert_eq!(tree.get(&Key::from(1)).unwrap(), None);
    }

    #[test]
    fn test_first_insert_starts_tree() {
        let (tree, _pool, _dir) = create_test_tree(3, 4);

        assert!(tree.insert(&Key::from(42), rid(42)).unwrap());
        assert!(!tree.is_empty().unwrap());
        assert_ne!(tree.root_page_num().unwrap(), INVALID_PAGE_NUM);
        assert_eq!(tree.get(&Key::from(42)).unwrap(), Some(rid(42)));
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let (tree, _pool, _dir) = create_test_tree(3, 4);

        assert!(tree.insert(&Key::from(7), rid(700)).unwrap());
        assert!(!tree.insert(&Key::from(7), rid(701)).unwrap());
        // The first mapping survives
        assert_eq!(tree.get(&Key::from(7)).unwrap(), Some(rid(700)));
    }

    #[test]
    fn test_remove_missing_key_is_noop() {
        let (tree, _pool, _dir) = create_test_tree(3, 4);

        tree.remove(&Key::from(1)).unwrap();

        tree.insert(&Key::from(2), rid(2)).unwrap();
        tree.remove(&Key::from(1)).unwrap();
        assert_eq!(tree.get(&Key::from(2)).unwrap(), Some(rid(2)));
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let (_, pool, _dir) = create_test_tree(3, 4);
        let header = pool.allocate_page(0).unwrap();
        let header_page_id = header.page_id();
        drop(header);

        assert!(Tree::create(
            "bad",
            header_page_id,
            Arc::clone(&pool),
            OrdComparator,
            1,
            4
        )
        .is_err());
        assert!(Tree::create(
            "bad",
            header_page_id,
            Arc::clone(&pool),
            OrdComparator,
            3,
            2
        )
        .is_err());
    }

    #[test]
    fn test_oversized_key_width_rejected() {
        let (_, pool, _dir) = create_test_tree(3, 4);
        let header = pool.allocate_page(0).unwrap();
        let header_page_id = header.page_id();
        drop(header);

        // A 16 KB page cannot hold 1000 dense entries of 64-byte keys
        let result = BPlusTree::<GenericKey<64>, OrdComparator>::create(
            "wide",
            header_page_id,
            Arc::clone(&pool),
            OrdComparator,
            1000,
            4,
        );
        assert!(matches!(result, Err(CindraError::KeyTooLarge { .. })));

        // The same fanout fits once the key is narrow enough
        assert!(BPlusTree::<GenericKey<4>, OrdComparator>::create(
            "narrow",
            header_page_id,
            Arc::clone(&pool),
            OrdComparator,
            1000,
            4,
        )
        .is_ok());
    }

    #[test]
    fn test_split_and_integrity_small_fanout() {
        let (tree, _pool, _dir) = create_test_tree(3, 4);

        for k in 1..=20u64 {
            assert!(tree.insert(&Key::from(k), rid(k)).unwrap());
            tree.check_integrity().unwrap();
        }
        for k in 1..=20u64 {
            assert_eq!(tree.get(&Key::from(k)).unwrap(), Some(rid(k)));
        }
    }

    #[test]
    fn test_remove_to_empty_resets_header() {
        let (tree, _pool, _dir) = create_test_tree(3, 4);

        for k in [3u64, 1, 2] {
            tree.insert(&Key::from(k), rid(k)).unwrap();
        }
        for k in [2u64, 1, 3] {
            tree.remove(&Key::from(k)).unwrap();
            tree.check_integrity().unwrap();
        }

        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.root_page_num().unwrap(), INVALID_PAGE_NUM);
    }
}
