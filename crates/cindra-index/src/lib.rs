//! Concurrent on-disk B+ tree index for CindraDB.
//!
//! This crate provides the index data structure a relational storage
//! engine uses to accelerate equality and range lookups:
//! - A templated B+ tree mapping unique ordered keys to record ids
//! - Byte-exact page layouts for header, internal, and leaf pages
//! - Latch crabbing over the buffer pool's scoped page guards
//! - A forward iterator over the leaf sibling chain
//! - File-driven batch harnesses for workload replay

mod context;
mod harness;
mod iterator;
pub mod key;
pub mod page;
mod tree;

pub use harness::record_id_for_key;
pub use iterator::TreeIterator;
pub use key::{GenericKey, IndexKey, KeyComparator, OrdComparator};
pub use tree::BPlusTree;
