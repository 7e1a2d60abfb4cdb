//! Buffer pool management for CindraDB.
//!
//! This crate provides disk-backed in-memory page caching with:
//! - Fixed-size buffer pool with configurable page count
//! - Clock eviction policy for cache management
//! - Pin counting and per-page reader/writer latches
//! - Dirty page tracking with write-back on eviction
//! - Scoped page guards (basic / read / write) that release their latch
//!   and pin exactly once on drop

mod disk;
mod frame;
mod guard;
mod page_table;
mod pool;
mod replacer;

pub use disk::{DiskManager, DiskManagerConfig};
pub use frame::{BufferFrame, FrameId};
pub use guard::{PageGuard, ReadPageGuard, WritePageGuard};
pub use pool::{BufferPool, BufferPoolConfig, BufferPoolStats};
pub use replacer::{ClockReplacer, Replacer};
