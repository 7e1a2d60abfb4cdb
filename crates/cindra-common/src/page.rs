//! Page identifiers for CindraDB storage.

use serde::{Deserialize, Serialize};

/// Default page size in bytes (16 KB).
pub const PAGE_SIZE: usize = 16 * 1024;

/// Sentinel page number meaning "no page".
///
/// Page numbers are stored on disk as little-endian `u32`; the sentinel is
/// bit-identical to an `int32` value of `-1`.
pub const INVALID_PAGE_NUM: u32 = u32::MAX;

/// Unique identifier for a page within a file.
///
/// PageId consists of a file ID and page number within that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId {
    /// File identifier (0 = data file, 1+ = index files).
    pub file_id: u32,
    /// Page number within the file (0-indexed).
    pub page_num: u32,
}

impl PageId {
    /// Creates a new PageId.
    pub fn new(file_id: u32, page_num: u32) -> Self {
        Self { file_id, page_num }
    }

    /// The invalid page ID.
    pub const INVALID: PageId = PageId {
        file_id: u32::MAX,
        page_num: INVALID_PAGE_NUM,
    };

    /// Returns true if this PageId refers to an actual page.
    pub fn is_valid(&self) -> bool {
        self.page_num != INVALID_PAGE_NUM
    }

    /// Returns the PageId as a single u64 for compact storage.
    pub fn as_u64(&self) -> u64 {
        ((self.file_id as u64) << 32) | (self.page_num as u64)
    }

    /// Creates a PageId from a u64 representation.
    pub fn from_u64(value: u64) -> Self {
        Self {
            file_id: (value >> 32) as u32,
            page_num: value as u32,
        }
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_num)
    }
}
