//! Error types for CindraDB.

use crate::page::PageId;
use thiserror::Error;

/// Result type alias using CindraError.
pub type Result<T> = std::result::Result<T, CindraError>;

/// Errors that can occur in CindraDB operations.
#[derive(Debug, Error)]
pub enum CindraError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    // Buffer pool errors
    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: PageId },

    #[error("Page corrupted: {page_id}, reason: {reason}")]
    PageCorrupted { page_id: PageId, reason: String },

    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    // Index errors
    #[error("Invalid page type tag: {tag}")]
    InvalidPageType { tag: u32 },

    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Index corrupted: {0}")]
    IndexCorrupted(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}
