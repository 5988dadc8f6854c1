//! Error types for GraniteDB.

use thiserror::Error;

/// Result type alias using GraniteError.
pub type Result<T> = std::result::Result<T, GraniteError>;

/// Errors that can occur in GraniteDB storage operations.
///
/// Expected conditions (missing key, duplicate key, non-resident page) are
/// expressed through return values rather than errors; this enum covers
/// resource exhaustion, I/O failures, and structural corruption.
#[derive(Debug, Error)]
pub enum GraniteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("page {page_id} does not exist on disk")]
    PageNotFound { page_id: u32 },

    #[error("buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    #[error("page size mismatch: expected {expected}, got {actual}")]
    PageSizeMismatch { expected: usize, actual: usize },

    #[error("invalid node type tag: {0}")]
    InvalidNodeType(u32),

    #[error("index name too long: {0}")]
    IndexNameTooLong(String),

    #[error("header page full, cannot register index {0}")]
    HeaderPageFull(String),

    #[error("index not registered in header page: {0}")]
    IndexNotFound(String),

    #[error("b+tree corrupted: {0}")]
    TreeCorrupted(String),

    #[error("configuration error: {0}")]
    Config(String),
}
