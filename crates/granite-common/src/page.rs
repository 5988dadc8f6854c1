//! Page identifiers for GraniteDB storage.

use serde::{Deserialize, Serialize};

/// Page size in bytes (4 KB).
pub const PAGE_SIZE: usize = 4096;

/// Log sequence number stamped into page headers by the external log manager.
///
/// The storage core treats this value as opaque.
pub type Lsn = u32;

/// Unique identifier for a page within the database file.
///
/// `u32::MAX` is the invalid sentinel; its little-endian byte pattern is
/// identical to an `i32` value of -1, so on-disk headers that store page ids
/// as signed integers round-trip unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// Invalid page ID.
    pub const INVALID: PageId = PageId(u32::MAX);

    /// Creates a new PageId.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns true if this is a valid page ID.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Returns the byte offset of this page within the database file.
    pub fn file_offset(&self) -> u64 {
        (self.0 as u64) * (PAGE_SIZE as u64)
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "page:{}", self.0)
        } else {
            write!(f, "page:invalid")
        }
    }
}
