//! Buffer pool management for GraniteDB.
//!
//! This crate provides in-memory page caching with:
//! - Page-granular file I/O through the disk manager
//! - Fixed-size buffer pool with configurable frame count
//! - Strict LRU eviction policy
//! - Pin counting and per-frame reader/writer latches for concurrent access
//! - Dirty page tracking for write-back
//! - Optional sharding across independent pool instances

mod disk;
mod frame;
mod parallel;
mod pool;
mod replacer;

pub use disk::{DiskManager, DiskManagerConfig};
pub use frame::{BufferFrame, FrameId};
pub use parallel::ParallelBufferPool;
pub use pool::{BufferPool, BufferPoolConfig, BufferPoolStats, PageReadGuard, PageWriteGuard};
pub use replacer::LruReplacer;
