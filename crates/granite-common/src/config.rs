//! Configuration structures for GraniteDB.

use crate::page::PAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage configuration for the database engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the database file.
    pub db_path: PathBuf,
    /// Buffer pool size in number of frames.
    pub buffer_pool_frames: usize,
    /// Number of buffer pool instances for the parallel pool (1 = single).
    pub buffer_pool_instances: usize,
    /// Enable fsync for durability.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./granite.db"),
            buffer_pool_frames: 8192, // 32 MB with 4 KB pages
            buffer_pool_instances: 1,
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Returns the total buffer pool size in bytes.
    pub fn buffer_pool_size_bytes(&self) -> usize {
        self.buffer_pool_frames * PAGE_SIZE
    }
}
