//! Disk manager for page-level file I/O.

use granite_common::page::{PageId, PAGE_SIZE};
use granite_common::{GraniteError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Path to the database file.
    pub db_path: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./granite.db"),
            fsync_enabled: true,
        }
    }
}

impl From<&granite_common::StorageConfig> for DiskManagerConfig {
    fn from(config: &granite_common::StorageConfig) -> Self {
        Self {
            db_path: config.db_path.clone(),
            fsync_enabled: config.fsync_enabled,
        }
    }
}

/// Manages reading and writing pages of a single database file.
///
/// Pages are addressed by page id; a page's bytes live at offset
/// `page_id * PAGE_SIZE`.
pub struct DiskManager {
    config: DiskManagerConfig,
    inner: Mutex<DiskInner>,
}

struct DiskInner {
    file: File,
    /// Number of pages currently backed by the file.
    num_pages: u32,
}

impl DiskManager {
    /// Opens or creates the database file.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config.db_path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        Ok(Self {
            config,
            inner: Mutex::new(DiskInner { file, num_pages }),
        })
    }

    /// Returns the database file path.
    pub fn db_path(&self) -> &Path {
        &self.config.db_path
    }

    /// Returns the number of pages backed by the file.
    pub fn num_pages(&self) -> u32 {
        self.inner.lock().num_pages
    }

    /// Reads a page from disk.
    pub fn read_page(&self, page_id: PageId) -> Result<[u8; PAGE_SIZE]> {
        let mut inner = self.inner.lock();

        if page_id.0 >= inner.num_pages {
            return Err(GraniteError::PageNotFound { page_id: page_id.0 });
        }

        inner.file.seek(SeekFrom::Start(page_id.file_offset()))?;
        let mut buffer = [0u8; PAGE_SIZE];
        inner.file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// Writes a page to disk, extending the file if needed.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut inner = self.inner.lock();

        inner.file.seek(SeekFrom::Start(page_id.file_offset()))?;
        inner.file.write_all(data)?;

        if self.config.fsync_enabled {
            inner.file.sync_all()?;
        }

        if page_id.0 >= inner.num_pages {
            inner.num_pages = page_id.0 + 1;
        }

        Ok(())
    }

    /// Ensures the file backs `page_id`, zero-extending if it lies past the end.
    ///
    /// Makes a freshly allocated page readable before its first write-back.
    pub fn allocate_page(&self, page_id: PageId) -> Result<()> {
        let mut inner = self.inner.lock();

        if page_id.0 < inner.num_pages {
            return Ok(());
        }

        let new_len = (page_id.0 as u64 + 1) * PAGE_SIZE as u64;
        inner.file.set_len(new_len)?;
        if self.config.fsync_enabled {
            inner.file.sync_all()?;
        }
        inner.num_pages = page_id.0 + 1;

        Ok(())
    }

    /// Flushes all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.inner.lock().file.sync_all();
    }
}
