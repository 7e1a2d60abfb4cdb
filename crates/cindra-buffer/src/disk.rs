//! Disk manager for page-level file I/O.

use cindra_common::{CindraError, PageId, Result, PAGE_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Base directory for data files.
    pub data_dir: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
        }
    }
}

/// Manages reading and writing pages to disk files.
///
/// Each file_id maps to a separate data file. File 0 is typically the
/// main data file, while higher file IDs hold indexes.
pub struct DiskManager {
    /// Configuration.
    config: DiskManagerConfig,
    /// Open file handles keyed by file_id.
    files: Mutex<HashMap<u32, FileHandle>>,
}

/// Handle for an open data file.
struct FileHandle {
    /// The file handle.
    file: File,
    /// Number of pages in the file.
    num_pages: u32,
}

impl DiskManager {
    /// Creates a new disk manager.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(Self {
            config,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Generates the file path for a given file ID.
    fn file_path(&self, file_id: u32) -> PathBuf {
        self.config.data_dir.join(format!("{:08}.cdx", file_id))
    }

    /// Opens or creates a data file.
    fn open_file(&self, file_id: u32) -> Result<()> {
        let mut files = self.files.lock();

        if files.contains_key(&file_id) {
            return Ok(());
        }

        let path = self.file_path(file_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        files.insert(file_id, FileHandle { file, num_pages });

        Ok(())
    }

    /// Reads a page from disk.
    pub fn read_page(&self, page_id: PageId) -> Result<[u8; PAGE_SIZE]> {
        self.open_file(page_id.file_id)?;

        let mut files = self.files.lock();
        let handle = files
            .get_mut(&page_id.file_id)
            .ok_or_else(|| CindraError::IoError(format!("file {} not open", page_id.file_id)))?;

        if page_id.page_num >= handle.num_pages {
            return Err(CindraError::PageNotFound { page_id });
        }

        let offset = (page_id.page_num as u64) * (PAGE_SIZE as u64);
        handle.file.seek(SeekFrom::Start(offset))?;

        let mut buffer = [0u8; PAGE_SIZE];
        handle.file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// Writes a page to disk.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        self.open_file(page_id.file_id)?;

        let mut files = self.files.lock();
        let handle = files
            .get_mut(&page_id.file_id)
            .ok_or_else(|| CindraError::IoError(format!("file {} not open", page_id.file_id)))?;

        let offset = (page_id.page_num as u64) * (PAGE_SIZE as u64);
        handle.file.seek(SeekFrom::Start(offset))?;
        handle.file.write_all(data)?;

        if self.config.fsync_enabled {
            handle.file.sync_all()?;
        }

        // Update page count if we extended the file
        if page_id.page_num >= handle.num_pages {
            handle.num_pages = page_id.page_num + 1;
        }

        Ok(())
    }

    /// Allocates a new page in the specified file.
    ///
    /// Returns the PageId of the newly allocated page. The page contents
    /// on disk are zeroed.
    pub fn allocate_page(&self, file_id: u32) -> Result<PageId> {
        self.open_file(file_id)?;

        let mut files = self.files.lock();
        let handle = files
            .get_mut(&file_id)
            .ok_or_else(|| CindraError::IoError(format!("file {} not open", file_id)))?;

        let page_num = handle.num_pages;
        let page_id = PageId::new(file_id, page_num);

        // Write an empty page to extend the file
        let offset = (page_num as u64) * (PAGE_SIZE as u64);
        handle.file.seek(SeekFrom::Start(offset))?;
        handle.file.write_all(&[0u8; PAGE_SIZE])?;

        if self.config.fsync_enabled {
            handle.file.sync_all()?;
        }

        handle.num_pages = page_num + 1;

        Ok(page_id)
    }

    /// Returns the number of pages in a file.
    pub fn num_pages(&self, file_id: u32) -> Result<u32> {
        self.open_file(file_id)?;

        let files = self.files.lock();
        let handle = files
            .get(&file_id)
            .ok_or_else(|| CindraError::IoError(format!("file {} not open", file_id)))?;

        Ok(handle.num_pages)
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        let files = self.files.lock();
        for handle in files.values() {
            handle.file.sync_all()?;
        }
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let files = self.files.lock();
        for handle in files.values() {
            let _ = handle.file.sync_all();
        }
    }
}
