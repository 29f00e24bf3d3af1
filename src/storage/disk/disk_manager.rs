use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::{BirchError, PageId, Result, PAGE_SIZE};

/// DiskManager reads and writes fixed-size pages of a single database file.
///
/// Deallocated page ids are remembered in memory and handed out again by
/// `allocate_page` before the file is extended. The free list is not
/// persisted: after a reopen, pages freed in an earlier session stay unused.
pub struct DiskManager {
    db_file: Mutex<File>,
    db_path: String,
    /// Number of pages the file has been extended to
    num_pages: AtomicU32,
    /// Deallocated page ids, reused LIFO
    free_pages: Mutex<Vec<PageId>>,
    num_reads: AtomicU32,
    num_writes: AtomicU32,
}

impl DiskManager {
    /// Opens the database file at `db_path`, creating it if it doesn't exist.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path_str = db_path.as_ref().to_string_lossy().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&db_path)?;

        let num_pages = (file.metadata()?.len() / PAGE_SIZE as u64) as u32;
        debug!(path = %path_str, num_pages, "opened database file");

        Ok(Self {
            db_file: Mutex::new(file),
            db_path: path_str,
            num_pages: AtomicU32::new(num_pages),
            free_pages: Mutex::new(Vec::new()),
            num_reads: AtomicU32::new(0),
            num_writes: AtomicU32::new(0),
        })
    }

    fn offset(page_id: PageId) -> u64 {
        page_id.as_u32() as u64 * PAGE_SIZE as u64
    }

    fn check_allocated(&self, page_id: PageId) -> Result<()> {
        if !page_id.is_valid() {
            return Err(BirchError::InvalidPageId(page_id));
        }
        if page_id.as_u32() >= self.get_num_pages() {
            return Err(BirchError::PageNotFound(page_id));
        }
        Ok(())
    }

    fn check_live(&self, page_id: PageId) -> Result<()> {
        self.check_allocated(page_id)?;
        if self.free_pages.lock().contains(&page_id) {
            return Err(BirchError::PageNotFound(page_id));
        }
        Ok(())
    }

    /// Reads page `page_id` into `data`, which must be `PAGE_SIZE` bytes.
    /// Deallocated pages cannot be read.
    pub fn read_page(&self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE, "Buffer must be PAGE_SIZE bytes");
        self.check_live(page_id)?;

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(Self::offset(page_id)))?;

        // A page allocated but never written past the end of file reads as zeros
        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = file.read(&mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data[filled..].fill(0);

        self.num_reads.fetch_add(1, Ordering::Relaxed);
        trace!(page_id = page_id.as_u32(), "page read");
        Ok(())
    }

    /// Writes `data` (exactly `PAGE_SIZE` bytes) to page `page_id`.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE, "Buffer must be PAGE_SIZE bytes");
        self.check_live(page_id)?;

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(Self::offset(page_id)))?;
        file.write_all(data)?;
        file.flush()?;

        self.num_writes.fetch_add(1, Ordering::Relaxed);
        trace!(page_id = page_id.as_u32(), "page written");
        Ok(())
    }

    /// Allocates a zero-filled page, reusing a deallocated id if one exists.
    pub fn allocate_page(&self) -> Result<PageId> {
        let page_id = match self.free_pages.lock().pop() {
            Some(page_id) => page_id,
            None => PageId::new(self.num_pages.fetch_add(1, Ordering::SeqCst)),
        };

        self.write_page(page_id, &[0u8; PAGE_SIZE])?;
        Ok(page_id)
    }

    /// Returns `page_id` to the free list. Returns false if the page was never
    /// allocated or is already free.
    pub fn deallocate_page(&self, page_id: PageId) -> Result<bool> {
        self.check_allocated(page_id)?;

        let mut free_pages = self.free_pages.lock();
        if free_pages.contains(&page_id) {
            return Ok(false);
        }
        free_pages.push(page_id);
        debug!(page_id = page_id.as_u32(), "page deallocated");
        Ok(true)
    }

    /// Number of pages the file has been extended to, free ones included.
    pub fn get_num_pages(&self) -> u32 {
        self.num_pages.load(Ordering::SeqCst)
    }

    /// Number of deallocated pages awaiting reuse.
    pub fn get_num_free_pages(&self) -> usize {
        self.free_pages.lock().len()
    }

    pub fn get_num_reads(&self) -> u32 {
        self.num_reads.load(Ordering::Relaxed)
    }

    pub fn get_num_writes(&self) -> u32 {
        self.num_writes.load(Ordering::Relaxed)
    }

    pub fn get_db_path(&self) -> &str {
        &self.db_path
    }

    /// Forces written pages to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.db_file.lock().sync_all()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.db_file.get_mut().sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_disk_manager_allocate_page() {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = DiskManager::new(temp_file.path()).unwrap();
        assert_eq!(dm.get_num_pages(), 0);

        assert_eq!(dm.allocate_page().unwrap(), PageId::new(0));
        assert_eq!(dm.allocate_page().unwrap(), PageId::new(1));
        assert_eq!(dm.get_num_pages(), 2);
    }

    #[test]
    fn test_disk_manager_reuses_deallocated_pages() {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = DiskManager::new(temp_file.path()).unwrap();

        for _ in 0..3 {
            dm.allocate_page().unwrap();
        }
        let mut data = [7u8; PAGE_SIZE];
        dm.write_page(PageId::new(1), &data).unwrap();

        assert!(dm.deallocate_page(PageId::new(1)).unwrap());
        assert!(!dm.deallocate_page(PageId::new(1)).unwrap());
        assert_eq!(dm.get_num_free_pages(), 1);
        assert!(matches!(
            dm.read_page(PageId::new(1), &mut data),
            Err(BirchError::PageNotFound(_))
        ));

        // The freed id comes back zeroed and the file does not grow
        assert_eq!(dm.allocate_page().unwrap(), PageId::new(1));
        assert_eq!(dm.get_num_pages(), 3);
        dm.read_page(PageId::new(1), &mut data).unwrap();
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_disk_manager_rejects_unallocated_pages() {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = DiskManager::new(temp_file.path()).unwrap();

        let mut data = [0u8; PAGE_SIZE];
        assert!(matches!(
            dm.read_page(PageId::new(4), &mut data),
            Err(BirchError::PageNotFound(_))
        ));
        assert!(matches!(
            dm.deallocate_page(PageId::new(4)),
            Err(BirchError::PageNotFound(_))
        ));
    }
}
