//! Buffer pool manager for OakDB
//!
//! A fixed-size pool of frames caching disk pages, with LRU eviction. A
//! dirty page is only written back once every log record up to its page LSN
//! is durable (the WAL rule).
//!
//! Callers do not touch frames directly: `PageGuard` pins a page on
//! acquisition and unpins it on drop, with an explicit dirty mark.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::disk::DiskManager;
use super::page::{Lsn, Page, PageId, PAGE_SIZE};
use super::wal::LogManager;
use crate::error::{Error, Result};

/// Buffer pool manager
pub struct BufferPoolManager {
    /// Buffer frames
    frames: Vec<Page>,
    /// Page table: PageId -> frame index
    page_table: HashMap<PageId, usize>,
    /// Indices of empty frames
    free_list: Vec<usize>,
    /// LRU order of unpinned frames, least recent first
    replacer: Vec<usize>,
    /// Disk manager for file I/O
    disk: Arc<DiskManager>,
    /// Log manager, consulted before a dirty page may be written back
    log_mgr: Option<Arc<LogManager>>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, disk: Arc<DiskManager>, log_mgr: Option<Arc<LogManager>>) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            frames.push(Page::new(PageId::new(-1, -1)));
            free_list.push(i);
        }
        Self {
            frames,
            page_table: HashMap::new(),
            free_list,
            replacer: Vec::new(),
            disk: disk.clone(),
            log_mgr,
        }
    }

    pub fn disk(&self) -> Arc<DiskManager> {
        self.disk.clone()
    }

    /// Fetch a page, pinning it. Reads from disk on a miss.
    pub fn fetch_page(&mut self, page_id: PageId) -> Result<usize> {
        if let Some(&index) = self.page_table.get(&page_id) {
            self.pin_frame(index);
            return Ok(index);
        }

        let index = self.get_victim_frame()?;
        let mut data = vec![0u8; PAGE_SIZE];
        self.disk.read_page(page_id.fd, page_id.page_no, &mut data)?;
        self.frames[index] = Page::from_bytes(page_id, &data);
        self.page_table.insert(page_id, index);
        self.pin_frame(index);
        Ok(index)
    }

    /// Allocate a fresh page in `fd` and pin it.
    pub fn new_page(&mut self, fd: i32) -> Result<(PageId, usize)> {
        let page_no = self.disk.allocate_page(fd)?;
        let page_id = PageId::new(fd, page_no);

        let index = self.get_victim_frame()?;
        self.frames[index] = Page::new(page_id);
        self.frames[index].set_dirty(true);
        self.page_table.insert(page_id, index);
        self.pin_frame(index);
        Ok((page_id, index))
    }

    /// Release one pin; the frame becomes evictable at pin count zero.
    pub fn unpin_page(&mut self, page_id: PageId, dirty: bool) {
        if let Some(&index) = self.page_table.get(&page_id) {
            if dirty {
                self.frames[index].set_dirty(true);
            }
            self.frames[index].unpin();
            if self.frames[index].pin_count() == 0 && !self.replacer.contains(&index) {
                self.replacer.push(index);
            }
        }
    }

    /// Drop a page from the pool without writing it back. The page number
    /// itself is never reused.
    pub fn delete_page(&mut self, page_id: PageId) {
        if let Some(index) = self.page_table.remove(&page_id) {
            if let Some(pos) = self.replacer.iter().position(|&x| x == index) {
                self.replacer.remove(pos);
            }
            self.frames[index] = Page::new(PageId::new(-1, -1));
            self.free_list.push(index);
        }
    }

    /// Drop every cached page of a file, without write-back. Called before
    /// the file itself is destroyed.
    pub fn discard_file_pages(&mut self, fd: i32) {
        let ids: Vec<PageId> = self
            .page_table
            .keys()
            .filter(|id| id.fd == fd)
            .copied()
            .collect();
        for id in ids {
            self.delete_page(id);
        }
    }

    pub fn get_page(&self, index: usize) -> &Page {
        &self.frames[index]
    }

    pub fn get_page_mut(&mut self, index: usize) -> &mut Page {
        &mut self.frames[index]
    }

    pub fn frame_index(&self, page_id: PageId) -> Option<usize> {
        self.page_table.get(&page_id).copied()
    }

    fn pin_frame(&mut self, index: usize) {
        self.frames[index].pin();
        if let Some(pos) = self.replacer.iter().position(|&x| x == index) {
            self.replacer.remove(pos);
        }
    }

    /// Write a page back if dirty, forcing the log first (WAL).
    pub fn flush_page(&mut self, page_id: PageId) -> Result<()> {
        if let Some(&index) = self.page_table.get(&page_id) {
            if self.frames[index].is_dirty() {
                self.force_log(self.frames[index].lsn())?;
                self.disk
                    .write_page(page_id.fd, page_id.page_no, self.frames[index].data())?;
                self.frames[index].set_dirty(false);
            }
        }
        Ok(())
    }

    pub fn flush_all(&mut self) -> Result<()> {
        let ids: Vec<PageId> = self.page_table.keys().copied().collect();
        for id in ids {
            self.flush_page(id)?;
        }
        Ok(())
    }

    fn force_log(&self, page_lsn: Lsn) -> Result<()> {
        if let Some(log_mgr) = &self.log_mgr {
            if page_lsn > log_mgr.persistent_lsn() {
                log_mgr.flush()?;
            }
        }
        Ok(())
    }

    fn get_victim_frame(&mut self) -> Result<usize> {
        if let Some(index) = self.free_list.pop() {
            return Ok(index);
        }
        if self.replacer.is_empty() {
            return Err(Error::Internal(
                "buffer pool exhausted: all frames pinned".to_string(),
            ));
        }
        let index = self.replacer.remove(0);
        let victim_id = self.frames[index].id();
        self.flush_page(victim_id)?;
        self.page_table.remove(&victim_id);
        Ok(index)
    }
}

/// Scoped pin on a buffer frame. Pins on acquisition, unpins on drop; the
/// dirty flag accumulates from every write made through the guard.
pub struct PageGuard {
    bpm: Arc<Mutex<BufferPoolManager>>,
    page_id: PageId,
    dirty: bool,
}

impl PageGuard {
    /// Pin an existing page.
    pub fn fetch(bpm: &Arc<Mutex<BufferPoolManager>>, page_id: PageId) -> Result<PageGuard> {
        bpm.lock().fetch_page(page_id)?;
        Ok(PageGuard {
            bpm: bpm.clone(),
            page_id,
            dirty: false,
        })
    }

    /// Allocate and pin a fresh page.
    pub fn create(bpm: &Arc<Mutex<BufferPoolManager>>, fd: i32) -> Result<PageGuard> {
        let (page_id, _) = bpm.lock().new_page(fd)?;
        Ok(PageGuard {
            bpm: bpm.clone(),
            page_id,
            dirty: true,
        })
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn page_no(&self) -> i32 {
        self.page_id.page_no
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        let bpm = self.bpm.lock();
        let index = bpm
            .frame_index(self.page_id)
            .expect("pinned page must stay resident");
        bpm.get_page(index).read(offset, len).to_vec()
    }

    pub fn read_i32(&self, offset: usize) -> i32 {
        let bpm = self.bpm.lock();
        let index = bpm
            .frame_index(self.page_id)
            .expect("pinned page must stay resident");
        bpm.get_page(index).read_i32(offset)
    }

    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        self.dirty = true;
        let mut bpm = self.bpm.lock();
        let index = bpm
            .frame_index(self.page_id)
            .expect("pinned page must stay resident");
        bpm.get_page_mut(index).write(offset, bytes);
    }

    pub fn write_i32(&mut self, offset: usize, value: i32) {
        self.write(offset, &value.to_le_bytes());
    }

    pub fn lsn(&self) -> Lsn {
        let bpm = self.bpm.lock();
        let index = bpm
            .frame_index(self.page_id)
            .expect("pinned page must stay resident");
        bpm.get_page(index).lsn()
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.dirty = true;
        let mut bpm = self.bpm.lock();
        let index = bpm
            .frame_index(self.page_id)
            .expect("pinned page must stay resident");
        bpm.get_page_mut(index).set_lsn(lsn);
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.bpm.lock().unpin_page(self.page_id, self.dirty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(pool_size: usize) -> (TempDir, Arc<Mutex<BufferPoolManager>>, i32) {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path()).unwrap());
        let fd = disk.create_file("t.dat").unwrap();
        let bpm = Arc::new(Mutex::new(BufferPoolManager::new(pool_size, disk, None)));
        (dir, bpm, fd)
    }

    #[test]
    fn test_new_fetch_unpin() {
        let (_dir, bpm, fd) = setup(4);

        let page_id = {
            let mut guard = PageGuard::create(&bpm, fd).unwrap();
            guard.write_i32(0, 1234);
            guard.page_id()
        };

        let guard = PageGuard::fetch(&bpm, page_id).unwrap();
        assert_eq!(guard.read_i32(0), 1234);
    }

    #[test]
    fn test_eviction_round_trip() {
        let (_dir, bpm, fd) = setup(3);

        // Write more pages than the pool holds; early ones get evicted.
        let mut ids = Vec::new();
        for i in 0..6 {
            let mut guard = PageGuard::create(&bpm, fd).unwrap();
            guard.write_i32(8, i * 10);
            ids.push(guard.page_id());
        }

        for (i, id) in ids.iter().enumerate() {
            let guard = PageGuard::fetch(&bpm, *id).unwrap();
            assert_eq!(guard.read_i32(8), i as i32 * 10);
        }
    }

    #[test]
    fn test_pool_exhaustion() {
        let (_dir, bpm, fd) = setup(2);
        let _a = PageGuard::create(&bpm, fd).unwrap();
        let _b = PageGuard::create(&bpm, fd).unwrap();
        assert!(PageGuard::create(&bpm, fd).is_err());
    }

    #[test]
    fn test_delete_page() {
        let (_dir, bpm, fd) = setup(2);
        let id = {
            let guard = PageGuard::create(&bpm, fd).unwrap();
            guard.page_id()
        };
        bpm.lock().delete_page(id);
        assert!(bpm.lock().frame_index(id).is_none());
    }
}
