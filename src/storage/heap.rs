//! Heap file record manager for OakDB
//!
//! A heap file stores fixed-width records in slotted pages. Page 0 is the
//! file header; every data page carries a small header, a bitmap of
//! occupied slots, and the slot array. Pages with free slots are chained
//! into a free-page list headed in the file header.

use std::sync::Arc;

use parking_lot::Mutex;

use super::buffer_pool::{BufferPoolManager, PageGuard};
use super::disk::DiskManager;
use super::page::{Lsn, PageId, PAGE_SIZE};
use crate::error::{Error, Result};

/// Sentinel for "no page" in the free list
pub const RM_NO_PAGE: i32 = -1;

/// Page number of the file header page
pub const RM_FILE_HDR_PAGE: i32 = 0;

/// First data page of a heap file
pub const RM_FIRST_RECORD_PAGE: i32 = 1;

/// Data page header: {next_free_page_no, num_records}
const RM_PAGE_HDR_SIZE: usize = 8;

/// Record identifier: (page number, slot number) within one heap file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rid {
    pub page_no: i32,
    pub slot_no: i32,
}

impl Rid {
    pub fn new(page_no: i32, slot_no: i32) -> Self {
        Self { page_no, slot_no }
    }
}

/// Bitmap helpers over a byte slice
pub mod bitmap {
    pub fn is_set(buf: &[u8], pos: usize) -> bool {
        buf[pos / 8] & (1 << (pos % 8)) != 0
    }

    pub fn set(buf: &mut [u8], pos: usize) {
        buf[pos / 8] |= 1 << (pos % 8);
    }

    pub fn reset(buf: &mut [u8], pos: usize) {
        buf[pos / 8] &= !(1 << (pos % 8));
    }

    /// First clear bit in [0, n), or n if none.
    pub fn first_zero_bit(buf: &[u8], n: usize) -> usize {
        (0..n).find(|&i| !is_set(buf, i)).unwrap_or(n)
    }

    /// First set bit strictly after `cur` in [0, n), or n if none. Pass
    /// `cur = -1` to search from the start.
    pub fn next_set_bit(buf: &[u8], n: usize, cur: i32) -> usize {
        let start = (cur + 1).max(0) as usize;
        (start..n).find(|&i| is_set(buf, i)).unwrap_or(n)
    }

    pub fn count(buf: &[u8], n: usize) -> usize {
        (0..n).filter(|&i| is_set(buf, i)).count()
    }
}

/// In-memory copy of the heap file header page
#[derive(Debug, Clone, Copy)]
pub struct RmFileHdr {
    pub record_size: i32,
    pub num_pages: i32,
    pub num_records_per_page: i32,
    pub bitmap_size: i32,
    pub first_free_page_no: i32,
}

impl RmFileHdr {
    fn new(record_size: usize) -> Self {
        let mut n = ((PAGE_SIZE - RM_PAGE_HDR_SIZE) * 8) / (1 + record_size * 8);
        while RM_PAGE_HDR_SIZE + (n + 7) / 8 + n * record_size > PAGE_SIZE {
            n -= 1;
        }
        Self {
            record_size: record_size as i32,
            num_pages: 1,
            num_records_per_page: n as i32,
            bitmap_size: ((n + 7) / 8) as i32,
            first_free_page_no: RM_NO_PAGE,
        }
    }

    fn serialize(&self) -> [u8; 20] {
        let mut buf = [0u8; 20];
        buf[0..4].copy_from_slice(&self.record_size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.num_pages.to_le_bytes());
        buf[8..12].copy_from_slice(&self.num_records_per_page.to_le_bytes());
        buf[12..16].copy_from_slice(&self.bitmap_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.first_free_page_no.to_le_bytes());
        buf
    }

    fn deserialize(buf: &[u8]) -> Self {
        let rd = |i: usize| i32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Self {
            record_size: rd(0),
            num_pages: rd(4),
            num_records_per_page: rd(8),
            bitmap_size: rd(12),
            first_free_page_no: rd(16),
        }
    }
}

/// Handle to one open heap file
pub struct RmFileHandle {
    fd: i32,
    name: String,
    bpm: Arc<Mutex<BufferPoolManager>>,
    disk: Arc<DiskManager>,
    hdr: Mutex<RmFileHdr>,
}

impl RmFileHandle {
    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_hdr(&self) -> RmFileHdr {
        *self.hdr.lock()
    }

    pub fn record_size(&self) -> usize {
        self.hdr.lock().record_size as usize
    }

    fn bitmap_offset() -> usize {
        RM_PAGE_HDR_SIZE
    }

    fn slot_offset(hdr: &RmFileHdr, slot_no: i32) -> usize {
        RM_PAGE_HDR_SIZE + hdr.bitmap_size as usize + (slot_no as usize) * hdr.record_size as usize
    }

    fn fetch_page_handle(&self, page_no: i32, hdr: &RmFileHdr) -> Result<PageGuard> {
        if page_no < RM_FIRST_RECORD_PAGE || page_no >= hdr.num_pages {
            return Err(Error::PageNotExist(self.fd, page_no));
        }
        PageGuard::fetch(&self.bpm, PageId::new(self.fd, page_no))
    }

    fn create_new_page_handle(&self, hdr: &mut RmFileHdr) -> Result<PageGuard> {
        let mut guard = PageGuard::create(&self.bpm, self.fd)?;
        guard.write_i32(0, RM_NO_PAGE); // next_free_page_no
        guard.write_i32(4, 0); // num_records
        guard.write(Self::bitmap_offset(), &vec![0u8; hdr.bitmap_size as usize]);
        hdr.first_free_page_no = guard.page_no();
        hdr.num_pages += 1;
        Ok(guard)
    }

    /// Get a page with at least one free slot, reusing the free list head
    /// when possible.
    fn create_page_handle(&self, hdr: &mut RmFileHdr) -> Result<PageGuard> {
        loop {
            if hdr.first_free_page_no == RM_NO_PAGE {
                return self.create_new_page_handle(hdr);
            }
            let guard = self.fetch_page_handle(hdr.first_free_page_no, hdr)?;
            if guard.read_i32(4) < hdr.num_records_per_page {
                return Ok(guard);
            }
            // Stale free-list head (filled by a placed insert); pop it.
            hdr.first_free_page_no = guard.read_i32(0);
        }
    }

    /// Fetch the record stored at `rid`.
    pub fn get_record(&self, rid: Rid) -> Result<Vec<u8>> {
        let hdr = self.hdr.lock();
        let guard = self.fetch_page_handle(rid.page_no, &hdr)?;
        let bm = guard.read(Self::bitmap_offset(), hdr.bitmap_size as usize);
        if !bitmap::is_set(&bm, rid.slot_no as usize) {
            return Err(Error::RecordNotFound(rid.page_no, rid.slot_no));
        }
        Ok(guard.read(Self::slot_offset(&hdr, rid.slot_no), hdr.record_size as usize))
    }

    /// True if a live record sits at `rid`.
    pub fn is_record(&self, rid: Rid) -> bool {
        let hdr = self.hdr.lock();
        match self.fetch_page_handle(rid.page_no, &hdr) {
            Ok(guard) => {
                let bm = guard.read(Self::bitmap_offset(), hdr.bitmap_size as usize);
                bitmap::is_set(&bm, rid.slot_no as usize)
            }
            Err(_) => false,
        }
    }

    /// The rid the next insert will use: the lowest clear bit of the free
    /// list head (allocating a fresh page if the list is empty). The slot
    /// is not taken; callers log against this rid first, then place the
    /// record there with `insert_record_at`.
    pub fn next_free_rid(&self) -> Result<Rid> {
        let mut hdr = self.hdr.lock();
        let guard = self.create_page_handle(&mut hdr)?;
        let bm = guard.read(Self::bitmap_offset(), hdr.bitmap_size as usize);
        let slot_no = bitmap::first_zero_bit(&bm, hdr.num_records_per_page as usize);
        Ok(Rid::new(guard.page_no(), slot_no as i32))
    }

    /// Stamp a page with the LSN of the log record covering its next
    /// mutation.
    pub fn set_page_lsn(&self, page_no: i32, lsn: Lsn) -> Result<()> {
        let hdr = self.hdr.lock();
        let mut guard = self.fetch_page_handle(page_no, &hdr)?;
        guard.set_lsn(lsn);
        Ok(())
    }

    /// Insert a record into the lowest free slot of a free page.
    pub fn insert_record(&self, buf: &[u8]) -> Result<Rid> {
        let mut hdr = self.hdr.lock();
        let mut guard = self.create_page_handle(&mut hdr)?;

        let mut bm = guard.read(Self::bitmap_offset(), hdr.bitmap_size as usize);
        let slot_no = bitmap::first_zero_bit(&bm, hdr.num_records_per_page as usize);
        bitmap::set(&mut bm, slot_no);
        guard.write(Self::bitmap_offset(), &bm);

        let num_records = guard.read_i32(4) + 1;
        guard.write_i32(4, num_records);
        if num_records == hdr.num_records_per_page {
            // Page went full; advance the free list past it.
            hdr.first_free_page_no = guard.read_i32(0);
        }

        guard.write(Self::slot_offset(&hdr, slot_no as i32), buf);
        Ok(Rid::new(guard.page_no(), slot_no as i32))
    }

    /// Insert a record at a caller-chosen rid (redo/undo path). The slot
    /// must be free.
    pub fn insert_record_at(&self, rid: Rid, buf: &[u8]) -> Result<()> {
        let mut hdr = self.hdr.lock();
        let mut guard = self.fetch_page_handle(rid.page_no, &hdr)?;

        let mut bm = guard.read(Self::bitmap_offset(), hdr.bitmap_size as usize);
        if bitmap::is_set(&bm, rid.slot_no as usize) {
            return Err(Error::Internal(format!(
                "slot ({}, {}) is already occupied",
                rid.page_no, rid.slot_no
            )));
        }
        bitmap::set(&mut bm, rid.slot_no as usize);
        guard.write(Self::bitmap_offset(), &bm);

        let num_records = guard.read_i32(4) + 1;
        guard.write_i32(4, num_records);
        if num_records == hdr.num_records_per_page && hdr.first_free_page_no == rid.page_no {
            hdr.first_free_page_no = guard.read_i32(0);
        }

        guard.write(Self::slot_offset(&hdr, rid.slot_no), buf);
        Ok(())
    }

    /// Delete the record at `rid`, splicing the page back onto the free
    /// list if it was full.
    pub fn delete_record(&self, rid: Rid) -> Result<()> {
        let mut hdr = self.hdr.lock();
        let mut guard = self.fetch_page_handle(rid.page_no, &hdr)?;

        let mut bm = guard.read(Self::bitmap_offset(), hdr.bitmap_size as usize);
        if !bitmap::is_set(&bm, rid.slot_no as usize) {
            return Err(Error::RecordNotFound(rid.page_no, rid.slot_no));
        }

        let num_records = guard.read_i32(4);
        if num_records == hdr.num_records_per_page {
            // Full -> not full: push onto the free list head.
            guard.write_i32(0, hdr.first_free_page_no);
            hdr.first_free_page_no = rid.page_no;
        }

        bitmap::reset(&mut bm, rid.slot_no as usize);
        guard.write(Self::bitmap_offset(), &bm);
        guard.write_i32(4, num_records - 1);
        Ok(())
    }

    /// Overwrite the record at `rid` in place.
    pub fn update_record(&self, rid: Rid, buf: &[u8]) -> Result<()> {
        let hdr = self.hdr.lock();
        let mut guard = self.fetch_page_handle(rid.page_no, &hdr)?;

        let bm = guard.read(Self::bitmap_offset(), hdr.bitmap_size as usize);
        if !bitmap::is_set(&bm, rid.slot_no as usize) {
            return Err(Error::RecordNotFound(rid.page_no, rid.slot_no));
        }
        guard.write(Self::slot_offset(&hdr, rid.slot_no), buf);
        Ok(())
    }

    /// Write the file header back to page 0.
    pub fn flush_header(&self) -> Result<()> {
        let hdr = self.hdr.lock();
        let mut buf = vec![0u8; PAGE_SIZE];
        buf[..20].copy_from_slice(&hdr.serialize());
        self.disk.write_page(self.fd, RM_FILE_HDR_PAGE, &buf)
    }
}

/// Creates, opens and destroys heap files
pub struct RmManager {
    disk: Arc<DiskManager>,
    bpm: Arc<Mutex<BufferPoolManager>>,
}

impl RmManager {
    pub fn new(disk: Arc<DiskManager>, bpm: Arc<Mutex<BufferPoolManager>>) -> Self {
        Self { disk, bpm }
    }

    fn file_name(table: &str) -> String {
        format!("{}.tab", table)
    }

    pub fn create_file(&self, table: &str, record_size: usize) -> Result<()> {
        let fd = self.disk.create_file(&Self::file_name(table))?;
        self.disk.allocate_page(fd)?; // page 0: file header
        let hdr = RmFileHdr::new(record_size);
        let mut buf = vec![0u8; PAGE_SIZE];
        buf[..20].copy_from_slice(&hdr.serialize());
        self.disk.write_page(fd, RM_FILE_HDR_PAGE, &buf)?;
        self.disk.close_file(fd);
        Ok(())
    }

    pub fn open_file(&self, table: &str) -> Result<Arc<RmFileHandle>> {
        let fd = self.disk.open_file(&Self::file_name(table))?;
        let mut buf = vec![0u8; PAGE_SIZE];
        self.disk.read_page(fd, RM_FILE_HDR_PAGE, &mut buf)?;
        let hdr = RmFileHdr::deserialize(&buf);
        self.disk.set_next_page_no(fd, hdr.num_pages);
        Ok(Arc::new(RmFileHandle {
            fd,
            name: table.to_string(),
            bpm: self.bpm.clone(),
            disk: self.disk.clone(),
            hdr: Mutex::new(hdr),
        }))
    }

    pub fn close_file(&self, fh: &RmFileHandle) -> Result<()> {
        fh.flush_header()?;
        self.bpm.lock().flush_all()?;
        self.disk.close_file(fh.fd);
        Ok(())
    }

    pub fn destroy_file(&self, table: &str) -> Result<()> {
        let name = Self::file_name(table);
        if let Some(fd) = self.disk.fd_of(&name) {
            self.bpm.lock().discard_file_pages(fd);
        }
        self.disk.destroy_file(&name)
    }

    pub fn file_exists(&self, table: &str) -> bool {
        self.disk.file_exists(&Self::file_name(table))
    }
}

/// Forward iterator over the live records of a heap file
pub struct RmScan {
    fh: Arc<RmFileHandle>,
    rid: Rid,
}

impl RmScan {
    /// Position on the first live record.
    pub fn new(fh: Arc<RmFileHandle>) -> Result<RmScan> {
        let mut scan = RmScan {
            fh,
            rid: Rid::new(RM_FIRST_RECORD_PAGE, -1),
        };
        scan.advance()?;
        Ok(scan)
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }

    pub fn is_end(&self) -> bool {
        self.rid.page_no == RM_NO_PAGE
    }

    /// Move to the next live record.
    pub fn next(&mut self) -> Result<()> {
        if !self.is_end() {
            self.advance()?;
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<()> {
        let hdr = self.fh.file_hdr();
        while self.rid.page_no < hdr.num_pages {
            let guard = self.fh.fetch_page_handle(self.rid.page_no, &hdr)?;
            let bm = guard.read(RmFileHandle::bitmap_offset(), hdr.bitmap_size as usize);
            let slot =
                bitmap::next_set_bit(&bm, hdr.num_records_per_page as usize, self.rid.slot_no);
            if slot < hdr.num_records_per_page as usize {
                self.rid.slot_no = slot as i32;
                return Ok(());
            }
            self.rid.slot_no = -1;
            self.rid.page_no += 1;
        }
        self.rid.page_no = RM_NO_PAGE;
        Ok(())
    }
}
