//! Disk manager for OakDB
//!
//! Handles file I/O for heap files, index files and the write-ahead log.
//! Each open file is addressed by a small integer descriptor; page
//! allocation is a per-file monotonic counter (page numbers are never
//! reused).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::storage::page::PAGE_SIZE;

/// Name of the write-ahead log file inside the database directory
pub const LOG_FILE_NAME: &str = "db.log";

struct OpenFile {
    file: File,
    path: PathBuf,
    /// Next page number to allocate
    next_page_no: i32,
}

/// Disk manager
pub struct DiskManager {
    /// Database directory
    dir: PathBuf,
    /// Open files by descriptor
    files: Mutex<HashMap<i32, OpenFile>>,
    /// Path -> descriptor, to keep one descriptor per file
    fds: Mutex<HashMap<PathBuf, i32>>,
    /// Next descriptor to hand out
    next_fd: AtomicI32,
    /// Write-ahead log file
    log_file: Mutex<File>,
}

impl DiskManager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(LOG_FILE_NAME))?;
        Ok(Self {
            dir,
            files: Mutex::new(HashMap::new()),
            fds: Mutex::new(HashMap::new()),
            next_fd: AtomicI32::new(0),
            log_file: Mutex::new(log_file),
        })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn file_exists(&self, name: &str) -> bool {
        self.dir.join(name).exists()
    }

    /// Create a new file and return its descriptor.
    pub fn create_file(&self, name: &str) -> Result<i32> {
        let path = self.dir.join(name);
        if path.exists() {
            return Err(Error::Internal(format!("file '{}' already exists", name)));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(self.register(file, path))
    }

    /// Open an existing file (or return the descriptor it is already open
    /// under).
    pub fn open_file(&self, name: &str) -> Result<i32> {
        let path = self.dir.join(name);
        if let Some(&fd) = self.fds.lock().get(&path) {
            return Ok(fd);
        }
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(self.register(file, path))
    }

    fn register(&self, file: File, path: PathBuf) -> i32 {
        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        self.fds.lock().insert(path.clone(), fd);
        self.files.lock().insert(
            fd,
            OpenFile {
                file,
                path,
                next_page_no: 0,
            },
        );
        fd
    }

    /// Descriptor a file is currently open under, if any.
    pub fn fd_of(&self, name: &str) -> Option<i32> {
        self.fds.lock().get(&self.dir.join(name)).copied()
    }

    pub fn close_file(&self, fd: i32) {
        if let Some(open) = self.files.lock().remove(&fd) {
            self.fds.lock().remove(&open.path);
        }
    }

    pub fn destroy_file(&self, name: &str) -> Result<()> {
        let path = self.dir.join(name);
        if let Some(fd) = self.fds.lock().remove(&path) {
            self.files.lock().remove(&fd);
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    pub fn read_page(&self, fd: i32, page_no: i32, buf: &mut [u8]) -> Result<()> {
        let mut files = self.files.lock();
        let open = files
            .get_mut(&fd)
            .ok_or_else(|| Error::Internal(format!("fd {} is not open", fd)))?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        open.file.seek(SeekFrom::Start(offset))?;
        // A page past the flushed end of file reads back as zeroes; the
        // allocation counter, not file length, defines what exists.
        let mut read = 0;
        while read < buf.len() {
            let n = open.file.read(&mut buf[read..])?;
            if n == 0 {
                buf[read..].fill(0);
                break;
            }
            read += n;
        }
        Ok(())
    }

    pub fn write_page(&self, fd: i32, page_no: i32, buf: &[u8]) -> Result<()> {
        let mut files = self.files.lock();
        let open = files
            .get_mut(&fd)
            .ok_or_else(|| Error::Internal(format!("fd {} is not open", fd)))?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        open.file.seek(SeekFrom::Start(offset))?;
        open.file.write_all(buf)?;
        open.file.flush()?;
        Ok(())
    }

    /// Allocate the next page number of a file.
    pub fn allocate_page(&self, fd: i32) -> Result<i32> {
        let mut files = self.files.lock();
        let open = files
            .get_mut(&fd)
            .ok_or_else(|| Error::Internal(format!("fd {} is not open", fd)))?;
        let page_no = open.next_page_no;
        open.next_page_no += 1;
        Ok(page_no)
    }

    /// Set the allocation counter, used after reading a file header on open.
    pub fn set_next_page_no(&self, fd: i32, page_no: i32) {
        if let Some(open) = self.files.lock().get_mut(&fd) {
            open.next_page_no = page_no;
        }
    }

    /// Append raw bytes to the log file and force them to disk.
    pub fn write_log(&self, buf: &[u8]) -> Result<()> {
        let mut log = self.log_file.lock();
        log.seek(SeekFrom::End(0))?;
        log.write_all(buf)?;
        log.sync_data()?;
        Ok(())
    }

    /// Read up to `buf.len()` bytes of the log at `offset`. Returns the
    /// number of bytes read (0 at end of log).
    pub fn read_log(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut log = self.log_file.lock();
        log.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < buf.len() {
            let n = log.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    pub fn log_size(&self) -> Result<u64> {
        Ok(self.log_file.lock().metadata()?.len())
    }
}
