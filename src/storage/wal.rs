//! Write-Ahead Log manager for OakDB
//!
//! Every heap or index mutation appends a log record before the change can
//! reach disk. Records are serialized into a fixed little-endian layout (a
//! 20-byte header plus a kind-specific payload) so the recovery manager can
//! deserialize identical bytes after a crash.
//!
//! This log manager writes through: `add_log_to_buffer` serializes the
//! record and hands it to the disk manager before returning, so
//! `persistent_lsn` always equals the last issued LSN.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::error::TxnId;
use crate::storage::disk::DiskManager;
use crate::storage::heap::Rid;
use crate::storage::page::{Lsn, INVALID_LSN};

/// Common log header size: {type, lsn, total_len, txn_id, prev_lsn}
pub const LOG_HEADER_SIZE: usize = 20;

/// Type of log record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    Update = 1,
    Insert = 2,
    Delete = 3,
    Begin = 4,
    Commit = 5,
    Abort = 6,
    InsertEntry = 7,
    DeleteEntry = 8,
}

impl LogType {
    pub fn from_code(code: i32) -> Result<LogType> {
        match code {
            1 => Ok(LogType::Update),
            2 => Ok(LogType::Insert),
            3 => Ok(LogType::Delete),
            4 => Ok(LogType::Begin),
            5 => Ok(LogType::Commit),
            6 => Ok(LogType::Abort),
            7 => Ok(LogType::InsertEntry),
            8 => Ok(LogType::DeleteEntry),
            _ => Err(Error::Internal(format!("unknown log type code {}", code))),
        }
    }
}

/// Kind-specific payload of a log record
#[derive(Debug, Clone, PartialEq)]
pub enum LogPayload {
    /// BEGIN / COMMIT / ABORT carry only the header
    None,
    /// INSERT / DELETE: the record image and where it lived
    Tuple {
        value: Vec<u8>,
        rid: Rid,
        table: String,
    },
    /// UPDATE: before and after images
    Update {
        old: Vec<u8>,
        new: Vec<u8>,
        rid: Rid,
        table: String,
    },
    /// INSERT_ENTRY / DELETE_ENTRY: an index key and the heap rid it maps to
    IndexEntry {
        rid: Rid,
        index: String,
        key: Vec<u8>,
    },
}

/// A single log record
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub log_type: LogType,
    pub lsn: Lsn,
    pub total_len: u32,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub payload: LogPayload,
}

impl LogRecord {
    /// BEGIN / COMMIT / ABORT
    pub fn control(txn_id: TxnId, prev_lsn: Lsn, log_type: LogType) -> Self {
        Self {
            log_type,
            lsn: INVALID_LSN,
            total_len: LOG_HEADER_SIZE as u32,
            txn_id,
            prev_lsn,
            payload: LogPayload::None,
        }
    }

    /// INSERT / DELETE
    pub fn tuple(
        txn_id: TxnId,
        prev_lsn: Lsn,
        log_type: LogType,
        rid: Rid,
        value: Vec<u8>,
        table: &str,
    ) -> Self {
        let total_len = LOG_HEADER_SIZE + 4 + value.len() + 8 + 8 + table.len();
        Self {
            log_type,
            lsn: INVALID_LSN,
            total_len: total_len as u32,
            txn_id,
            prev_lsn,
            payload: LogPayload::Tuple {
                value,
                rid,
                table: table.to_string(),
            },
        }
    }

    /// UPDATE
    pub fn update(
        txn_id: TxnId,
        prev_lsn: Lsn,
        rid: Rid,
        old: Vec<u8>,
        new: Vec<u8>,
        table: &str,
    ) -> Self {
        let total_len = LOG_HEADER_SIZE + 4 + old.len() + 4 + new.len() + 8 + 8 + table.len();
        Self {
            log_type: LogType::Update,
            lsn: INVALID_LSN,
            total_len: total_len as u32,
            txn_id,
            prev_lsn,
            payload: LogPayload::Update {
                old,
                new,
                rid,
                table: table.to_string(),
            },
        }
    }

    /// INSERT_ENTRY / DELETE_ENTRY
    pub fn index_entry(
        txn_id: TxnId,
        prev_lsn: Lsn,
        log_type: LogType,
        rid: Rid,
        key: Vec<u8>,
        index: &str,
    ) -> Self {
        let total_len = LOG_HEADER_SIZE + 8 + 8 + index.len() + 8 + key.len();
        Self {
            log_type,
            lsn: INVALID_LSN,
            total_len: total_len as u32,
            txn_id,
            prev_lsn,
            payload: LogPayload::IndexEntry {
                rid,
                index: index.to_string(),
                key,
            },
        }
    }

    /// Serialize into the on-disk layout.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_len as usize);
        buf.extend_from_slice(&(self.log_type as i32).to_le_bytes());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&self.total_len.to_le_bytes());
        buf.extend_from_slice(&self.txn_id.to_le_bytes());
        buf.extend_from_slice(&self.prev_lsn.to_le_bytes());

        match &self.payload {
            LogPayload::None => {}
            LogPayload::Tuple { value, rid, table } => {
                buf.extend_from_slice(&(value.len() as i32).to_le_bytes());
                buf.extend_from_slice(value);
                write_rid(&mut buf, *rid);
                write_bytes(&mut buf, table.as_bytes());
            }
            LogPayload::Update {
                old,
                new,
                rid,
                table,
            } => {
                buf.extend_from_slice(&(old.len() as i32).to_le_bytes());
                buf.extend_from_slice(old);
                buf.extend_from_slice(&(new.len() as i32).to_le_bytes());
                buf.extend_from_slice(new);
                write_rid(&mut buf, *rid);
                write_bytes(&mut buf, table.as_bytes());
            }
            LogPayload::IndexEntry { rid, index, key } => {
                write_rid(&mut buf, *rid);
                write_bytes(&mut buf, index.as_bytes());
                write_bytes(&mut buf, key);
            }
        }
        buf
    }

    /// Deserialize one record from the head of `src`.
    pub fn deserialize(src: &[u8]) -> Result<LogRecord> {
        if src.len() < LOG_HEADER_SIZE {
            return Err(Error::Internal("truncated log header".to_string()));
        }
        let mut r = Reader { src, pos: 0 };
        let log_type = LogType::from_code(r.read_i32()?)?;
        let lsn = r.read_i32()?;
        let total_len = r.read_i32()? as u32;
        let txn_id = r.read_i32()?;
        let prev_lsn = r.read_i32()?;
        if (total_len as usize) > src.len() {
            return Err(Error::Internal("truncated log record".to_string()));
        }

        let payload = match log_type {
            LogType::Begin | LogType::Commit | LogType::Abort => LogPayload::None,
            LogType::Insert | LogType::Delete => {
                let value_len = r.read_i32()? as usize;
                let value = r.read_bytes(value_len)?;
                let rid = r.read_rid()?;
                let table_len = r.read_u64()? as usize;
                let table = String::from_utf8_lossy(&r.read_bytes(table_len)?).into_owned();
                LogPayload::Tuple { value, rid, table }
            }
            LogType::Update => {
                let old_len = r.read_i32()? as usize;
                let old = r.read_bytes(old_len)?;
                let new_len = r.read_i32()? as usize;
                let new = r.read_bytes(new_len)?;
                let rid = r.read_rid()?;
                let table_len = r.read_u64()? as usize;
                let table = String::from_utf8_lossy(&r.read_bytes(table_len)?).into_owned();
                LogPayload::Update {
                    old,
                    new,
                    rid,
                    table,
                }
            }
            LogType::InsertEntry | LogType::DeleteEntry => {
                let rid = r.read_rid()?;
                let index_len = r.read_u64()? as usize;
                let index = String::from_utf8_lossy(&r.read_bytes(index_len)?).into_owned();
                let key_len = r.read_u64()? as usize;
                let key = r.read_bytes(key_len)?;
                LogPayload::IndexEntry { rid, index, key }
            }
        };

        Ok(LogRecord {
            log_type,
            lsn,
            total_len,
            txn_id,
            prev_lsn,
            payload,
        })
    }
}

fn write_rid(buf: &mut Vec<u8>, rid: Rid) {
    buf.extend_from_slice(&rid.page_no.to_le_bytes());
    buf.extend_from_slice(&rid.slot_no.to_le_bytes());
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(bytes);
}

struct Reader<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        if self.pos + len > self.src.len() {
            return Err(Error::Internal("truncated log record".to_string()));
        }
        let out = self.src[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }

    fn read_i32(&mut self) -> Result<i32> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_rid(&mut self) -> Result<Rid> {
        let page_no = self.read_i32()?;
        let slot_no = self.read_i32()?;
        Ok(Rid { page_no, slot_no })
    }
}

/// Manages the write-ahead log
pub struct LogManager {
    disk: Arc<DiskManager>,
    /// Serializes LSN assignment with the append itself
    latch: Mutex<()>,
    /// Next LSN to issue
    global_lsn: AtomicI32,
    /// Highest LSN known durable
    persistent_lsn: AtomicI32,
}

impl LogManager {
    pub fn new(disk: Arc<DiskManager>) -> Self {
        Self {
            disk,
            latch: Mutex::new(()),
            global_lsn: AtomicI32::new(0),
            persistent_lsn: AtomicI32::new(INVALID_LSN),
        }
    }

    /// Assign the record an LSN, serialize it, and append it durably.
    pub fn add_log_to_buffer(&self, record: &mut LogRecord) -> Result<Lsn> {
        let _guard = self.latch.lock();
        let lsn = self.global_lsn.fetch_add(1, Ordering::SeqCst);
        record.lsn = lsn;
        let buf = record.serialize();
        self.disk.write_log(&buf)?;
        self.persistent_lsn.store(lsn, Ordering::SeqCst);
        Ok(lsn)
    }

    pub fn persistent_lsn(&self) -> Lsn {
        self.persistent_lsn.load(Ordering::SeqCst)
    }

    pub fn next_lsn(&self) -> Lsn {
        self.global_lsn.load(Ordering::SeqCst)
    }

    /// Resume LSN issuance after recovery has replayed the existing log.
    pub fn reset_lsn(&self, next_lsn: Lsn) {
        self.global_lsn.store(next_lsn, Ordering::SeqCst);
        self.persistent_lsn.store(next_lsn - 1, Ordering::SeqCst);
    }

    /// Force the log to disk. Write-through appends make this a no-op, but
    /// the buffer pool still calls it before evicting a dirty page.
    pub fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_control_record_round_trip() {
        let rec = LogRecord::control(3, 11, LogType::Commit);
        let buf = rec.serialize();
        assert_eq!(buf.len(), LOG_HEADER_SIZE);
        let back = LogRecord::deserialize(&buf).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_tuple_record_round_trip() {
        let rid = Rid {
            page_no: 2,
            slot_no: 5,
        };
        let rec = LogRecord::tuple(1, -1, LogType::Insert, rid, vec![9, 8, 7], "orders");
        let buf = rec.serialize();
        assert_eq!(buf.len(), rec.total_len as usize);
        let back = LogRecord::deserialize(&buf).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_update_record_round_trip() {
        let rid = Rid {
            page_no: 1,
            slot_no: 0,
        };
        let rec = LogRecord::update(4, 9, rid, vec![1, 2], vec![3, 4], "t");
        let back = LogRecord::deserialize(&rec.serialize()).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_index_record_round_trip() {
        let rid = Rid {
            page_no: 7,
            slot_no: 3,
        };
        let rec = LogRecord::index_entry(2, 0, LogType::DeleteEntry, rid, vec![0xaa; 12], "t_id");
        let back = LogRecord::deserialize(&rec.serialize()).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_lsn_issue_and_durability() {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path()).unwrap());
        let log_mgr = LogManager::new(disk.clone());

        let mut a = LogRecord::control(1, INVALID_LSN, LogType::Begin);
        let mut b = LogRecord::control(1, 0, LogType::Commit);
        assert_eq!(log_mgr.add_log_to_buffer(&mut a).unwrap(), 0);
        assert_eq!(log_mgr.add_log_to_buffer(&mut b).unwrap(), 1);
        assert_eq!(log_mgr.persistent_lsn(), 1);

        // Both records are on disk, back to back.
        let size = disk.log_size().unwrap() as usize;
        assert_eq!(size, 2 * LOG_HEADER_SIZE);
        let mut buf = vec![0u8; size];
        disk.read_log(&mut buf, 0).unwrap();
        let first = LogRecord::deserialize(&buf).unwrap();
        assert_eq!(first.log_type, LogType::Begin);
        let second = LogRecord::deserialize(&buf[first.total_len as usize..]).unwrap();
        assert_eq!(second.log_type, LogType::Commit);
        assert_eq!(second.prev_lsn, 0);
    }
}
