//! Crash recovery for OakDB
//!
//! Runs at startup, before any client statement. A single forward pass
//! fuses analysis and redo: it replays every record into the heap and
//! index files while rebuilding the active-transaction table and an
//! LSN-to-offset map. Undo then walks each loser's prev_lsn chain
//! backwards, applying inverses. No compensation records are written;
//! undo is idempotent, so a crash during undo simply reruns it.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;

use crate::catalog::catalog::SmManager;
use crate::error::{Result, TxnId};
use crate::storage::disk::DiskManager;
use crate::storage::page::{Lsn, INVALID_LSN};
use crate::storage::wal::{LogManager, LogPayload, LogRecord, LogType, LOG_HEADER_SIZE};

/// Recovery manager
pub struct RecoveryManager {
    disk: Arc<DiskManager>,
    log_mgr: Arc<LogManager>,
}

impl RecoveryManager {
    pub fn new(disk: Arc<DiskManager>, log_mgr: Arc<LogManager>) -> Self {
        Self { disk, log_mgr }
    }

    /// Analyze + redo + undo over the whole log.
    pub fn recover(&self, sm: &SmManager) -> Result<()> {
        let size = self.disk.log_size()? as usize;
        if size == 0 {
            return Ok(());
        }
        let mut buf = vec![0u8; size];
        self.disk.read_log(&mut buf, 0)?;

        // Forward pass: redo everything, tracking per-transaction last LSNs
        // and where each record sits in the file.
        let mut lsn_offsets: HashMap<Lsn, usize> = HashMap::new();
        let mut active_txns: HashMap<TxnId, Lsn> = HashMap::new();
        let mut max_lsn = INVALID_LSN;
        let mut offset = 0;
        let mut replayed = 0usize;

        while offset + LOG_HEADER_SIZE <= size {
            let record = match LogRecord::deserialize(&buf[offset..]) {
                Ok(record) => record,
                // A torn tail from the crash ends the scan.
                Err(_) => break,
            };
            if record.total_len as usize == 0 {
                break;
            }
            lsn_offsets.insert(record.lsn, offset);
            max_lsn = max_lsn.max(record.lsn);

            match record.log_type {
                LogType::Commit | LogType::Abort => {
                    active_txns.remove(&record.txn_id);
                }
                LogType::Begin => {
                    active_txns.insert(record.txn_id, record.lsn);
                }
                _ => {
                    active_txns.insert(record.txn_id, record.lsn);
                    self.redo(sm, &record)?;
                    replayed += 1;
                }
            }
            offset += record.total_len as usize;
        }

        // Undo pass: youngest loser first, walking prev_lsn chains.
        let mut losers: Vec<(TxnId, Lsn)> = active_txns.into_iter().collect();
        losers.sort_by(|a, b| b.0.cmp(&a.0));
        let num_losers = losers.len();

        for (_txn_id, last_lsn) in losers {
            let mut lsn = last_lsn;
            loop {
                let offset = match lsn_offsets.get(&lsn) {
                    Some(&offset) => offset,
                    None => break,
                };
                let record = LogRecord::deserialize(&buf[offset..])?;
                if record.log_type == LogType::Begin {
                    break;
                }
                self.undo(sm, &record)?;
                if record.prev_lsn == INVALID_LSN {
                    break;
                }
                lsn = record.prev_lsn;
            }
        }

        self.log_mgr.reset_lsn(max_lsn + 1);
        info!(
            "recovery finished: {} records replayed, {} loser transaction(s) undone",
            replayed, num_losers
        );
        Ok(())
    }

    /// Redo one record. Files named by records for since-dropped tables or
    /// indexes no longer exist and are skipped.
    fn redo(&self, sm: &SmManager, record: &LogRecord) -> Result<()> {
        match (&record.log_type, &record.payload) {
            (LogType::Insert, LogPayload::Tuple { value, rid, table }) => {
                let Ok(fh) = sm.get_file(table) else {
                    return Ok(());
                };
                // Skip if this effect already reached disk; fall back to
                // any free slot when the original rid is unavailable.
                match fh.get_record(*rid) {
                    Ok(existing) if existing == *value => {}
                    Ok(_) => {
                        fh.insert_record(value)?;
                    }
                    Err(_) => {
                        if fh.insert_record_at(*rid, value).is_err() {
                            fh.insert_record(value)?;
                        }
                    }
                }
            }
            (LogType::Delete, LogPayload::Tuple { rid, table, .. }) => {
                let Ok(fh) = sm.get_file(table) else {
                    return Ok(());
                };
                fh.delete_record(*rid).ok();
            }
            (LogType::Update, LogPayload::Update { new, rid, table, .. }) => {
                let Ok(fh) = sm.get_file(table) else {
                    return Ok(());
                };
                fh.update_record(*rid, new).ok();
            }
            (LogType::InsertEntry, LogPayload::IndexEntry { rid, index, key }) => {
                let Ok(ih) = sm.get_index(index) else {
                    return Ok(());
                };
                ih.insert_entry(key, *rid, INVALID_LSN)?;
            }
            (LogType::DeleteEntry, LogPayload::IndexEntry { index, key, .. }) => {
                let Ok(ih) = sm.get_index(index) else {
                    return Ok(());
                };
                ih.delete_entry(key, INVALID_LSN)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn undo(&self, sm: &SmManager, record: &LogRecord) -> Result<()> {
        match (&record.log_type, &record.payload) {
            (LogType::Insert, LogPayload::Tuple { rid, table, .. }) => {
                let Ok(fh) = sm.get_file(table) else {
                    return Ok(());
                };
                fh.delete_record(*rid).ok();
            }
            (LogType::Delete, LogPayload::Tuple { value, rid, table }) => {
                let Ok(fh) = sm.get_file(table) else {
                    return Ok(());
                };
                fh.insert_record_at(*rid, value).ok();
            }
            (LogType::Update, LogPayload::Update { old, rid, table, .. }) => {
                let Ok(fh) = sm.get_file(table) else {
                    return Ok(());
                };
                fh.update_record(*rid, old).ok();
            }
            (LogType::InsertEntry, LogPayload::IndexEntry { index, key, .. }) => {
                let Ok(ih) = sm.get_index(index) else {
                    return Ok(());
                };
                ih.delete_entry(key, INVALID_LSN)?;
            }
            (LogType::DeleteEntry, LogPayload::IndexEntry { rid, index, key }) => {
                let Ok(ih) = sm.get_index(index) else {
                    return Ok(());
                };
                ih.insert_entry(key, *rid, INVALID_LSN)?;
            }
            _ => {}
        }
        Ok(())
    }
}
