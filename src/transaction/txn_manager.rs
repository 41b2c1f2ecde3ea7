//! Transaction manager for OakDB
//!
//! Begin/commit/abort. Abort walks the transaction's undo log in reverse,
//! emitting a compensating log record for each entry before applying its
//! inverse to the heap or index. Lock release is the caller's job, after
//! commit or abort returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::RwLock;

use super::lock_manager::TxnMap;
use super::transaction::{Transaction, TransactionState, UndoEntry};
use crate::catalog::catalog::SmManager;
use crate::error::{Result, TxnId};
use crate::storage::wal::{LogManager, LogRecord, LogType};

/// Transaction manager
pub struct TransactionManager {
    next_txn_id: AtomicI32,
    txns: TxnMap,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_txn_id: AtomicI32::new(0),
            txns: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The live-transaction registry, shared with the lock manager's
    /// deadlock detector.
    pub fn txn_map(&self) -> TxnMap {
        self.txns.clone()
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.txns.read().get(&txn_id).cloned()
    }

    /// Start a transaction (allocating one if `txn` is None), log BEGIN and
    /// register it.
    pub fn begin(
        &self,
        txn: Option<Arc<Transaction>>,
        log_mgr: &LogManager,
    ) -> Result<Arc<Transaction>> {
        let txn = match txn {
            Some(txn) => txn,
            None => Arc::new(Transaction::new(
                self.next_txn_id.fetch_add(1, Ordering::SeqCst),
            )),
        };
        let mut record = LogRecord::control(txn.id(), txn.prev_lsn(), LogType::Begin);
        txn.set_prev_lsn(log_mgr.add_log_to_buffer(&mut record)?);
        txn.set_state(TransactionState::Default);
        self.txns.write().insert(txn.id(), txn.clone());
        debug!("txn {} began", txn.id());
        Ok(txn)
    }

    /// Commit: the undo log is no longer needed; log COMMIT and finish.
    pub fn commit(&self, txn: &Arc<Transaction>, log_mgr: &LogManager) -> Result<()> {
        txn.take_undo_log();
        let mut record = LogRecord::control(txn.id(), txn.prev_lsn(), LogType::Commit);
        txn.set_prev_lsn(log_mgr.add_log_to_buffer(&mut record)?);
        txn.set_state(TransactionState::Committed);
        self.txns.write().remove(&txn.id());
        debug!("txn {} committed", txn.id());
        Ok(())
    }

    /// Abort: replay the undo log in reverse, logging each compensating
    /// operation, then log ABORT. Implicit transactions roll back the same
    /// way, so a failed auto-commit statement leaves nothing behind.
    pub fn abort(&self, txn: &Arc<Transaction>, log_mgr: &LogManager, sm: &SmManager) -> Result<()> {
        let entries = txn.take_undo_log();
        for entry in entries.into_iter().rev() {
            match entry {
                UndoEntry::InsertTuple { table, rid, value } => {
                    let fh = sm.get_file(&table)?;
                    // A later compensation may already have removed it.
                    if !fh.is_record(rid) {
                        continue;
                    }
                    let mut record = LogRecord::tuple(
                        txn.id(),
                        txn.prev_lsn(),
                        LogType::Delete,
                        rid,
                        value,
                        &table,
                    );
                    let lsn = log_mgr.add_log_to_buffer(&mut record)?;
                    txn.set_prev_lsn(lsn);
                    fh.set_page_lsn(rid.page_no, lsn).ok();
                    fh.delete_record(rid)?;
                }
                UndoEntry::DeleteTuple { table, rid, value } => {
                    let fh = sm.get_file(&table)?;
                    let mut record = LogRecord::tuple(
                        txn.id(),
                        txn.prev_lsn(),
                        LogType::Insert,
                        rid,
                        value.clone(),
                        &table,
                    );
                    let lsn = log_mgr.add_log_to_buffer(&mut record)?;
                    txn.set_prev_lsn(lsn);
                    fh.set_page_lsn(rid.page_no, lsn).ok();
                    fh.insert_record_at(rid, &value).ok();
                }
                UndoEntry::UpdateTuple {
                    table,
                    rid,
                    old,
                    new,
                } => {
                    let fh = sm.get_file(&table)?;
                    if !fh.is_record(rid) {
                        continue;
                    }
                    let mut record = LogRecord::update(
                        txn.id(),
                        txn.prev_lsn(),
                        rid,
                        new,
                        old.clone(),
                        &table,
                    );
                    let lsn = log_mgr.add_log_to_buffer(&mut record)?;
                    txn.set_prev_lsn(lsn);
                    fh.set_page_lsn(rid.page_no, lsn).ok();
                    fh.update_record(rid, &old)?;
                }
                UndoEntry::InsertEntry { index, key, rid } => {
                    let ih = sm.get_index(&index)?;
                    let mut record = LogRecord::index_entry(
                        txn.id(),
                        txn.prev_lsn(),
                        LogType::DeleteEntry,
                        rid,
                        key.clone(),
                        &index,
                    );
                    let lsn = log_mgr.add_log_to_buffer(&mut record)?;
                    txn.set_prev_lsn(lsn);
                    ih.delete_entry(&key, lsn)?;
                }
                UndoEntry::DeleteEntry { index, key, rid } => {
                    let ih = sm.get_index(&index)?;
                    let mut record = LogRecord::index_entry(
                        txn.id(),
                        txn.prev_lsn(),
                        LogType::InsertEntry,
                        rid,
                        key.clone(),
                        &index,
                    );
                    let lsn = log_mgr.add_log_to_buffer(&mut record)?;
                    txn.set_prev_lsn(lsn);
                    ih.insert_entry(&key, rid, lsn)?;
                }
            }
        }

        let mut record = LogRecord::control(txn.id(), txn.prev_lsn(), LogType::Abort);
        txn.set_prev_lsn(log_mgr.add_log_to_buffer(&mut record)?);
        txn.set_state(TransactionState::Aborted);
        self.txns.write().remove(&txn.id());
        info!("txn {} aborted and rolled back", txn.id());
        Ok(())
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::catalog::ColDef;
    use crate::catalog::types::ColType;
    use crate::storage::buffer_pool::BufferPoolManager;
    use crate::storage::disk::DiskManager;
    use crate::storage::heap::Rid;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<SmManager>, Arc<LogManager>, TransactionManager) {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path()).unwrap());
        let log_mgr = Arc::new(LogManager::new(disk.clone()));
        let bpm = Arc::new(Mutex::new(BufferPoolManager::new(
            64,
            disk.clone(),
            Some(log_mgr.clone()),
        )));
        let sm = Arc::new(SmManager::open(disk, bpm).unwrap());
        (dir, sm, log_mgr, TransactionManager::new())
    }

    #[test]
    fn test_begin_assigns_ids_and_logs() {
        let (_dir, _sm, log_mgr, txn_mgr) = setup();
        let t0 = txn_mgr.begin(None, &log_mgr).unwrap();
        let t1 = txn_mgr.begin(None, &log_mgr).unwrap();
        assert_eq!(t0.id(), 0);
        assert_eq!(t1.id(), 1);
        assert!(t0.prev_lsn() >= 0);
        assert!(txn_mgr.get_transaction(0).is_some());
    }

    #[test]
    fn test_commit_clears_undo_log() {
        let (_dir, _sm, log_mgr, txn_mgr) = setup();
        let txn = txn_mgr.begin(None, &log_mgr).unwrap();
        txn.set_explicit(true);
        txn.append_undo(UndoEntry::InsertTuple {
            table: "t".to_string(),
            rid: Rid::new(1, 0),
            value: vec![0],
        });
        txn_mgr.commit(&txn, &log_mgr).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(txn.take_undo_log().is_empty());
        assert!(txn_mgr.get_transaction(txn.id()).is_none());
    }

    #[test]
    fn test_abort_rolls_back_heap() {
        let (_dir, sm, log_mgr, txn_mgr) = setup();
        sm.create_table(
            "t",
            &[ColDef {
                name: "id".to_string(),
                col_type: ColType::Int,
                len: 4,
            }],
        )
        .unwrap();
        let fh = sm.get_file("t").unwrap();

        let txn = txn_mgr.begin(None, &log_mgr).unwrap();
        txn.set_explicit(true);

        let before = fh.insert_record(&7i32.to_le_bytes()).unwrap();
        let rid = fh.insert_record(&9i32.to_le_bytes()).unwrap();
        txn.append_undo(UndoEntry::InsertTuple {
            table: "t".to_string(),
            rid,
            value: 9i32.to_le_bytes().to_vec(),
        });

        txn_mgr.abort(&txn, &log_mgr, &sm).unwrap();
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(!fh.is_record(rid));
        assert!(fh.is_record(before));
    }

    #[test]
    fn test_abort_skips_missing_rids() {
        let (_dir, sm, log_mgr, txn_mgr) = setup();
        sm.create_table(
            "t",
            &[ColDef {
                name: "id".to_string(),
                col_type: ColType::Int,
                len: 4,
            }],
        )
        .unwrap();

        let txn = txn_mgr.begin(None, &log_mgr).unwrap();
        txn.set_explicit(true);
        // Refers to a record that never existed; abort must not fail.
        txn.append_undo(UndoEntry::InsertTuple {
            table: "t".to_string(),
            rid: Rid::new(1, 3),
            value: vec![0; 4],
        });
        txn_mgr.abort(&txn, &log_mgr, &sm).unwrap();
        assert_eq!(txn.state(), TransactionState::Aborted);
    }
}
