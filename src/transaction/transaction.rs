//! Transaction state for OakDB
//!
//! A transaction tracks its 2PL lock set and an append-only undo log of
//! heap and index side effects. The undo log is consumed in reverse on
//! abort, so heap and index compensations replay in exactly the opposite
//! of execution order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::TxnId;
use crate::storage::heap::Rid;
use crate::storage::page::{Lsn, INVALID_LSN};

/// Sentinel for "no transaction"
pub const INVALID_TXN_ID: TxnId = -1;

/// Lifecycle states of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Default,
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Granularity of a lockable object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockDataType {
    Table,
    Record,
}

/// Unique identifier of a lockable object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockDataId {
    pub fd: i32,
    pub rid: Rid,
    pub kind: LockDataType,
}

impl LockDataId {
    /// Table-level lock on the file `fd`.
    pub fn table(fd: i32) -> Self {
        Self {
            fd,
            rid: Rid::new(-1, -1),
            kind: LockDataType::Table,
        }
    }
}

/// One recorded side effect, with enough state to invert it
#[derive(Debug, Clone)]
pub enum UndoEntry {
    InsertTuple {
        table: String,
        rid: Rid,
        value: Vec<u8>,
    },
    DeleteTuple {
        table: String,
        rid: Rid,
        value: Vec<u8>,
    },
    UpdateTuple {
        table: String,
        rid: Rid,
        old: Vec<u8>,
        new: Vec<u8>,
    },
    InsertEntry {
        index: String,
        key: Vec<u8>,
        rid: Rid,
    },
    DeleteEntry {
        index: String,
        key: Vec<u8>,
        rid: Rid,
    },
}

/// A transaction
pub struct Transaction {
    id: TxnId,
    /// Guarded separately so the deadlock detector can flip it to ABORTED
    /// while the owner is blocked elsewhere.
    state: Mutex<TransactionState>,
    /// LSN of this transaction's most recent log record
    prev_lsn: Mutex<Lsn>,
    /// True inside an explicit begin ... commit/abort block
    explicit_mode: AtomicBool,
    /// Locks currently held
    lock_set: Mutex<HashSet<LockDataId>>,
    /// Undo entries in execution order
    undo_log: Mutex<Vec<UndoEntry>>,
}

impl Transaction {
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: Mutex::new(TransactionState::Default),
            prev_lsn: Mutex::new(INVALID_LSN),
            explicit_mode: AtomicBool::new(false),
            lock_set: Mutex::new(HashSet::new()),
            undo_log: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn prev_lsn(&self) -> Lsn {
        *self.prev_lsn.lock()
    }

    pub fn set_prev_lsn(&self, lsn: Lsn) {
        *self.prev_lsn.lock() = lsn;
    }

    pub fn is_explicit(&self) -> bool {
        self.explicit_mode.load(Ordering::SeqCst)
    }

    pub fn set_explicit(&self, explicit: bool) {
        self.explicit_mode.store(explicit, Ordering::SeqCst);
    }

    pub fn add_lock(&self, id: LockDataId) {
        self.lock_set.lock().insert(id);
    }

    pub fn remove_lock(&self, id: &LockDataId) {
        self.lock_set.lock().remove(id);
    }

    pub fn holds_lock(&self, id: &LockDataId) -> bool {
        self.lock_set.lock().contains(id)
    }

    pub fn lock_set(&self) -> Vec<LockDataId> {
        self.lock_set.lock().iter().copied().collect()
    }

    pub fn clear_lock_set(&self) {
        self.lock_set.lock().clear();
    }

    pub fn append_undo(&self, entry: UndoEntry) {
        self.undo_log.lock().push(entry);
    }

    /// Drain the undo log, leaving it empty.
    pub fn take_undo_log(&self) -> Vec<UndoEntry> {
        std::mem::take(&mut *self.undo_log.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let txn = Transaction::new(1);
        assert_eq!(txn.state(), TransactionState::Default);
        txn.set_state(TransactionState::Growing);
        assert_eq!(txn.state(), TransactionState::Growing);
        txn.set_state(TransactionState::Aborted);
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_lock_set() {
        let txn = Transaction::new(2);
        let a = LockDataId::table(3);
        let b = LockDataId::table(4);
        txn.add_lock(a);
        txn.add_lock(b);
        assert!(txn.holds_lock(&a));
        txn.remove_lock(&a);
        assert!(!txn.holds_lock(&a));
        assert_eq!(txn.lock_set().len(), 1);
        txn.clear_lock_set();
        assert!(txn.lock_set().is_empty());
    }

    #[test]
    fn test_undo_log_order() {
        let txn = Transaction::new(3);
        txn.append_undo(UndoEntry::InsertTuple {
            table: "t".to_string(),
            rid: Rid::new(1, 0),
            value: vec![1],
        });
        txn.append_undo(UndoEntry::InsertEntry {
            index: "t_id".to_string(),
            key: vec![2],
            rid: Rid::new(1, 0),
        });
        let log = txn.take_undo_log();
        assert_eq!(log.len(), 2);
        assert!(matches!(log[0], UndoEntry::InsertTuple { .. }));
        assert!(matches!(log[1], UndoEntry::InsertEntry { .. }));
        assert!(txn.take_undo_log().is_empty());
    }
}
