//! Database handle and sessions for OakDB
//!
//! `Db` owns the process-wide singletons in their required construction
//! order: disk manager, log manager, buffer pool, catalog, recovery,
//! transaction manager, lock manager. Teardown reverses the order, with
//! the log forced before the buffer pool drains.
//!
//! A `Session` is the per-client statement loop: it parses, manages the
//! transaction lifecycle (explicit blocks and auto-commit), and hands
//! statements to the execution engine.

use std::path::Path;
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::catalog::catalog::SmManager;
use crate::error::{Error, Result};
use crate::executor::{Context, ExecutionEngine, QueryResult};
use crate::recovery::RecoveryManager;
use crate::sql::ast::Statement;
use crate::sql::parser::Parser;
use crate::storage::buffer_pool::BufferPoolManager;
use crate::storage::disk::DiskManager;
use crate::storage::wal::LogManager;
use crate::transaction::lock_manager::LockManager;
use crate::transaction::transaction::{Transaction, TransactionState};
use crate::transaction::txn_manager::TransactionManager;

/// Buffer pool frames
const BUFFER_POOL_SIZE: usize = 1024;

/// A single-node OakDB database
pub struct Db {
    bpm: Arc<Mutex<BufferPoolManager>>,
    log_mgr: Arc<LogManager>,
    sm: Arc<SmManager>,
    txn_mgr: Arc<TransactionManager>,
    lock_mgr: Arc<LockManager>,
    engine: ExecutionEngine,
}

impl Db {
    /// Open (or create) the database under `dir`, running crash recovery
    /// before anything else may touch it.
    pub fn open(dir: impl AsRef<Path>) -> Result<Arc<Db>> {
        let disk = Arc::new(DiskManager::new(dir.as_ref())?);
        let log_mgr = Arc::new(LogManager::new(disk.clone()));
        let bpm = Arc::new(Mutex::new(BufferPoolManager::new(
            BUFFER_POOL_SIZE,
            disk.clone(),
            Some(log_mgr.clone()),
        )));
        let sm = Arc::new(SmManager::open(disk.clone(), bpm.clone())?);

        let recovery = RecoveryManager::new(disk, log_mgr.clone());
        recovery.recover(&sm)?;

        let txn_mgr = Arc::new(TransactionManager::new());
        let lock_mgr = Arc::new(LockManager::new(txn_mgr.txn_map()));

        Ok(Arc::new(Db {
            bpm,
            log_mgr,
            sm,
            txn_mgr,
            lock_mgr,
            engine: ExecutionEngine::new(),
        }))
    }

    pub fn session(self: &Arc<Self>) -> Session {
        Session {
            db: self.clone(),
            txn: None,
        }
    }

    pub fn sm(&self) -> Arc<SmManager> {
        self.sm.clone()
    }

    pub fn log_mgr(&self) -> Arc<LogManager> {
        self.log_mgr.clone()
    }

    pub fn lock_mgr(&self) -> Arc<LockManager> {
        self.lock_mgr.clone()
    }

    pub fn txn_mgr(&self) -> Arc<TransactionManager> {
        self.txn_mgr.clone()
    }

    /// Flush everything and stop background work. Safe to call once at
    /// shutdown; dropping without closing simulates a crash, which
    /// recovery handles at the next open.
    pub fn close(&self) -> Result<()> {
        self.lock_mgr.stop_deadlock_detection();
        self.log_mgr.flush()?;
        self.sm.close()?;
        self.bpm.lock().flush_all()?;
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.lock_mgr.stop_deadlock_detection();
    }
}

/// Per-client session holding the active transaction, if any
pub struct Session {
    db: Arc<Db>,
    txn: Option<Arc<Transaction>>,
}

impl Session {
    /// Parse and execute one statement.
    pub fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        let stmt = Parser::new(sql)?.parse()?;
        match stmt {
            Statement::Begin => self.begin(),
            Statement::Commit => self.commit(),
            Statement::Abort | Statement::Rollback => self.rollback(),
            Statement::Exit => Ok(QueryResult::with_message("bye")),
            stmt => self.run_statement(stmt),
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    fn context(&self, txn: Arc<Transaction>) -> Context {
        Context {
            txn,
            sm: self.db.sm.clone(),
            log_mgr: self.db.log_mgr.clone(),
            lock_mgr: self.db.lock_mgr.clone(),
        }
    }

    fn begin(&mut self) -> Result<QueryResult> {
        if self.txn.is_some() {
            return Err(Error::Internal(
                "a transaction is already in progress".to_string(),
            ));
        }
        let txn = self.db.txn_mgr.begin(None, &self.db.log_mgr)?;
        txn.set_explicit(true);
        txn.set_state(TransactionState::Growing);
        self.db.lock_mgr.start_deadlock_detection();
        let id = txn.id();
        self.txn = Some(txn);
        Ok(QueryResult::with_message(format!("Transaction {} started", id)))
    }

    fn commit(&mut self) -> Result<QueryResult> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| Error::Internal("no transaction in progress".to_string()))?;
        // Committing an aborted transaction rolls it back instead.
        if txn.state() == TransactionState::Aborted {
            self.db.txn_mgr.abort(&txn, &self.db.log_mgr, &self.db.sm)?;
            self.release_locks(&txn)?;
            return Ok(QueryResult::with_message(format!(
                "Transaction {} was aborted, rolled back",
                txn.id()
            )));
        }
        txn.set_state(TransactionState::Shrinking);
        self.db.txn_mgr.commit(&txn, &self.db.log_mgr)?;
        self.release_locks(&txn)?;
        Ok(QueryResult::with_message(format!(
            "Transaction {} committed",
            txn.id()
        )))
    }

    fn rollback(&mut self) -> Result<QueryResult> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| Error::Internal("no transaction in progress".to_string()))?;
        self.db.txn_mgr.abort(&txn, &self.db.log_mgr, &self.db.sm)?;
        self.release_locks(&txn)?;
        Ok(QueryResult::with_message(format!(
            "Transaction {} rolled back",
            txn.id()
        )))
    }

    fn release_locks(&self, txn: &Arc<Transaction>) -> Result<()> {
        for lock in txn.lock_set() {
            self.db.lock_mgr.unlock(txn, lock)?;
        }
        txn.clear_lock_set();
        Ok(())
    }

    fn run_statement(&mut self, stmt: Statement) -> Result<QueryResult> {
        let (txn, implicit) = match &self.txn {
            Some(txn) => {
                if txn.state() == TransactionState::Aborted {
                    return Err(Error::Internal(
                        "current transaction is aborted, run abort or rollback".to_string(),
                    ));
                }
                (txn.clone(), false)
            }
            None => (self.db.txn_mgr.begin(None, &self.db.log_mgr)?, true),
        };

        let ctx = self.context(txn.clone());
        match self.db.engine.execute(stmt, &ctx) {
            Ok(result) => {
                if implicit {
                    self.db.txn_mgr.commit(&txn, &self.db.log_mgr)?;
                }
                Ok(result)
            }
            Err(err) => {
                if implicit {
                    // An implicit transaction is automatically rolled back.
                    if let Err(abort_err) =
                        self.db.txn_mgr.abort(&txn, &self.db.log_mgr, &self.db.sm)
                    {
                        warn!("rollback of implicit txn failed: {}", abort_err);
                    }
                }
                // An explicit transaction stays ABORTED (lock/deadlock
                // errors) or alive (statement-level errors) until the
                // client decides.
                Err(err)
            }
        }
    }
}
