//! DML executors: INSERT, DELETE, UPDATE
//!
//! Each executor acquires the table X lock (explicit transactions only)
//! and follows write-ahead order for every side effect: append the log
//! record, stamp the target page with the returned LSN, then apply the
//! mutation. Undo entries record each applied effect so abort can replay
//! the inverses in reverse order.

use std::sync::Arc;

use super::executor::lock_table;
use super::Context;
use crate::catalog::schema::{IndexMeta, TabMeta};
use crate::catalog::types::{ColType, Value};
use crate::error::{Error, Result};
use crate::storage::btree::IxIndexHandle;
use crate::storage::heap::{Rid, RmFileHandle};
use crate::storage::page::Lsn;
use crate::storage::wal::{LogRecord, LogType};
use crate::transaction::lock_manager::LockMode;
use crate::transaction::transaction::UndoEntry;

fn append_log(ctx: &Context, mut record: LogRecord) -> Result<Lsn> {
    let lsn = ctx.log_mgr.add_log_to_buffer(&mut record)?;
    ctx.txn.set_prev_lsn(lsn);
    Ok(lsn)
}

fn open_indexes(ctx: &Context, tab: &TabMeta) -> Result<Vec<Arc<IxIndexHandle>>> {
    tab.indexes
        .iter()
        .map(|meta| ctx.sm.get_index(&meta.index_name()))
        .collect()
}

/// INSERT INTO t VALUES (...)
pub struct InsertExecutor {
    ctx: Context,
    tab: TabMeta,
    fh: Arc<RmFileHandle>,
    values: Vec<Value>,
    rid: Rid,
}

impl InsertExecutor {
    pub fn new(ctx: Context, tab_name: &str, values: Vec<Value>) -> Result<Self> {
        let tab = ctx.sm.get_table(tab_name)?;
        if values.len() != tab.cols.len() {
            return Err(Error::InvalidValueCount(tab.cols.len(), values.len()));
        }
        let fh = ctx.sm.get_file(tab_name)?;
        Ok(Self {
            ctx,
            tab,
            fh,
            values,
            rid: Rid::new(-1, -1),
        })
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }

    /// Insert the row, returning its rid.
    pub fn run(&mut self) -> Result<Rid> {
        lock_table(&self.ctx, self.fh.fd(), LockMode::Exclusive)?;

        // Bind values to the declared column types.
        let mut record = vec![0u8; self.tab.record_size()];
        for (col, value) in self.tab.cols.iter().zip(self.values.iter()) {
            let bound = value.coerce_to(col.col_type, col.len)?;
            record[col.offset..col.offset + col.len]
                .copy_from_slice(&bound.to_bytes(col.len)?);
        }

        // Uniqueness against every index before anything is mutated.
        let ihs = open_indexes(&self.ctx, &self.tab)?;
        for (meta, ih) in self.tab.indexes.iter().zip(ihs.iter()) {
            let key = meta.build_key(&record);
            if ih.get_value(&key)?.is_some() {
                return Err(Error::Internal(format!(
                    "uniqueness check failed on index '{}'",
                    meta.index_name()
                )));
            }
        }

        // The record manager pre-assigns the slot so the INSERT log can be
        // appended before the heap page changes.
        let rid = self.fh.next_free_rid()?;
        self.rid = rid;
        let lsn = append_log(
            &self.ctx,
            LogRecord::tuple(
                self.ctx.txn.id(),
                self.ctx.txn.prev_lsn(),
                LogType::Insert,
                rid,
                record.clone(),
                &self.tab.name,
            ),
        )?;
        self.fh.set_page_lsn(rid.page_no, lsn)?;
        self.fh.insert_record_at(rid, &record)?;
        self.ctx.txn.append_undo(UndoEntry::InsertTuple {
            table: self.tab.name.clone(),
            rid,
            value: record.clone(),
        });

        for (meta, ih) in self.tab.indexes.iter().zip(ihs.iter()) {
            let key = meta.build_key(&record);
            let lsn = append_log(
                &self.ctx,
                LogRecord::index_entry(
                    self.ctx.txn.id(),
                    self.ctx.txn.prev_lsn(),
                    LogType::InsertEntry,
                    rid,
                    key.clone(),
                    &meta.index_name(),
                ),
            )?;
            if ih.insert_entry(&key, rid, lsn)? {
                self.ctx.txn.append_undo(UndoEntry::InsertEntry {
                    index: meta.index_name(),
                    key,
                    rid,
                });
            }
        }
        Ok(rid)
    }
}

/// DELETE FROM t [WHERE ...], over a pre-selected rid set
pub struct DeleteExecutor {
    ctx: Context,
    tab: TabMeta,
    fh: Arc<RmFileHandle>,
    rids: Vec<Rid>,
}

impl DeleteExecutor {
    pub fn new(ctx: Context, tab_name: &str, rids: Vec<Rid>) -> Result<Self> {
        let tab = ctx.sm.get_table(tab_name)?;
        let fh = ctx.sm.get_file(tab_name)?;
        Ok(Self { ctx, tab, fh, rids })
    }

    /// Delete every selected row, returning the count.
    pub fn run(&mut self) -> Result<usize> {
        lock_table(&self.ctx, self.fh.fd(), LockMode::Exclusive)?;
        let ihs = open_indexes(&self.ctx, &self.tab)?;

        for &rid in &self.rids {
            let record = self.fh.get_record(rid)?;
            let lsn = append_log(
                &self.ctx,
                LogRecord::tuple(
                    self.ctx.txn.id(),
                    self.ctx.txn.prev_lsn(),
                    LogType::Delete,
                    rid,
                    record.clone(),
                    &self.tab.name,
                ),
            )?;
            self.fh.set_page_lsn(rid.page_no, lsn)?;

            for (meta, ih) in self.tab.indexes.iter().zip(ihs.iter()) {
                let key = meta.build_key(&record);
                let lsn = append_log(
                    &self.ctx,
                    LogRecord::index_entry(
                        self.ctx.txn.id(),
                        self.ctx.txn.prev_lsn(),
                        LogType::DeleteEntry,
                        rid,
                        key.clone(),
                        &meta.index_name(),
                    ),
                )?;
                if ih.delete_entry(&key, lsn)? {
                    self.ctx.txn.append_undo(UndoEntry::DeleteEntry {
                        index: meta.index_name(),
                        key,
                        rid,
                    });
                }
            }

            self.fh.delete_record(rid)?;
            self.ctx.txn.append_undo(UndoEntry::DeleteTuple {
                table: self.tab.name.clone(),
                rid,
                value: record,
            });
        }
        Ok(self.rids.len())
    }
}

/// A bound SET clause
#[derive(Debug, Clone)]
pub struct SetClause {
    pub col_name: String,
    pub rhs: Value,
    pub is_expr: bool,
    pub add: bool,
}

/// UPDATE t SET ... [WHERE ...], over a pre-selected rid set
pub struct UpdateExecutor {
    ctx: Context,
    tab: TabMeta,
    fh: Arc<RmFileHandle>,
    rids: Vec<Rid>,
    set_clauses: Vec<SetClause>,
}

impl UpdateExecutor {
    pub fn new(
        ctx: Context,
        tab_name: &str,
        set_clauses: Vec<SetClause>,
        rids: Vec<Rid>,
    ) -> Result<Self> {
        let tab = ctx.sm.get_table(tab_name)?;
        let fh = ctx.sm.get_file(tab_name)?;
        let mut bound = Vec::with_capacity(set_clauses.len());
        for clause in set_clauses {
            let col = tab.get_col(&clause.col_name)?;
            if clause.is_expr {
                // col = col +/- value arithmetic is numeric only.
                if !matches!(col.col_type, ColType::Int | ColType::BigInt | ColType::Float) {
                    return Err(Error::IncompatibleType {
                        lhs: col.col_type.to_string(),
                        rhs: clause.rhs.col_type().to_string(),
                    });
                }
                bound.push(SetClause {
                    rhs: clause.rhs.coerce_to(col.col_type, col.len)?,
                    ..clause
                });
            } else {
                bound.push(SetClause {
                    rhs: clause.rhs.coerce_to(col.col_type, col.len)?,
                    ..clause
                });
            }
        }
        Ok(Self {
            ctx,
            tab,
            fh,
            rids,
            set_clauses: bound,
        })
    }

    /// Apply the set list to a copy of `record`.
    fn apply_set(&self, record: &[u8]) -> Result<Vec<u8>> {
        let mut out = record.to_vec();
        for clause in &self.set_clauses {
            let col = self.tab.get_col(&clause.col_name)?;
            let slot = col.offset..col.offset + col.len;
            if clause.is_expr {
                let current = Value::from_bytes(col.col_type, &out[slot.clone()]);
                let next = match (current, &clause.rhs) {
                    (Value::Int(a), Value::Int(b)) => {
                        Value::Int(if clause.add { a + b } else { a - b })
                    }
                    (Value::BigInt(a), Value::BigInt(b)) => {
                        Value::BigInt(if clause.add { a + b } else { a - b })
                    }
                    (Value::Float(a), Value::Float(b)) => {
                        Value::Float(if clause.add { a + b } else { a - b })
                    }
                    (a, b) => {
                        return Err(Error::IncompatibleType {
                            lhs: a.col_type().to_string(),
                            rhs: b.col_type().to_string(),
                        })
                    }
                };
                out[slot].copy_from_slice(&next.to_bytes(col.len)?);
            } else {
                out[slot].copy_from_slice(&clause.rhs.to_bytes(col.len)?);
            }
        }
        Ok(out)
    }

    /// Update every selected row, returning the count.
    pub fn run(&mut self) -> Result<usize> {
        lock_table(&self.ctx, self.fh.fd(), LockMode::Exclusive)?;

        let set_names: Vec<String> = self
            .set_clauses
            .iter()
            .map(|c| c.col_name.clone())
            .collect();
        let touched: Vec<(IndexMeta, Arc<IxIndexHandle>)> = {
            let mut out = Vec::new();
            for meta in &self.tab.indexes {
                if meta.touches_columns(&set_names) {
                    out.push((meta.clone(), self.ctx.sm.get_index(&meta.index_name())?));
                }
            }
            out
        };

        // First pass: no new key may collide with a pre-existing key of
        // another row, nor with another new key from this same update.
        for (meta, ih) in &touched {
            let mut new_keys: Vec<Vec<u8>> = Vec::with_capacity(self.rids.len());
            for &rid in &self.rids {
                let record = self.fh.get_record(rid)?;
                let new_key = meta.build_key(&self.apply_set(&record)?);
                if let Some(found) = ih.get_value(&new_key)? {
                    if found != rid {
                        return Err(Error::Internal(format!(
                            "uniqueness check failed on index '{}'",
                            meta.index_name()
                        )));
                    }
                }
                if new_keys.contains(&new_key) {
                    return Err(Error::Internal(format!(
                        "uniqueness check failed on index '{}'",
                        meta.index_name()
                    )));
                }
                new_keys.push(new_key);
            }
        }

        // Second pass: log + remove the old index entries, log + rewrite
        // the slot in place, log + insert the new index entries.
        for &rid in &self.rids {
            let old_record = self.fh.get_record(rid)?;
            let new_record = self.apply_set(&old_record)?;

            for (meta, ih) in &touched {
                let old_key = meta.build_key(&old_record);
                let lsn = append_log(
                    &self.ctx,
                    LogRecord::index_entry(
                        self.ctx.txn.id(),
                        self.ctx.txn.prev_lsn(),
                        LogType::DeleteEntry,
                        rid,
                        old_key.clone(),
                        &meta.index_name(),
                    ),
                )?;
                if ih.delete_entry(&old_key, lsn)? {
                    self.ctx.txn.append_undo(UndoEntry::DeleteEntry {
                        index: meta.index_name(),
                        key: old_key,
                        rid,
                    });
                }
            }

            let lsn = append_log(
                &self.ctx,
                LogRecord::update(
                    self.ctx.txn.id(),
                    self.ctx.txn.prev_lsn(),
                    rid,
                    old_record.clone(),
                    new_record.clone(),
                    &self.tab.name,
                ),
            )?;
            self.fh.set_page_lsn(rid.page_no, lsn)?;
            self.fh.update_record(rid, &new_record)?;
            self.ctx.txn.append_undo(UndoEntry::UpdateTuple {
                table: self.tab.name.clone(),
                rid,
                old: old_record,
                new: new_record.clone(),
            });

            for (meta, ih) in &touched {
                let new_key = meta.build_key(&new_record);
                let lsn = append_log(
                    &self.ctx,
                    LogRecord::index_entry(
                        self.ctx.txn.id(),
                        self.ctx.txn.prev_lsn(),
                        LogType::InsertEntry,
                        rid,
                        new_key.clone(),
                        &meta.index_name(),
                    ),
                )?;
                if ih.insert_entry(&new_key, rid, lsn)? {
                    self.ctx.txn.append_undo(UndoEntry::InsertEntry {
                        index: meta.index_name(),
                        key: new_key,
                        rid,
                    });
                }
            }
        }
        Ok(self.rids.len())
    }
}
