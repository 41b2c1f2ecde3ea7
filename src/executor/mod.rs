//! Query execution module
//!
//! Volcano-style executors plus the engine that builds and drives them.

pub mod dml;
pub mod executor;
pub mod join;
pub mod planner;

use std::cmp::Ordering;
use std::sync::Arc;

use crate::catalog::catalog::SmManager;
use crate::catalog::schema::{ColMeta, TabCol};
use crate::catalog::types::Value;
use crate::error::{Error, Result};
use crate::sql::ast::CompOp;
use crate::storage::wal::LogManager;
use crate::transaction::lock_manager::LockManager;
use crate::transaction::transaction::Transaction;

pub use dml::{DeleteExecutor, InsertExecutor, UpdateExecutor};
pub use executor::{Executor, IndexScanExecutor, SeqScanExecutor};
pub use join::{AggExecutor, NestedLoopJoinExecutor, ProjectionExecutor, SortExecutor};
pub use planner::ExecutionEngine;

/// Per-session execution context threaded through every executor
#[derive(Clone)]
pub struct Context {
    pub txn: Arc<Transaction>,
    pub sm: Arc<SmManager>,
    pub log_mgr: Arc<LogManager>,
    pub lock_mgr: Arc<LockManager>,
}

/// A resolved `col op {col | value}` predicate
#[derive(Debug, Clone)]
pub struct Condition {
    pub lhs: TabCol,
    pub op: CompOp,
    /// Right-hand column, if the condition compares two columns
    pub rhs_col: Option<TabCol>,
    /// Right-hand value; set at bind time, or by `feed` from the outer side
    /// of a join
    pub rhs_val: Option<Value>,
}

impl Condition {
    /// Put the condition in canonical form for a node producing `tab_name`
    /// tuples: the left side names our table, flipping the operator if the
    /// sides must swap.
    pub fn canonicalize_for(&mut self, tab_name: &str) {
        if self.lhs.tab_name != tab_name {
            if let Some(rhs_col) = self.rhs_col.take() {
                let lhs = std::mem::replace(&mut self.lhs, rhs_col);
                self.rhs_col = Some(lhs);
                self.op = self.op.swapped();
            }
        }
    }

    /// Evaluate against a record laid out by `cols`.
    pub fn eval(&self, cols: &[ColMeta], record: &[u8]) -> Result<bool> {
        let lhs_col = find_col(cols, &self.lhs)?;
        let lhs = Value::from_bytes(
            lhs_col.col_type,
            &record[lhs_col.offset..lhs_col.offset + lhs_col.len],
        );
        let rhs = match (&self.rhs_val, &self.rhs_col) {
            (Some(value), _) => value.clone(),
            (None, Some(col)) => {
                let rhs_col = find_col(cols, col)?;
                Value::from_bytes(
                    rhs_col.col_type,
                    &record[rhs_col.offset..rhs_col.offset + rhs_col.len],
                )
            }
            (None, None) => {
                return Err(Error::Internal(
                    "condition has no right-hand side".to_string(),
                ))
            }
        };
        Ok(self.op.eval(compare_values(&lhs, &rhs)?))
    }
}

/// Evaluate a conjunction of conditions.
pub fn eval_conds(cols: &[ColMeta], conds: &[Condition], record: &[u8]) -> Result<bool> {
    for cond in conds {
        if !cond.eval(cols, record)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Find a column in a produced-tuple schema; an empty table name matches by
/// column name alone.
pub fn find_col<'a>(cols: &'a [ColMeta], target: &TabCol) -> Result<&'a ColMeta> {
    cols.iter()
        .find(|c| {
            (target.tab_name.is_empty() || c.tab_name == target.tab_name)
                && c.name == target.col_name
        })
        .ok_or_else(|| Error::ColumnNotFound(target.col_name.clone()))
}

/// Compare two runtime values, widening INT to BIGINT and treating
/// DATETIME as its string form. Anything else across types is a type
/// error.
pub fn compare_values(lhs: &Value, rhs: &Value) -> Result<Ordering> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        (Value::BigInt(a), Value::BigInt(b)) => Ok(a.cmp(b)),
        (Value::Int(a), Value::BigInt(b)) => Ok((*a as i64).cmp(b)),
        (Value::BigInt(a), Value::Int(b)) => Ok(a.cmp(&(*b as i64))),
        (Value::Float(a), Value::Float(b)) => Ok(a.partial_cmp(b).unwrap_or(Ordering::Equal)),
        (Value::Str(a) | Value::Datetime(a), Value::Str(b) | Value::Datetime(b)) => Ok(a.cmp(b)),
        (a, b) => Err(Error::IncompatibleType {
            lhs: a.col_type().to_string(),
            rhs: b.col_type().to_string(),
        }),
    }
}

/// Decode a record through a schema into displayable values.
pub fn decode_record(cols: &[ColMeta], record: &[u8]) -> Vec<Value> {
    cols.iter()
        .map(|c| Value::from_bytes(c.col_type, &record[c.offset..c.offset + c.len]))
        .collect()
}

/// Query result
#[derive(Debug)]
pub struct QueryResult {
    /// Column names
    pub columns: Vec<String>,
    /// Result rows
    pub rows: Vec<Vec<Value>>,
    /// Number of affected rows (for INSERT/UPDATE/DELETE)
    pub affected_rows: usize,
    /// Message
    pub message: Option<String>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            affected_rows: 0,
            message: None,
        }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            affected_rows: 0,
            message: Some(message.into()),
        }
    }

    pub fn with_affected_rows(count: usize) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            affected_rows: count,
            message: Some(format!("{} row(s) affected", count)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::schema::TabMeta;
    use crate::catalog::types::ColType;

    fn table() -> TabMeta {
        let mut tab = TabMeta::new("t");
        tab.add_col("id", ColType::Int, 4);
        tab.add_col("v", ColType::Char, 4);
        tab
    }

    fn record(id: i32, v: &str) -> Vec<u8> {
        let mut rec = vec![0u8; 8];
        rec[..4].copy_from_slice(&id.to_le_bytes());
        rec[4..4 + v.len()].copy_from_slice(v.as_bytes());
        rec
    }

    #[test]
    fn test_condition_eval_value() {
        let tab = table();
        let cond = Condition {
            lhs: TabCol::new("t", "id"),
            op: CompOp::Gt,
            rhs_col: None,
            rhs_val: Some(Value::Int(5)),
        };
        assert!(cond.eval(&tab.cols, &record(7, "aa")).unwrap());
        assert!(!cond.eval(&tab.cols, &record(5, "aa")).unwrap());
    }

    #[test]
    fn test_condition_eval_col_col() {
        let mut tab = TabMeta::new("t");
        tab.add_col("a", ColType::Int, 4);
        tab.add_col("b", ColType::Int, 4);
        let cond = Condition {
            lhs: TabCol::new("t", "a"),
            op: CompOp::Eq,
            rhs_col: Some(TabCol::new("t", "b")),
            rhs_val: None,
        };
        let mut rec = 3i32.to_le_bytes().to_vec();
        rec.extend(3i32.to_le_bytes());
        assert!(cond.eval(&tab.cols, &rec).unwrap());
    }

    #[test]
    fn test_canonicalize_swaps_sides() {
        let mut cond = Condition {
            lhs: TabCol::new("other", "x"),
            op: CompOp::Lt,
            rhs_col: Some(TabCol::new("t", "id")),
            rhs_val: None,
        };
        cond.canonicalize_for("t");
        assert_eq!(cond.lhs, TabCol::new("t", "id"));
        assert_eq!(cond.op, CompOp::Gt);
        assert_eq!(cond.rhs_col, Some(TabCol::new("other", "x")));
    }

    #[test]
    fn test_compare_values_widening() {
        assert_eq!(
            compare_values(&Value::Int(3), &Value::BigInt(4)).unwrap(),
            Ordering::Less
        );
        assert!(compare_values(&Value::Int(3), &Value::Float(3.0)).is_err());
    }
}
