//! Executor trait and table access nodes
//!
//! Every node implements the volcano contract: `begin_tuple` positions on
//! the first tuple, `next_tuple` advances, `next` returns the current
//! record, `get_block` materializes the rest, and `feed` receives bindings
//! from the outer side of a nested-loop join.

use std::collections::HashMap;
use std::sync::Arc;

use super::{eval_conds, Condition, Context};
use crate::catalog::schema::{ColMeta, IndexMeta, TabCol};
use crate::catalog::types::Value;
use crate::error::{AbortReason, Error, Result};
use crate::sql::ast::CompOp;
use crate::storage::btree::{IxIndexHandle, IxScan};
use crate::storage::heap::{Rid, RmFileHandle, RmScan};
use crate::transaction::lock_manager::LockMode;

/// Volcano iterator contract
pub trait Executor {
    /// Column metadata of produced tuples
    fn cols(&self) -> &[ColMeta];

    /// Produced tuple width in bytes
    fn tuple_len(&self) -> usize;

    /// Prepare the iterator and position on the first tuple
    fn begin_tuple(&mut self) -> Result<()>;

    /// Advance to the next tuple
    fn next_tuple(&mut self) -> Result<()>;

    fn is_end(&self) -> bool;

    /// The current tuple
    fn next(&mut self) -> Result<Vec<u8>>;

    /// Materialize all remaining tuples
    fn get_block(&mut self) -> Result<Vec<Vec<u8>>>;

    /// Receive bindings from the outer side of a join
    fn feed(&mut self, dict: &HashMap<TabCol, Value>) -> Result<()>;

    /// Heap position of the current tuple, where meaningful
    fn rid(&self) -> Rid {
        Rid::new(-1, -1)
    }
}

/// Acquire a table lock for an explicit transaction; auto-commit
/// statements run inside a single engine call and take no locks.
pub(crate) fn lock_table(ctx: &Context, fd: i32, mode: LockMode) -> Result<()> {
    if !ctx.txn.is_explicit() {
        return Ok(());
    }
    if !ctx.lock_mgr.lock_on_table(&ctx.txn, fd, mode)? {
        return Err(Error::TransactionAbort(
            ctx.txn.id(),
            AbortReason::FailedToLock,
        ));
    }
    Ok(())
}

/// Substitute fed outer-side values into conditions.
fn apply_feed(conds: &mut [Condition], dict: &HashMap<TabCol, Value>) {
    for cond in conds.iter_mut() {
        if let Some(rhs_col) = &cond.rhs_col {
            if let Some(value) = dict.get(rhs_col) {
                cond.rhs_val = Some(value.clone());
            }
        }
    }
}

/// Full-table scan with a conjunctive filter
pub struct SeqScanExecutor {
    ctx: Context,
    fh: Arc<RmFileHandle>,
    cols: Vec<ColMeta>,
    len: usize,
    fed_conds: Vec<Condition>,
    scan: Option<RmScan>,
    rid: Rid,
}

impl SeqScanExecutor {
    pub fn new(ctx: Context, tab_name: &str, mut conds: Vec<Condition>) -> Result<Self> {
        let tab = ctx.sm.get_table(tab_name)?;
        let fh = ctx.sm.get_file(tab_name)?;
        for cond in conds.iter_mut() {
            cond.canonicalize_for(tab_name);
        }
        Ok(Self {
            ctx,
            fh,
            len: tab.record_size(),
            cols: tab.cols,
            fed_conds: conds,
            scan: None,
            rid: Rid::new(-1, -1),
        })
    }

    fn seek_match(&mut self) -> Result<()> {
        while let Some(scan) = self.scan.as_mut() {
            if scan.is_end() {
                break;
            }
            let rid = scan.rid();
            let record = self.fh.get_record(rid)?;
            if eval_conds(&self.cols, &self.fed_conds, &record)? {
                self.rid = rid;
                return Ok(());
            }
            scan.next()?;
        }
        Ok(())
    }
}

impl Executor for SeqScanExecutor {
    fn cols(&self) -> &[ColMeta] {
        &self.cols
    }

    fn tuple_len(&self) -> usize {
        self.len
    }

    fn begin_tuple(&mut self) -> Result<()> {
        lock_table(&self.ctx, self.fh.fd(), LockMode::Shared)?;
        self.scan = Some(RmScan::new(self.fh.clone())?);
        self.seek_match()
    }

    fn next_tuple(&mut self) -> Result<()> {
        if let Some(scan) = self.scan.as_mut() {
            if !scan.is_end() {
                scan.next()?;
            }
        }
        self.seek_match()
    }

    fn is_end(&self) -> bool {
        self.scan.as_ref().map_or(true, |s| s.is_end())
    }

    fn next(&mut self) -> Result<Vec<u8>> {
        self.fh.get_record(self.rid)
    }

    fn get_block(&mut self) -> Result<Vec<Vec<u8>>> {
        self.begin_tuple()?;
        let mut block = Vec::new();
        while !self.is_end() {
            block.push(self.next()?);
            self.next_tuple()?;
        }
        Ok(block)
    }

    fn feed(&mut self, dict: &HashMap<TabCol, Value>) -> Result<()> {
        apply_feed(&mut self.fed_conds, dict);
        Ok(())
    }

    fn rid(&self) -> Rid {
        self.rid
    }
}

/// Index range scan: positions at the first key >= the probe key built
/// from equality/lower-bound conditions on the leading key columns, and
/// stops on the first non-matching record (predicates are monotone on the
/// sort order).
pub struct IndexScanExecutor {
    ctx: Context,
    fh: Arc<RmFileHandle>,
    ih: Arc<IxIndexHandle>,
    index_meta: IndexMeta,
    cols: Vec<ColMeta>,
    len: usize,
    fed_conds: Vec<Condition>,
    scan: Option<IxScan>,
    rid: Rid,
}

impl IndexScanExecutor {
    pub fn new(
        ctx: Context,
        tab_name: &str,
        index_meta: IndexMeta,
        mut conds: Vec<Condition>,
    ) -> Result<Self> {
        let tab = ctx.sm.get_table(tab_name)?;
        let fh = ctx.sm.get_file(tab_name)?;
        let ih = ctx.sm.get_index(&index_meta.index_name())?;
        for cond in conds.iter_mut() {
            cond.canonicalize_for(tab_name);
        }
        Ok(Self {
            ctx,
            fh,
            ih,
            index_meta,
            len: tab.record_size(),
            cols: tab.cols,
            fed_conds: conds,
            scan: None,
            rid: Rid::new(-1, -1),
        })
    }

    /// Build the composite probe key from equality and lower-bound
    /// conditions on the key columns; unconstrained columns stay zeroed.
    fn make_key(&self) -> Result<Vec<u8>> {
        let mut key = vec![0u8; self.index_meta.col_tot_len];
        let mut offset = 0;
        for col in &self.index_meta.cols {
            for cond in &self.fed_conds {
                if cond.lhs.col_name != col.name {
                    continue;
                }
                if !matches!(cond.op, CompOp::Eq | CompOp::Gt | CompOp::Ge) {
                    continue;
                }
                if let Some(value) = &cond.rhs_val {
                    let bytes = value.coerce_to(col.col_type, col.len)?.to_bytes(col.len)?;
                    key[offset..offset + col.len].copy_from_slice(&bytes);
                    break;
                }
            }
            offset += col.len;
        }
        Ok(key)
    }

    fn current_matches(&self) -> Result<Option<bool>> {
        let scan = self.scan.as_ref().expect("scan not started");
        if scan.is_end() {
            return Ok(None);
        }
        let record = self.fh.get_record(scan.rid()?)?;
        Ok(Some(eval_conds(&self.cols, &self.fed_conds, &record)?))
    }
}

impl Executor for IndexScanExecutor {
    fn cols(&self) -> &[ColMeta] {
        &self.cols
    }

    fn tuple_len(&self) -> usize {
        self.len
    }

    fn begin_tuple(&mut self) -> Result<()> {
        lock_table(&self.ctx, self.fh.fd(), LockMode::Shared)?;
        let key = self.make_key()?;
        let start = self.ih.leaf_begin_at(&key)?;
        let end = self.ih.leaf_end()?;
        self.scan = Some(IxScan::new(self.ih.clone(), start, end));
        // Skip leading non-matches; once one matches, the first failure
        // after it terminates the scan.
        loop {
            match self.current_matches()? {
                None => return Ok(()),
                Some(true) => {
                    self.rid = self.scan.as_ref().expect("scan not started").rid()?;
                    return Ok(());
                }
                Some(false) => self.scan.as_mut().expect("scan not started").next()?,
            }
        }
    }

    fn next_tuple(&mut self) -> Result<()> {
        if self.is_end() {
            return Ok(());
        }
        self.scan.as_mut().expect("scan not started").next()?;
        match self.current_matches()? {
            None => {}
            Some(true) => self.rid = self.scan.as_ref().expect("scan not started").rid()?,
            Some(false) => self.scan.as_mut().expect("scan not started").set_end(),
        }
        Ok(())
    }

    fn is_end(&self) -> bool {
        self.scan.as_ref().map_or(true, |s| s.is_end())
    }

    fn next(&mut self) -> Result<Vec<u8>> {
        self.fh.get_record(self.rid)
    }

    fn get_block(&mut self) -> Result<Vec<Vec<u8>>> {
        self.begin_tuple()?;
        let mut block = Vec::new();
        while !self.is_end() {
            block.push(self.next()?);
            self.next_tuple()?;
        }
        Ok(block)
    }

    fn feed(&mut self, dict: &HashMap<TabCol, Value>) -> Result<()> {
        apply_feed(&mut self.fed_conds, dict);
        Ok(())
    }

    fn rid(&self) -> Rid {
        self.rid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::catalog::{ColDef, SmManager};
    use crate::catalog::types::ColType;
    use crate::storage::buffer_pool::BufferPoolManager;
    use crate::storage::disk::DiskManager;
    use crate::storage::wal::LogManager;
    use crate::transaction::lock_manager::LockManager;
    use crate::transaction::transaction::Transaction;
    use crate::transaction::txn_manager::TransactionManager;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Context) {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path()).unwrap());
        let log_mgr = Arc::new(LogManager::new(disk.clone()));
        let bpm = Arc::new(Mutex::new(BufferPoolManager::new(
            64,
            disk.clone(),
            Some(log_mgr.clone()),
        )));
        let sm = Arc::new(SmManager::open(disk, bpm).unwrap());
        let txn_mgr = TransactionManager::new();
        let lock_mgr = Arc::new(LockManager::new(txn_mgr.txn_map()));
        let ctx = Context {
            txn: Arc::new(Transaction::new(0)),
            sm,
            log_mgr,
            lock_mgr,
        };
        (dir, ctx)
    }

    fn fill_table(ctx: &Context) {
        ctx.sm
            .create_table(
                "t",
                &[
                    ColDef {
                        name: "id".to_string(),
                        col_type: ColType::Int,
                        len: 4,
                    },
                    ColDef {
                        name: "v".to_string(),
                        col_type: ColType::Char,
                        len: 4,
                    },
                ],
            )
            .unwrap();
        let fh = ctx.sm.get_file("t").unwrap();
        for i in 1..=10i32 {
            let mut rec = vec![0u8; 8];
            rec[..4].copy_from_slice(&i.to_le_bytes());
            rec[4] = b'a' + (i % 26) as u8;
            fh.insert_record(&rec).unwrap();
        }
    }

    fn cond_ge(ctx_tab: &str, col: &str, v: i32) -> Condition {
        Condition {
            lhs: TabCol::new(ctx_tab, col),
            op: CompOp::Ge,
            rhs_col: None,
            rhs_val: Some(Value::Int(v)),
        }
    }

    #[test]
    fn test_seq_scan_filters() {
        let (_dir, ctx) = setup();
        fill_table(&ctx);
        let mut scan =
            SeqScanExecutor::new(ctx.clone(), "t", vec![cond_ge("t", "id", 8)]).unwrap();
        let block = scan.get_block().unwrap();
        assert_eq!(block.len(), 3);
    }

    #[test]
    fn test_seq_scan_iteration_matches_block() {
        let (_dir, ctx) = setup();
        fill_table(&ctx);
        let mut scan = SeqScanExecutor::new(ctx.clone(), "t", vec![]).unwrap();
        scan.begin_tuple().unwrap();
        let mut n = 0;
        while !scan.is_end() {
            let rec = scan.next().unwrap();
            assert_eq!(rec.len(), 8);
            n += 1;
            scan.next_tuple().unwrap();
        }
        assert_eq!(n, 10);
    }

    #[test]
    fn test_index_scan_range() {
        let (_dir, ctx) = setup();
        fill_table(&ctx);
        ctx.sm.create_index("t", &["id".to_string()], Some(4)).unwrap();
        let tab = ctx.sm.get_table("t").unwrap();
        let meta = tab.get_index_meta(&["id".to_string()]).unwrap().clone();

        let mut scan =
            IndexScanExecutor::new(ctx.clone(), "t", meta, vec![cond_ge("t", "id", 6)]).unwrap();
        let block = scan.get_block().unwrap();
        let ids: Vec<i32> = block
            .iter()
            .map(|r| i32::from_le_bytes([r[0], r[1], r[2], r[3]]))
            .collect();
        assert_eq!(ids, vec![6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_index_scan_point_lookup() {
        let (_dir, ctx) = setup();
        fill_table(&ctx);
        ctx.sm.create_index("t", &["id".to_string()], None).unwrap();
        let tab = ctx.sm.get_table("t").unwrap();
        let meta = tab.get_index_meta(&["id".to_string()]).unwrap().clone();

        let cond = Condition {
            lhs: TabCol::new("t", "id"),
            op: CompOp::Eq,
            rhs_col: None,
            rhs_val: Some(Value::Int(4)),
        };
        let mut scan = IndexScanExecutor::new(ctx.clone(), "t", meta, vec![cond]).unwrap();
        let block = scan.get_block().unwrap();
        assert_eq!(block.len(), 1);
        assert_eq!(&block[0][..4], &4i32.to_le_bytes());
    }
}
