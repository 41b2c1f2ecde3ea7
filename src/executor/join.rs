//! Join, sort, aggregate and projection executors

use std::collections::HashMap;

use super::executor::Executor;
use super::{eval_conds, find_col, Condition};
use crate::catalog::schema::{ColMeta, TabCol};
use crate::catalog::types::{ix_compare, ColType, Value};
use crate::error::{Error, Result};
use crate::sql::ast::AggFunc;

/// Block nested-loop join. Both sides are materialized; the outer side is
/// iterated row by row, substituting its column values into the join
/// conditions, which are then evaluated against inner-side rows.
pub struct NestedLoopJoinExecutor {
    left: Box<dyn Executor>,
    right: Box<dyn Executor>,
    cols: Vec<ColMeta>,
    len: usize,
    right_tab: String,
    fed_conds: Vec<Condition>,
    lhs_block: Vec<Vec<u8>>,
    rhs_block: Vec<Vec<u8>>,
    l_cnt: usize,
    r_cnt: usize,
    started: bool,
}

impl NestedLoopJoinExecutor {
    pub fn new(
        left: Box<dyn Executor>,
        right: Box<dyn Executor>,
        right_tab: &str,
        mut conds: Vec<Condition>,
    ) -> Self {
        let len = left.tuple_len() + right.tuple_len();
        let mut cols = left.cols().to_vec();
        for col in right.cols() {
            let mut col = col.clone();
            col.offset += left.tuple_len();
            cols.push(col);
        }
        // Canonicalize so the left side of each condition names the inner
        // (right) table; outer values arrive by substitution.
        for cond in conds.iter_mut() {
            cond.canonicalize_for(right_tab);
        }
        Self {
            left,
            right,
            cols,
            len,
            right_tab: right_tab.to_string(),
            fed_conds: conds,
            lhs_block: Vec::new(),
            rhs_block: Vec::new(),
            l_cnt: 0,
            r_cnt: 0,
            started: false,
        }
    }

    /// Bind the current outer row's values into the join conditions.
    fn substitute_outer(&mut self) -> Result<()> {
        let record = &self.lhs_block[self.l_cnt];
        for cond in self.fed_conds.iter_mut() {
            if let Some(rhs_col) = &cond.rhs_col {
                if rhs_col.tab_name != self.right_tab {
                    let col = find_col(self.left.cols(), rhs_col)?;
                    cond.rhs_val = Some(Value::from_bytes(
                        col.col_type,
                        &record[col.offset..col.offset + col.len],
                    ));
                }
            }
        }
        Ok(())
    }

    /// Advance (l_cnt, r_cnt) to the next matching pair, starting from the
    /// current r_cnt.
    fn seek_match(&mut self) -> Result<()> {
        while self.l_cnt < self.lhs_block.len() {
            self.substitute_outer()?;
            while self.r_cnt < self.rhs_block.len() {
                if eval_conds(
                    self.right.cols(),
                    &self.fed_conds,
                    &self.rhs_block[self.r_cnt],
                )? {
                    return Ok(());
                }
                self.r_cnt += 1;
            }
            self.r_cnt = 0;
            self.l_cnt += 1;
        }
        Ok(())
    }
}

impl Executor for NestedLoopJoinExecutor {
    fn cols(&self) -> &[ColMeta] {
        &self.cols
    }

    fn tuple_len(&self) -> usize {
        self.len
    }

    fn begin_tuple(&mut self) -> Result<()> {
        self.started = true;
        self.lhs_block = self.left.get_block()?;
        if self.lhs_block.is_empty() {
            return Ok(());
        }
        self.rhs_block = self.right.get_block()?;
        self.l_cnt = 0;
        self.r_cnt = 0;
        self.seek_match()
    }

    fn next_tuple(&mut self) -> Result<()> {
        if self.is_end() {
            return Ok(());
        }
        self.r_cnt += 1;
        self.seek_match()
    }

    fn is_end(&self) -> bool {
        !self.started || self.l_cnt >= self.lhs_block.len()
    }

    fn next(&mut self) -> Result<Vec<u8>> {
        let mut record = Vec::with_capacity(self.len);
        record.extend_from_slice(&self.lhs_block[self.l_cnt]);
        record.extend_from_slice(&self.rhs_block[self.r_cnt]);
        Ok(record)
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
        self.left.feed(dict)
    }
}

/// In-memory sort over the child's block, earliest key most significant.
/// A LIMIT, when present, truncates the sorted output.
pub struct SortExecutor {
    child: Box<dyn Executor>,
    sort_cols: Vec<(ColMeta, bool)>,
    limit: Option<usize>,
    tuples: Vec<Vec<u8>>,
    pos: usize,
    started: bool,
}

impl SortExecutor {
    pub fn new(
        child: Box<dyn Executor>,
        order_by: &[(TabCol, bool)],
        limit: Option<usize>,
    ) -> Result<Self> {
        let mut sort_cols = Vec::with_capacity(order_by.len());
        for (target, ascending) in order_by {
            sort_cols.push((find_col(child.cols(), target)?.clone(), *ascending));
        }
        Ok(Self {
            child,
            sort_cols,
            limit,
            tuples: Vec::new(),
            pos: 0,
            started: false,
        })
    }

    fn effective_len(&self) -> usize {
        match self.limit {
            Some(limit) => self.tuples.len().min(limit),
            None => self.tuples.len(),
        }
    }
}

impl Executor for SortExecutor {
    fn cols(&self) -> &[ColMeta] {
        self.child.cols()
    }

    fn tuple_len(&self) -> usize {
        self.child.tuple_len()
    }

    fn begin_tuple(&mut self) -> Result<()> {
        self.started = true;
        self.tuples = self.child.get_block()?;
        let sort_cols = self.sort_cols.clone();
        self.tuples.sort_by(|a, b| {
            for (col, ascending) in &sort_cols {
                let ord = ix_compare(
                    &a[col.offset..col.offset + col.len],
                    &b[col.offset..col.offset + col.len],
                    col.col_type,
                    col.len,
                );
                if ord != std::cmp::Ordering::Equal {
                    return if *ascending { ord } else { ord.reverse() };
                }
            }
            std::cmp::Ordering::Equal
        });
        self.pos = 0;
        Ok(())
    }

    fn next_tuple(&mut self) -> Result<()> {
        self.pos += 1;
        Ok(())
    }

    fn is_end(&self) -> bool {
        !self.started || self.pos >= self.effective_len()
    }

    fn next(&mut self) -> Result<Vec<u8>> {
        Ok(self.tuples[self.pos].clone())
    }

    fn get_block(&mut self) -> Result<Vec<Vec<u8>>> {
        if !self.started {
            self.begin_tuple()?;
        }
        let end = self.effective_len();
        let block = self.tuples[self.pos..end].to_vec();
        self.pos = end;
        Ok(block)
    }

    fn feed(&mut self, _dict: &HashMap<TabCol, Value>) -> Result<()> {
        Err(Error::Internal("cannot feed a sort node".to_string()))
    }
}

/// One-pass aggregate over the child block. The result is written into an
/// otherwise-copied tuple: COUNT at offset 0, SUM over its column's slot,
/// MIN/MAX keep the winning tuple whole. `cols()` describes the single
/// output column inside that tuple.
pub struct AggExecutor {
    child: Box<dyn Executor>,
    func: AggFunc,
    target: Option<ColMeta>,
    out_cols: Vec<ColMeta>,
    result: Option<Vec<u8>>,
    done: bool,
    started: bool,
}

impl AggExecutor {
    pub fn new(
        child: Box<dyn Executor>,
        func: AggFunc,
        target: Option<TabCol>,
        alias: Option<String>,
    ) -> Result<Self> {
        let target = match &target {
            Some(col) => Some(find_col(child.cols(), col)?.clone()),
            None => None,
        };
        let out_cols = vec![Self::output_col(&func, target.as_ref(), alias)?];
        Ok(Self {
            child,
            func,
            target,
            out_cols,
            result: None,
            done: false,
            started: false,
        })
    }

    fn output_col(
        func: &AggFunc,
        target: Option<&ColMeta>,
        alias: Option<String>,
    ) -> Result<ColMeta> {
        let name = alias.unwrap_or_else(|| match target {
            Some(col) => format!("{}({})", func, col.name),
            None => format!("{}(*)", func),
        });
        // COUNT(col) is COUNT(*): the result is a row count at offset 0.
        if *func == AggFunc::Count {
            return Ok(ColMeta {
                tab_name: String::new(),
                name,
                col_type: ColType::Int,
                len: 4,
                offset: 0,
            });
        }
        let target = target.ok_or_else(|| {
            Error::Internal(format!("{} requires a column argument", func))
        })?;
        if *func == AggFunc::Sum
            && !matches!(
                target.col_type,
                ColType::Int | ColType::BigInt | ColType::Float
            )
        {
            return Err(Error::IncompatibleType {
                lhs: "a numeric type".to_string(),
                rhs: target.col_type.to_string(),
            });
        }
        Ok(ColMeta {
            tab_name: String::new(),
            name,
            col_type: target.col_type,
            len: target.len,
            offset: target.offset,
        })
    }
}

impl Executor for AggExecutor {
    fn cols(&self) -> &[ColMeta] {
        &self.out_cols
    }

    fn tuple_len(&self) -> usize {
        self.child.tuple_len()
    }

    fn begin_tuple(&mut self) -> Result<()> {
        self.started = true;
        let block = self.child.get_block()?;

        match self.func {
            AggFunc::Count => {
                let mut record = block
                    .first()
                    .cloned()
                    .unwrap_or_else(|| vec![0u8; self.child.tuple_len()]);
                record[0..4].copy_from_slice(&(block.len() as i32).to_le_bytes());
                self.result = Some(record);
            }
            AggFunc::Sum => {
                if block.is_empty() {
                    self.result = None;
                    return Ok(());
                }
                let col = self.target.as_ref().expect("SUM has a target column");
                let slot = col.offset..col.offset + col.len;
                let mut record = block[0].clone();
                match col.col_type {
                    ColType::Int => {
                        let mut sum = 0i32;
                        for rec in &block {
                            sum += i32::from_le_bytes(rec[slot.clone()].try_into().unwrap());
                        }
                        record[slot].copy_from_slice(&sum.to_le_bytes());
                    }
                    ColType::BigInt => {
                        let mut sum = 0i64;
                        for rec in &block {
                            sum += i64::from_le_bytes(rec[slot.clone()].try_into().unwrap());
                        }
                        record[slot].copy_from_slice(&sum.to_le_bytes());
                    }
                    ColType::Float => {
                        let mut sum = 0f32;
                        for rec in &block {
                            sum += f32::from_le_bytes(rec[slot.clone()].try_into().unwrap());
                        }
                        record[slot].copy_from_slice(&sum.to_le_bytes());
                    }
                    _ => unreachable!("checked at construction"),
                }
                self.result = Some(record);
            }
            AggFunc::Min | AggFunc::Max => {
                let col = self.target.as_ref().expect("MIN/MAX has a target column");
                let mut best: Option<Vec<u8>> = None;
                for rec in block {
                    best = Some(match best {
                        None => rec,
                        Some(cur) => {
                            let ord = ix_compare(
                                &rec[col.offset..col.offset + col.len],
                                &cur[col.offset..col.offset + col.len],
                                col.col_type,
                                col.len,
                            );
                            let wins = if self.func == AggFunc::Max {
                                ord == std::cmp::Ordering::Greater
                            } else {
                                ord == std::cmp::Ordering::Less
                            };
                            if wins {
                                rec
                            } else {
                                cur
                            }
                        }
                    });
                }
                self.result = best;
            }
        }
        Ok(())
    }

    fn next_tuple(&mut self) -> Result<()> {
        self.done = true;
        Ok(())
    }

    fn is_end(&self) -> bool {
        !self.started || self.done || self.result.is_none()
    }

    fn next(&mut self) -> Result<Vec<u8>> {
        self.result
            .clone()
            .ok_or_else(|| Error::Internal("aggregate produced no tuple".to_string()))
    }

    fn get_block(&mut self) -> Result<Vec<Vec<u8>>> {
        if !self.started {
            self.begin_tuple()?;
        }
        if self.is_end() {
            return Ok(Vec::new());
        }
        self.done = true;
        Ok(vec![self.next()?])
    }

    fn feed(&mut self, _dict: &HashMap<TabCol, Value>) -> Result<()> {
        Err(Error::Internal("cannot feed an aggregate node".to_string()))
    }
}

/// Maps the child schema onto a new column layout, one output tuple per
/// input tuple.
pub struct ProjectionExecutor {
    child: Box<dyn Executor>,
    cols: Vec<ColMeta>,
    src_cols: Vec<ColMeta>,
    len: usize,
}

impl ProjectionExecutor {
    pub fn new(child: Box<dyn Executor>, sel_cols: &[TabCol]) -> Result<Self> {
        let mut cols = Vec::with_capacity(sel_cols.len());
        let mut src_cols = Vec::with_capacity(sel_cols.len());
        let mut offset = 0;
        for target in sel_cols {
            let src = find_col(child.cols(), target)?.clone();
            let mut out = src.clone();
            out.offset = offset;
            offset += out.len;
            cols.push(out);
            src_cols.push(src);
        }
        Ok(Self {
            child,
            cols,
            src_cols,
            len: offset,
        })
    }

    fn project(&self, record: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        for (src, dst) in self.src_cols.iter().zip(self.cols.iter()) {
            out[dst.offset..dst.offset + dst.len]
                .copy_from_slice(&record[src.offset..src.offset + src.len]);
        }
        out
    }
}

impl Executor for ProjectionExecutor {
    fn cols(&self) -> &[ColMeta] {
        &self.cols
    }

    fn tuple_len(&self) -> usize {
        self.len
    }

    fn begin_tuple(&mut self) -> Result<()> {
        self.child.begin_tuple()
    }

    fn next_tuple(&mut self) -> Result<()> {
        self.child.next_tuple()
    }

    fn is_end(&self) -> bool {
        self.child.is_end()
    }

    fn next(&mut self) -> Result<Vec<u8>> {
        let record = self.child.next()?;
        Ok(self.project(&record))
    }

    fn get_block(&mut self) -> Result<Vec<Vec<u8>>> {
        let block = self.child.get_block()?;
        Ok(block.iter().map(|rec| self.project(rec)).collect())
    }

    fn feed(&mut self, _dict: &HashMap<TabCol, Value>) -> Result<()> {
        Err(Error::Internal("cannot feed a projection node".to_string()))
    }
}
