//! Statement binding and execution
//!
//! Resolves names and types against the catalog, picks index scans over
//! sequential scans where a usable index exists, builds the executor tree
//! and pumps it. DDL goes straight to the system manager.

use super::dml::{DeleteExecutor, InsertExecutor, SetClause, UpdateExecutor};
use super::executor::{Executor, IndexScanExecutor, SeqScanExecutor};
use super::join::{AggExecutor, NestedLoopJoinExecutor, ProjectionExecutor, SortExecutor};
use super::{decode_record, Condition, Context, QueryResult};
use crate::catalog::catalog::ColDef;
use crate::catalog::schema::TabCol;
use crate::catalog::types::{ColType, Value};
use crate::error::{Error, Result};
use crate::sql::ast::{
    ColRef, CompOp, CondExpr, CondRhs, SelectStatement, Selector, Statement,
};
use crate::storage::heap::Rid;

const HELP_TEXT: &str = "Supported SQL syntax:\n\
  CREATE TABLE table_name (column_name type [, column_name type ...])\n\
  DROP TABLE table_name\n\
  CREATE INDEX table_name (column_name [, column_name ...])\n\
  DROP INDEX table_name (column_name [, column_name ...])\n\
  SHOW TABLES\n\
  SHOW INDEX FROM table_name\n\
  DESC table_name\n\
  INSERT INTO table_name VALUES (value [, value ...]) [, (...) ...]\n\
  DELETE FROM table_name [WHERE where_clause]\n\
  UPDATE table_name SET column_name = value [, ...] [WHERE where_clause]\n\
  SELECT selector FROM table_name [JOIN table_name] [WHERE where_clause]\n\
         [ORDER BY column [ASC|DESC] [, ...]] [LIMIT n]\n\
  begin; commit; abort; rollback;\n\
types:\n\
  INT, BIGINT, FLOAT, CHAR(n), DATETIME\n\
where_clause:\n\
  condition [AND condition ...]\n\
condition:\n\
  [table_name.]column op {[table_name.]column | value}\n\
op:\n\
  =, <>, <, >, <=, >=\n";

/// Executes bound statements against a session context
pub struct ExecutionEngine;

impl ExecutionEngine {
    pub fn new() -> Self {
        Self
    }

    /// Execute one statement. Transaction control and `exit` are handled by
    /// the session, not here.
    pub fn execute(&self, stmt: Statement, ctx: &Context) -> Result<QueryResult> {
        match stmt {
            Statement::CreateTable { table, cols } => {
                let col_defs: Vec<ColDef> = cols
                    .into_iter()
                    .map(|c| ColDef {
                        name: c.name,
                        col_type: c.col_type,
                        len: c.len,
                    })
                    .collect();
                ctx.sm.create_table(&table, &col_defs)?;
                Ok(QueryResult::with_message(format!("Table '{}' created", table)))
            }
            Statement::DropTable { table } => {
                ctx.sm.drop_table(&table)?;
                Ok(QueryResult::with_message(format!("Table '{}' dropped", table)))
            }
            Statement::CreateIndex { table, cols } => {
                ctx.sm.create_index(&table, &cols, None)?;
                Ok(QueryResult::with_message(format!(
                    "Index on '{}({})' created",
                    table,
                    cols.join(",")
                )))
            }
            Statement::DropIndex { table, cols } => {
                ctx.sm.drop_index(&table, &cols)?;
                Ok(QueryResult::with_message(format!(
                    "Index on '{}({})' dropped",
                    table,
                    cols.join(",")
                )))
            }
            Statement::ShowTables => {
                let rows = ctx
                    .sm
                    .list_tables()
                    .into_iter()
                    .map(|name| vec![Value::Str(name)])
                    .collect();
                Ok(QueryResult {
                    columns: vec!["Tables".to_string()],
                    rows,
                    affected_rows: 0,
                    message: None,
                })
            }
            Statement::ShowIndex { table } => {
                let tab = ctx.sm.get_table(&table)?;
                let rows = tab
                    .indexes
                    .iter()
                    .map(|ix| {
                        vec![
                            Value::Str(table.clone()),
                            Value::Str(ix.index_name()),
                            Value::Str(
                                ix.cols
                                    .iter()
                                    .map(|c| c.name.clone())
                                    .collect::<Vec<_>>()
                                    .join(","),
                            ),
                        ]
                    })
                    .collect();
                Ok(QueryResult {
                    columns: vec![
                        "Table".to_string(),
                        "Index".to_string(),
                        "Columns".to_string(),
                    ],
                    rows,
                    affected_rows: 0,
                    message: None,
                })
            }
            Statement::DescTable { table } => {
                let tab = ctx.sm.get_table(&table)?;
                let rows = tab
                    .cols
                    .iter()
                    .map(|c| {
                        let ty = match c.col_type {
                            ColType::Char => format!("CHAR({})", c.len),
                            other => other.to_string(),
                        };
                        vec![Value::Str(c.name.clone()), Value::Str(ty)]
                    })
                    .collect();
                Ok(QueryResult {
                    columns: vec!["Field".to_string(), "Type".to_string()],
                    rows,
                    affected_rows: 0,
                    message: None,
                })
            }
            Statement::Insert { table, rows } => {
                let mut inserted = 0;
                for values in rows {
                    InsertExecutor::new(ctx.clone(), &table, values)?.run()?;
                    inserted += 1;
                }
                Ok(QueryResult::with_affected_rows(inserted))
            }
            Statement::Delete { table, conds } => {
                let conds = self.bind_conds(ctx, &[table.clone()], conds)?;
                let rids = self.collect_rids(ctx, &table, conds)?;
                let count = DeleteExecutor::new(ctx.clone(), &table, rids)?.run()?;
                Ok(QueryResult::with_affected_rows(count))
            }
            Statement::Update {
                table,
                set_clauses,
                conds,
            } => {
                let conds = self.bind_conds(ctx, &[table.clone()], conds)?;
                let rids = self.collect_rids(ctx, &table, conds)?;
                let set_clauses: Vec<SetClause> = set_clauses
                    .into_iter()
                    .map(|c| SetClause {
                        col_name: c.col_name,
                        rhs: c.rhs,
                        is_expr: c.is_expr,
                        add: c.add,
                    })
                    .collect();
                let count =
                    UpdateExecutor::new(ctx.clone(), &table, set_clauses, rids)?.run()?;
                Ok(QueryResult::with_affected_rows(count))
            }
            Statement::Select(select) => self.execute_select(ctx, select),
            Statement::Help => Ok(QueryResult::with_message(HELP_TEXT)),
            Statement::Begin
            | Statement::Commit
            | Statement::Abort
            | Statement::Rollback
            | Statement::Exit => Err(Error::Internal(
                "transaction control is handled by the session".to_string(),
            )),
        }
    }

    fn execute_select(&self, ctx: &Context, select: SelectStatement) -> Result<QueryResult> {
        for table in &select.tables {
            if !ctx.sm.is_table(table) {
                return Err(Error::TableNotFound(table.clone()));
            }
        }
        let conds = self.bind_conds(ctx, &select.tables, select.conds)?;

        // Single-table conditions go to the scans; cross-table conditions
        // drive the join.
        let mut base: Box<dyn Executor> = if select.tables.len() == 1 {
            self.make_scan(ctx, &select.tables[0], conds)?
        } else {
            let (left_tab, right_tab) = (&select.tables[0], &select.tables[1]);
            let mut left_conds = Vec::new();
            let mut right_conds = Vec::new();
            let mut cross_conds = Vec::new();
            for cond in conds {
                let tabs_of = |c: &Condition| -> Vec<String> {
                    let mut tabs = vec![c.lhs.tab_name.clone()];
                    if let Some(rhs) = &c.rhs_col {
                        tabs.push(rhs.tab_name.clone());
                    }
                    tabs
                };
                let tabs = tabs_of(&cond);
                if tabs.iter().all(|t| t == left_tab) {
                    left_conds.push(cond);
                } else if tabs.iter().all(|t| t == right_tab) {
                    right_conds.push(cond);
                } else {
                    cross_conds.push(cond);
                }
            }
            let left = self.make_scan(ctx, left_tab, left_conds)?;
            let right = self.make_scan(ctx, right_tab, right_conds)?;
            Box::new(NestedLoopJoinExecutor::new(
                left,
                right,
                right_tab,
                cross_conds,
            ))
        };

        // Aggregate, then sort, then project.
        let sel_cols: Vec<TabCol> = match &select.selector {
            Selector::Wildcard => base
                .cols()
                .iter()
                .map(|c| TabCol::new(&c.tab_name, &c.name))
                .collect(),
            Selector::Cols(refs) => refs
                .iter()
                .map(|r| self.resolve_col(ctx, &select.tables, r))
                .collect::<Result<Vec<TabCol>>>()?,
            Selector::Agg { func, col, alias } => {
                let target = match col {
                    Some(col) => Some(self.resolve_col(ctx, &select.tables, col)?),
                    None => None,
                };
                let agg = AggExecutor::new(base, *func, target, alias.clone())?;
                let name = agg.cols()[0].name.clone();
                base = Box::new(agg);
                vec![TabCol::new("", &name)]
            }
        };

        if !select.order_by.is_empty() {
            let order: Vec<(TabCol, bool)> = select
                .order_by
                .iter()
                .map(|o| {
                    let col = self.resolve_col(ctx, &select.tables, &o.col)?;
                    Ok((col, o.ascending))
                })
                .collect::<Result<Vec<(TabCol, bool)>>>()?;
            base = Box::new(SortExecutor::new(base, &order, select.limit)?);
        }

        let mut root = ProjectionExecutor::new(base, &sel_cols)?;
        let columns: Vec<String> = root.cols().iter().map(|c| c.name.clone()).collect();

        let mut rows = Vec::new();
        root.begin_tuple()?;
        while !root.is_end() {
            let record = root.next()?;
            rows.push(decode_record(root.cols(), &record));
            root.next_tuple()?;
        }
        // LIMIT without ORDER BY is applied at the root.
        if select.order_by.is_empty() {
            if let Some(limit) = select.limit {
                rows.truncate(limit);
            }
        }

        Ok(QueryResult {
            columns,
            rows,
            affected_rows: 0,
            message: None,
        })
    }

    /// Pick an index scan when some condition provides an equality or
    /// lower bound on the leading key column; otherwise scan the heap.
    fn make_scan(
        &self,
        ctx: &Context,
        tab_name: &str,
        conds: Vec<Condition>,
    ) -> Result<Box<dyn Executor>> {
        let tab = ctx.sm.get_table(tab_name)?;
        for meta in &tab.indexes {
            let leading = &meta.cols[0].name;
            let usable = conds.iter().any(|cond| {
                cond.lhs.tab_name == tab_name
                    && &cond.lhs.col_name == leading
                    && cond.rhs_val.is_some()
                    && matches!(cond.op, CompOp::Eq | CompOp::Gt | CompOp::Ge)
            });
            if usable {
                return Ok(Box::new(IndexScanExecutor::new(
                    ctx.clone(),
                    tab_name,
                    meta.clone(),
                    conds,
                )?));
            }
        }
        Ok(Box::new(SeqScanExecutor::new(ctx.clone(), tab_name, conds)?))
    }

    /// Collect the rids a DELETE/UPDATE statement touches.
    fn collect_rids(
        &self,
        ctx: &Context,
        tab_name: &str,
        conds: Vec<Condition>,
    ) -> Result<Vec<Rid>> {
        let mut scan = self.make_scan(ctx, tab_name, conds)?;
        let mut rids = Vec::new();
        scan.begin_tuple()?;
        while !scan.is_end() {
            rids.push(scan.rid());
            scan.next_tuple()?;
        }
        Ok(rids)
    }

    /// Resolve a possibly-unqualified column reference against the FROM
    /// tables.
    fn resolve_col(&self, ctx: &Context, tables: &[String], col: &ColRef) -> Result<TabCol> {
        match &col.tab_name {
            Some(tab_name) => {
                if !tables.contains(tab_name) {
                    return Err(Error::TableNotFound(tab_name.clone()));
                }
                ctx.sm.get_table(tab_name)?.get_col(&col.col_name)?;
                Ok(TabCol::new(tab_name, &col.col_name))
            }
            None => {
                let mut owner: Option<&String> = None;
                for table in tables {
                    if ctx.sm.get_table(table)?.is_col(&col.col_name) {
                        if owner.is_some() {
                            return Err(Error::AmbiguousColumn(col.col_name.clone()));
                        }
                        owner = Some(table);
                    }
                }
                match owner {
                    Some(table) => Ok(TabCol::new(table, &col.col_name)),
                    None => Err(Error::ColumnNotFound(col.col_name.clone())),
                }
            }
        }
    }

    /// Resolve and type-check a WHERE clause.
    fn bind_conds(
        &self,
        ctx: &Context,
        tables: &[String],
        conds: Vec<CondExpr>,
    ) -> Result<Vec<Condition>> {
        let mut out = Vec::with_capacity(conds.len());
        for cond in conds {
            let lhs = self.resolve_col(ctx, tables, &cond.lhs)?;
            let lhs_meta = ctx.sm.get_table(&lhs.tab_name)?.get_col(&lhs.col_name)?.clone();
            let bound = match cond.rhs {
                CondRhs::Value(value) => {
                    check_predicate_types(&lhs_meta.col_type, lhs_meta.len, &value)?;
                    Condition {
                        lhs,
                        op: cond.op,
                        rhs_col: None,
                        rhs_val: Some(value),
                    }
                }
                CondRhs::Col(col) => {
                    let rhs = self.resolve_col(ctx, tables, &col)?;
                    let rhs_meta =
                        ctx.sm.get_table(&rhs.tab_name)?.get_col(&rhs.col_name)?.clone();
                    check_column_types(&lhs_meta.col_type, &rhs_meta.col_type)?;
                    Condition {
                        lhs,
                        op: cond.op,
                        rhs_col: Some(rhs),
                        rhs_val: None,
                    }
                }
            };
            out.push(bound);
        }
        Ok(out)
    }
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Predicate type rules: exact match, INT<->BIGINT, string literals
/// against CHAR and DATETIME columns.
fn check_predicate_types(col_type: &ColType, _len: usize, value: &Value) -> Result<()> {
    let ok = matches!(
        (col_type, value),
        (ColType::Int, Value::Int(_))
            | (ColType::Int, Value::BigInt(_))
            | (ColType::BigInt, Value::Int(_))
            | (ColType::BigInt, Value::BigInt(_))
            | (ColType::Float, Value::Float(_))
            | (ColType::Char, Value::Str(_))
            | (ColType::Char, Value::Datetime(_))
            | (ColType::Datetime, Value::Str(_))
            | (ColType::Datetime, Value::Datetime(_))
    );
    if ok {
        Ok(())
    } else {
        Err(Error::IncompatibleType {
            lhs: col_type.to_string(),
            rhs: value.col_type().to_string(),
        })
    }
}

/// Column-to-column comparability.
fn check_column_types(lhs: &ColType, rhs: &ColType) -> Result<()> {
    let ok = lhs == rhs
        || matches!(
            (lhs, rhs),
            (ColType::Int, ColType::BigInt)
                | (ColType::BigInt, ColType::Int)
                | (ColType::Char, ColType::Datetime)
                | (ColType::Datetime, ColType::Char)
        );
    if ok {
        Ok(())
    } else {
        Err(Error::IncompatibleType {
            lhs: lhs.to_string(),
            rhs: rhs.to_string(),
        })
    }
}
