//! Schema definitions for OakDB
//!
//! Column, table and index metadata. Records are fixed width: every column
//! has a declared byte length and a fixed offset inside the record.

use serde::{Deserialize, Serialize};

use super::types::ColType;
use crate::error::{Error, Result};

/// A (table, column) reference, as written in a query
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabCol {
    pub tab_name: String,
    pub col_name: String,
}

impl TabCol {
    pub fn new(tab_name: impl Into<String>, col_name: impl Into<String>) -> Self {
        Self {
            tab_name: tab_name.into(),
            col_name: col_name.into(),
        }
    }
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColMeta {
    /// Owning table
    pub tab_name: String,
    /// Column name
    pub name: String,
    /// Declared type
    pub col_type: ColType,
    /// Slot width in bytes
    pub len: usize,
    /// Byte offset inside the record
    pub offset: usize,
}

/// Index metadata: an ordered list of key columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    /// Owning table
    pub tab_name: String,
    /// Key columns, most significant first
    pub cols: Vec<ColMeta>,
    /// Concatenated key width in bytes
    pub col_tot_len: usize,
}

impl IndexMeta {
    pub fn new(tab_name: impl Into<String>, cols: Vec<ColMeta>) -> Self {
        let col_tot_len = cols.iter().map(|c| c.len).sum();
        Self {
            tab_name: tab_name.into(),
            cols,
            col_tot_len,
        }
    }

    /// Canonical index name, also used as the index file stem.
    pub fn index_name(&self) -> String {
        let mut name = self.tab_name.clone();
        for col in &self.cols {
            name.push('_');
            name.push_str(&col.name);
        }
        name
    }

    /// True if the index is keyed on exactly these columns, in order.
    pub fn matches_columns(&self, col_names: &[String]) -> bool {
        self.cols.len() == col_names.len()
            && self.cols.iter().zip(col_names).all(|(c, n)| &c.name == n)
    }

    /// True if any key column appears in `col_names` (used by UPDATE to
    /// decide which indexes a set list touches).
    pub fn touches_columns(&self, col_names: &[String]) -> bool {
        self.cols.iter().any(|c| col_names.contains(&c.name))
    }

    /// Extract the concatenated key for this index out of a record.
    pub fn build_key(&self, record: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.col_tot_len);
        for col in &self.cols {
            key.extend_from_slice(&record[col.offset..col.offset + col.len]);
        }
        key
    }

    pub fn col_types(&self) -> Vec<ColType> {
        self.cols.iter().map(|c| c.col_type).collect()
    }

    pub fn col_lens(&self) -> Vec<usize> {
        self.cols.iter().map(|c| c.len).collect()
    }
}

/// Table metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabMeta {
    /// Table name
    pub name: String,
    /// Columns in declaration order
    pub cols: Vec<ColMeta>,
    /// Indexes on this table
    pub indexes: Vec<IndexMeta>,
}

impl TabMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cols: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Append a column, assigning its record offset.
    pub fn add_col(&mut self, name: impl Into<String>, col_type: ColType, len: usize) {
        let offset = self.record_size();
        self.cols.push(ColMeta {
            tab_name: self.name.clone(),
            name: name.into(),
            col_type,
            len,
            offset,
        });
    }

    /// Total record width in bytes.
    pub fn record_size(&self) -> usize {
        self.cols.iter().map(|c| c.len).sum()
    }

    pub fn is_col(&self, name: &str) -> bool {
        self.cols.iter().any(|c| c.name == name)
    }

    pub fn get_col(&self, name: &str) -> Result<&ColMeta> {
        self.cols
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::ColumnNotFound(name.to_string()))
    }

    /// Find the index keyed on exactly `col_names`, if any.
    pub fn get_index_meta(&self, col_names: &[String]) -> Option<&IndexMeta> {
        self.indexes.iter().find(|ix| ix.matches_columns(col_names))
    }
}
