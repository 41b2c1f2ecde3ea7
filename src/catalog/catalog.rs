//! System catalog for OakDB
//!
//! Owns the database metadata (tables, columns, indexes), the registry of
//! open heap files and index handles, and the DDL operations. Metadata is
//! persisted as JSON next to the data files; page and log formats stay
//! hand-rolled binary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::schema::{ColMeta, IndexMeta, TabMeta};
use super::types::ColType;
use crate::error::{Error, Result};
use crate::storage::btree::{IxIndexHandle, IxManager};
use crate::storage::buffer_pool::BufferPoolManager;
use crate::storage::disk::DiskManager;
use crate::storage::heap::{RmFileHandle, RmManager, RmScan};
use crate::storage::page::INVALID_LSN;

/// File holding the serialized catalog
pub const META_FILE_NAME: &str = "db.meta";

/// Serializable database metadata
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DbMeta {
    pub tabs: HashMap<String, TabMeta>,
}

impl DbMeta {
    pub fn is_table(&self, name: &str) -> bool {
        self.tabs.contains_key(name)
    }

    pub fn get_table(&self, name: &str) -> Result<&TabMeta> {
        self.tabs
            .get(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }
}

/// Column declaration handed to `create_table`
#[derive(Debug, Clone)]
pub struct ColDef {
    pub name: String,
    pub col_type: ColType,
    pub len: usize,
}

/// System manager: catalog plus open storage handles
pub struct SmManager {
    db: RwLock<DbMeta>,
    rm: RmManager,
    ix: IxManager,
    fhs: RwLock<HashMap<String, Arc<RmFileHandle>>>,
    ihs: RwLock<HashMap<String, Arc<IxIndexHandle>>>,
    meta_path: PathBuf,
}

impl SmManager {
    /// Open the database in `disk`'s directory, loading the catalog and
    /// every table and index file it names.
    pub fn open(disk: Arc<DiskManager>, bpm: Arc<Mutex<BufferPoolManager>>) -> Result<SmManager> {
        let meta_path = disk.dir().join(META_FILE_NAME);
        let db = if meta_path.exists() {
            let json = std::fs::read_to_string(&meta_path)?;
            serde_json::from_str(&json).map_err(|e| Error::Internal(e.to_string()))?
        } else {
            DbMeta::default()
        };

        let sm = SmManager {
            db: RwLock::new(db),
            rm: RmManager::new(disk.clone(), bpm.clone()),
            ix: IxManager::new(disk, bpm),
            fhs: RwLock::new(HashMap::new()),
            ihs: RwLock::new(HashMap::new()),
            meta_path,
        };

        let tabs: Vec<TabMeta> = sm.db.read().tabs.values().cloned().collect();
        for tab in tabs {
            let fh = sm.rm.open_file(&tab.name)?;
            sm.fhs.write().insert(tab.name.clone(), fh);
            for index in &tab.indexes {
                let ih = sm.ix.open_index(&index.index_name())?;
                sm.ihs.write().insert(index.index_name(), ih);
            }
        }
        Ok(sm)
    }

    fn flush_meta(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&*self.db.read())
            .map_err(|e| Error::Internal(e.to_string()))?;
        std::fs::write(&self.meta_path, json)?;
        Ok(())
    }

    // ========== lookups ==========

    pub fn is_table(&self, name: &str) -> bool {
        self.db.read().is_table(name)
    }

    pub fn get_table(&self, name: &str) -> Result<TabMeta> {
        self.db.read().get_table(name).cloned()
    }

    pub fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.db.read().tabs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_file(&self, table: &str) -> Result<Arc<RmFileHandle>> {
        self.fhs
            .read()
            .get(table)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(table.to_string()))
    }

    pub fn get_index(&self, index_name: &str) -> Result<Arc<IxIndexHandle>> {
        self.ihs
            .read()
            .get(index_name)
            .cloned()
            .ok_or_else(|| Error::IndexNotFound(index_name.to_string()))
    }

    // ========== DDL ==========

    pub fn create_table(&self, name: &str, col_defs: &[ColDef]) -> Result<()> {
        if self.is_table(name) {
            return Err(Error::TableExists(name.to_string()));
        }
        let mut tab = TabMeta::new(name);
        for def in col_defs {
            tab.add_col(&def.name, def.col_type, def.len);
        }
        self.rm.create_file(name, tab.record_size())?;
        let fh = self.rm.open_file(name)?;
        self.fhs.write().insert(name.to_string(), fh);
        self.db.write().tabs.insert(name.to_string(), tab);
        self.flush_meta()?;
        info!("created table '{}'", name);
        Ok(())
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        let tab = self.get_table(name)?;
        for index in &tab.indexes {
            let index_name = index.index_name();
            self.ihs.write().remove(&index_name);
            self.ix.destroy_index(&index_name)?;
        }
        self.fhs.write().remove(name);
        self.rm.destroy_file(name)?;
        self.db.write().tabs.remove(name);
        self.flush_meta()?;
        info!("dropped table '{}'", name);
        Ok(())
    }

    /// Create an index on `col_names` and backfill it from the heap.
    /// `order` overrides the page-derived btree order.
    pub fn create_index(
        &self,
        tab_name: &str,
        col_names: &[String],
        order: Option<usize>,
    ) -> Result<()> {
        let tab = self.get_table(tab_name)?;
        if tab.get_index_meta(col_names).is_some() {
            return Err(Error::IndexExists(format!(
                "{}({})",
                tab_name,
                col_names.join(",")
            )));
        }
        let mut cols = Vec::with_capacity(col_names.len());
        for col_name in col_names {
            cols.push(tab.get_col(col_name)?.clone());
        }
        let meta = IndexMeta::new(tab_name, cols.clone());
        let index_name = meta.index_name();

        match order {
            Some(order) => self.ix.create_index_with_order(&index_name, &cols, order)?,
            None => self.ix.create_index(&index_name, &cols)?,
        }
        let ih = self.ix.open_index(&index_name)?;

        // Backfill from existing rows; a duplicate key aborts the build.
        let fh = self.get_file(tab_name)?;
        let mut scan = RmScan::new(fh.clone())?;
        while !scan.is_end() {
            let rid = scan.rid();
            let record = fh.get_record(rid)?;
            let key = meta.build_key(&record);
            if !ih.insert_entry(&key, rid, INVALID_LSN)? {
                drop(ih);
                self.ihs.write().remove(&index_name);
                self.ix.destroy_index(&index_name)?;
                return Err(Error::Internal(format!(
                    "uniqueness check failed while building index '{}'",
                    index_name
                )));
            }
            scan.next()?;
        }

        self.ihs.write().insert(index_name.clone(), ih);
        self.db
            .write()
            .tabs
            .get_mut(tab_name)
            .expect("table checked above")
            .indexes
            .push(meta);
        self.flush_meta()?;
        info!("created index '{}'", index_name);
        Ok(())
    }

    pub fn drop_index(&self, tab_name: &str, col_names: &[String]) -> Result<()> {
        let tab = self.get_table(tab_name)?;
        let meta = tab.get_index_meta(col_names).ok_or_else(|| {
            Error::IndexNotFound(format!("{}({})", tab_name, col_names.join(",")))
        })?;
        let index_name = meta.index_name();
        self.ihs.write().remove(&index_name);
        self.ix.destroy_index(&index_name)?;
        self.db
            .write()
            .tabs
            .get_mut(tab_name)
            .expect("table checked above")
            .indexes
            .retain(|ix| !ix.matches_columns(col_names));
        self.flush_meta()?;
        info!("dropped index '{}'", index_name);
        Ok(())
    }

    /// Flush headers and metadata; called at shutdown.
    pub fn close(&self) -> Result<()> {
        for fh in self.fhs.read().values() {
            fh.flush_header()?;
        }
        for ih in self.ihs.read().values() {
            ih.flush_header()?;
        }
        self.flush_meta()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SmManager) {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path()).unwrap());
        let bpm = Arc::new(Mutex::new(BufferPoolManager::new(64, disk.clone(), None)));
        let sm = SmManager::open(disk, bpm).unwrap();
        (dir, sm)
    }

    fn cols() -> Vec<ColDef> {
        vec![
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
        ]
    }

    #[test]
    fn test_create_and_drop_table() {
        let (_dir, sm) = setup();
        sm.create_table("t", &cols()).unwrap();
        assert!(sm.is_table("t"));
        assert!(sm.get_file("t").is_ok());
        assert!(matches!(
            sm.create_table("t", &cols()),
            Err(Error::TableExists(_))
        ));

        sm.drop_table("t").unwrap();
        assert!(!sm.is_table("t"));
        assert!(matches!(
            sm.drop_table("t"),
            Err(Error::TableNotFound(_))
        ));
    }

    #[test]
    fn test_create_index_backfills() {
        let (_dir, sm) = setup();
        sm.create_table("t", &cols()).unwrap();
        let fh = sm.get_file("t").unwrap();
        let tab = sm.get_table("t").unwrap();
        for i in 0..5i32 {
            let mut rec = vec![0u8; tab.record_size()];
            rec[..4].copy_from_slice(&i.to_le_bytes());
            fh.insert_record(&rec).unwrap();
        }

        sm.create_index("t", &["id".to_string()], None).unwrap();
        let ih = sm.get_index("t_id").unwrap();
        for i in 0..5i32 {
            assert!(ih.get_value(&i.to_le_bytes()).unwrap().is_some());
        }

        sm.drop_index("t", &["id".to_string()]).unwrap();
        assert!(sm.get_index("t_id").is_err());
    }

    #[test]
    fn test_duplicate_backfill_fails() {
        let (_dir, sm) = setup();
        sm.create_table("t", &cols()).unwrap();
        let fh = sm.get_file("t").unwrap();
        let rec = vec![0u8; 8];
        fh.insert_record(&rec).unwrap();
        fh.insert_record(&rec).unwrap();
        assert!(sm.create_index("t", &["id".to_string()], None).is_err());
        // The failed build leaves no index behind.
        assert!(sm.get_table("t").unwrap().indexes.is_empty());
    }

    #[test]
    fn test_meta_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let disk = Arc::new(DiskManager::new(dir.path()).unwrap());
            let bpm = Arc::new(Mutex::new(BufferPoolManager::new(64, disk.clone(), None)));
            let sm = SmManager::open(disk, bpm).unwrap();
            sm.create_table("t", &cols()).unwrap();
            sm.create_index("t", &["id".to_string()], None).unwrap();
            sm.close().unwrap();
        }
        let disk = Arc::new(DiskManager::new(dir.path()).unwrap());
        let bpm = Arc::new(Mutex::new(BufferPoolManager::new(64, disk.clone(), None)));
        let sm = SmManager::open(disk, bpm).unwrap();
        assert!(sm.is_table("t"));
        assert_eq!(sm.get_table("t").unwrap().indexes.len(), 1);
        assert!(sm.get_index("t_id").is_ok());
    }
}
