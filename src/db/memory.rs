//! In-process store used by the test suite, with switches for injecting the
//! failures the generator has to survive.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::db::store::{Connector, Document, Filter, Store, StoreError, TableSpec};

#[derive(Debug, Default)]
pub struct MemoryTable {
    pub primary_key: String,
    pub rows: BTreeMap<String, Value>,
    pub indexes: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct Faults {
    /// Upcoming `connect` calls that fail transiently.
    pub connect_failures: u32,
    /// Upcoming `create_table` calls that fail transiently.
    pub table_create_failures: u32,
    /// Upcoming `insert_batch` calls that fail transiently.
    pub insert_failures: u32,
    /// Tables whose inserts keep failing transiently until removed.
    pub unwritable_tables: BTreeSet<String>,
    /// Tables another writer "wins": created, but reported as a conflict.
    pub racing_tables: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryState {
    pub databases: BTreeSet<String>,
    pub current: Option<String>,
    pub tables: BTreeMap<String, MemoryTable>,
    pub faults: Faults,
    pub open_connections: usize,
    pub table_creates: usize,
    pub index_creates: usize,
    pub insert_calls: usize,
}

impl MemoryState {
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map(|t| t.rows.len()).unwrap_or(0)
    }

    fn table(&self, name: &str) -> Result<&MemoryTable, StoreError> {
        self.selected()?;
        self.tables
            .get(name)
            .ok_or_else(|| StoreError::Rejected(format!("table {} does not exist", name)))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemoryTable, StoreError> {
        self.selected()?;
        self.tables
            .get_mut(name)
            .ok_or_else(|| StoreError::Rejected(format!("table {} does not exist", name)))
    }

    fn selected(&self) -> Result<(), StoreError> {
        match self.current {
            Some(_) => Ok(()),
            None => Err(StoreError::Rejected("no database selected".into())),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    pub fn open(&self) -> MemoryStore {
        self.state().open_connections += 1;
        MemoryStore {
            state: Arc::clone(&self.state),
        }
    }
}

impl Connector for MemoryConnector {
    type Store = MemoryStore;

    fn connect(&self) -> Result<MemoryStore, StoreError> {
        {
            let mut state = self.state();
            if state.faults.connect_failures > 0 {
                state.faults.connect_failures -= 1;
                return Err(StoreError::Transient("connection refused".into()));
            }
        }
        Ok(self.open())
    }
}

pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.open_connections -= 1;
        }
    }
}

impl Store for MemoryStore {
    fn database_exists(&mut self, name: &str) -> Result<bool, StoreError> {
        Ok(self.state().databases.contains(name))
    }

    fn create_database(&mut self, name: &str) -> Result<(), StoreError> {
        if self.state().databases.insert(name.to_string()) {
            Ok(())
        } else {
            Err(StoreError::SchemaConflict(format!("database {} already exists", name)))
        }
    }

    fn use_database(&mut self, name: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        if !state.databases.contains(name) {
            return Err(StoreError::Rejected(format!("database {} does not exist", name)));
        }
        state.current = Some(name.to_string());
        Ok(())
    }

    fn table_exists(&mut self, name: &str) -> Result<bool, StoreError> {
        let state = self.state();
        state.selected()?;
        Ok(state.tables.contains_key(name))
    }

    fn create_table(&mut self, spec: &TableSpec) -> Result<(), StoreError> {
        let mut state = self.state();
        state.selected()?;
        if state.faults.table_create_failures > 0 {
            state.faults.table_create_failures -= 1;
            return Err(StoreError::Transient(format!("timeout creating {}", spec.name)));
        }
        if state.tables.contains_key(spec.name) {
            return Err(StoreError::SchemaConflict(format!("table {} already exists", spec.name)));
        }
        state.tables.insert(
            spec.name.to_string(),
            MemoryTable {
                primary_key: spec.primary_key.to_string(),
                ..MemoryTable::default()
            },
        );
        if state.faults.racing_tables.remove(spec.name) {
            return Err(StoreError::SchemaConflict(format!("table {} already exists", spec.name)));
        }
        state.table_creates += 1;
        Ok(())
    }

    fn index_exists(&mut self, table: &str, field: &str) -> Result<bool, StoreError> {
        Ok(self.state().table(table)?.indexes.contains(field))
    }

    fn create_index(&mut self, table: &str, field: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        if !state.table_mut(table)?.indexes.insert(field.to_string()) {
            return Err(StoreError::SchemaConflict(format!("index {}.{} already exists", table, field)));
        }
        state.index_creates += 1;
        Ok(())
    }

    fn count(&mut self, table: &str) -> Result<u64, StoreError> {
        Ok(self.state().table(table)?.rows.len() as u64)
    }

    fn insert_batch(&mut self, table: &str, docs: &[Document]) -> Result<usize, StoreError> {
        let mut state = self.state();
        state.insert_calls += 1;
        if state.faults.insert_failures > 0 {
            state.faults.insert_failures -= 1;
            return Err(StoreError::Transient(format!("timeout writing {}", table)));
        }
        if state.faults.unwritable_tables.contains(table) {
            return Err(StoreError::Transient(format!("{} is read-only", table)));
        }
        let target = state.table_mut(table)?;
        let mut inserted = 0;
        for doc in docs {
            if doc.body.get(&target.primary_key).and_then(Value::as_str) != Some(doc.key.as_str()) {
                return Err(StoreError::Rejected(format!("key {} does not match document", doc.key)));
            }
            if !target.rows.contains_key(&doc.key) {
                target.rows.insert(doc.key.clone(), doc.body.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn scan(&mut self, table: &str, filter: Option<&Filter>) -> Result<Vec<Value>, StoreError> {
        let state = self.state();
        let rows = &state.table(table)?.rows;
        Ok(rows
            .values()
            .filter(|doc| filter.is_none_or(|f| f.matches(doc)))
            .cloned()
            .collect())
    }

    fn clear(&mut self, table: &str) -> Result<(), StoreError> {
        self.state().table_mut(table)?.rows.clear();
        Ok(())
    }
}
