//! Store gateway: the narrow table-store contract the generator is written
//! against, plus typed helpers for moving records in and out of it.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::retry::Cancelled;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection dropped, timed out, or the server asked us to try again.
    #[error("transient store error: {0}")]
    Transient(String),
    /// The object being created already exists (possibly created concurrently).
    #[error("schema object already exists: {0}")]
    SchemaConflict(String),
    #[error("store rejected request: {0}")]
    Rejected(String),
    #[error("document codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("store connection is closed")]
    Closed,
    /// The caller gave up waiting because shutdown was requested.
    #[error("cancelled by shutdown request")]
    Cancelled,
}

impl From<Cancelled> for StoreError {
    fn from(_: Cancelled) -> Self {
        StoreError::Cancelled
    }
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn is_schema_conflict(&self) -> bool {
        matches!(self, StoreError::SchemaConflict(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled)
    }
}

/// Table definition: name plus the document field that acts as primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub primary_key: &'static str,
}

/// Secondary index over a single top-level document field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub table: &'static str,
    pub field: &'static str,
}

/// A keyed JSON document as stored in a table.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub key: String,
    pub body: Value,
}

/// Equality filter on the text form of a top-level field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub field: String,
    pub value: String,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Filter {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, doc: &Value) -> bool {
        doc.get(&self.field).and_then(field_text).as_deref() == Some(self.value.as_str())
    }
}

/// Text rendering of a JSON field, mirroring PostgreSQL's `->>` operator.
pub fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub trait Store {
    fn database_exists(&mut self, name: &str) -> Result<bool, StoreError>;
    fn create_database(&mut self, name: &str) -> Result<(), StoreError>;
    /// Point subsequent table operations at `name`.
    fn use_database(&mut self, name: &str) -> Result<(), StoreError>;

    fn table_exists(&mut self, name: &str) -> Result<bool, StoreError>;
    fn create_table(&mut self, spec: &TableSpec) -> Result<(), StoreError>;

    fn index_exists(&mut self, table: &str, field: &str) -> Result<bool, StoreError>;
    /// Returns only once the index can serve queries.
    fn create_index(&mut self, table: &str, field: &str) -> Result<(), StoreError>;

    fn count(&mut self, table: &str) -> Result<u64, StoreError>;
    /// Insert documents, skipping keys that already exist. Returns the number
    /// of rows actually written.
    fn insert_batch(&mut self, table: &str, docs: &[Document]) -> Result<usize, StoreError>;
    /// Documents ordered by key, optionally restricted by `filter`.
    fn scan(&mut self, table: &str, filter: Option<&Filter>) -> Result<Vec<Value>, StoreError>;
    fn clear(&mut self, table: &str) -> Result<(), StoreError>;
}

/// Opens connections to a store.
pub trait Connector {
    type Store: Store + Send + 'static;

    fn connect(&self) -> Result<Self::Store, StoreError>;
}

/// Typed row that lives in a fixed table under a string key.
pub trait Record: Serialize + DeserializeOwned {
    const TABLE: &'static str;

    fn key(&self) -> &str;

    fn to_document(&self) -> Result<Document, StoreError> {
        Ok(Document {
            key: self.key().to_string(),
            body: serde_json::to_value(self)?,
        })
    }
}

pub fn to_documents<R: Record>(rows: &[R]) -> Result<Vec<Document>, StoreError> {
    rows.iter().map(R::to_document).collect()
}

pub fn insert_records<S: Store + ?Sized, R: Record>(store: &mut S, rows: &[R]) -> Result<usize, StoreError> {
    if rows.is_empty() {
        return Ok(0);
    }
    let docs = to_documents(rows)?;
    store.insert_batch(R::TABLE, &docs)
}

pub fn load_records<S: Store + ?Sized, R: Record>(store: &mut S, filter: Option<&Filter>) -> Result<Vec<R>, StoreError> {
    store
        .scan(R::TABLE, filter)?
        .into_iter()
        .map(|doc| serde_json::from_value(doc).map_err(StoreError::from))
        .collect()
}
