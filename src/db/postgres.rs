//! PostgreSQL implementation of the store gateway.
//!
//! Every table is a keyed JSONB document collection:
//! `(id TEXT PRIMARY KEY, doc JSONB NOT NULL)`, with a check constraint tying
//! `id` to the document's own primary-key field. Secondary indexes are
//! expression indexes over `doc->>'field'`, which is also what `scan` filters
//! on, so the CRUD API can query the documents with the same field names.

use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::result::{ConnectionError, DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{Array, BigInt, Bool, Jsonb, Text};
use log::{debug, info};
use serde_json::Value;
use std::thread;
use std::time::Duration;

use crate::db::store::{Connector, Document, Filter, Store, StoreError, TableSpec};
use crate::utils::{is_plain_identifier, with_database};

const INDEX_READY_POLLS: u32 = 50;
const INDEX_READY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(QueryableByName)]
struct Flag {
    #[diesel(sql_type = Bool)]
    present: bool,
}

#[derive(QueryableByName)]
struct Total {
    #[diesel(sql_type = BigInt)]
    total: i64,
}

#[derive(QueryableByName)]
struct DocRow {
    #[diesel(sql_type = Jsonb)]
    doc: Value,
}

#[derive(Debug, Clone)]
pub struct PgConnector {
    database_url: String,
}

impl PgConnector {
    /// `database_url` should point at a database that always exists (e.g.
    /// `postgres`); the provisioner switches to the target database itself.
    pub fn new(database_url: impl Into<String>) -> Self {
        PgConnector {
            database_url: database_url.into(),
        }
    }
}

impl Connector for PgConnector {
    type Store = PgStore;

    fn connect(&self) -> Result<PgStore, StoreError> {
        let conn = PgConnection::establish(&self.database_url).map_err(classify_connection_error)?;
        info!("Connected to database server");
        Ok(PgStore {
            base_url: self.database_url.clone(),
            conn: Some(conn),
        })
    }
}

pub struct PgStore {
    base_url: String,
    /// `None` after a failed database switch; every call then reports `Closed`.
    conn: Option<PgConnection>,
}

impl PgStore {
    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        self.conn.as_mut().ok_or(StoreError::Closed)
    }

    fn flag(&mut self, query: &str, binds: &[&str]) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let row: Flag = match binds {
            [a] => diesel::sql_query(query).bind::<Text, _>(*a).get_result::<Flag>(conn),
            [a, b] => diesel::sql_query(query)
                .bind::<Text, _>(*a)
                .bind::<Text, _>(*b)
                .get_result::<Flag>(conn),
            _ => diesel::sql_query(query).get_result::<Flag>(conn),
        }
        .map_err(classify)?;
        Ok(row.present)
    }

    fn wait_for_index(&mut self, index_name: &str) -> Result<(), StoreError> {
        for poll in 0..INDEX_READY_POLLS {
            let ready = self.flag(
                "SELECT COALESCE(bool_and(i.indisvalid AND i.indisready), false) AS present \
                 FROM pg_index i \
                 JOIN pg_class c ON c.oid = i.indexrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE c.relname = $1 AND n.nspname = current_schema()",
                &[index_name],
            )?;
            if ready {
                debug!("Index {} ready after {} poll(s)", index_name, poll + 1);
                return Ok(());
            }
            thread::sleep(INDEX_READY_INTERVAL);
        }
        Err(StoreError::Transient(format!("index {} not ready", index_name)))
    }
}

impl Store for PgStore {
    fn database_exists(&mut self, name: &str) -> Result<bool, StoreError> {
        self.flag(
            "SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1) AS present",
            &[name],
        )
    }

    fn create_database(&mut self, name: &str) -> Result<(), StoreError> {
        let name = checked(name)?;
        diesel::sql_query(format!("CREATE DATABASE \"{}\"", name))
            .execute(self.conn()?)
            .map_err(classify)?;
        Ok(())
    }

    fn use_database(&mut self, name: &str) -> Result<(), StoreError> {
        let name = checked(name)?;
        let url = with_database(&self.base_url, name).map_err(StoreError::Rejected)?;
        // release the server-level connection before opening the new one
        self.conn = None;
        let conn = PgConnection::establish(&url).map_err(classify_connection_error)?;
        self.conn = Some(conn);
        info!("Using database \"{}\"", name);
        Ok(())
    }

    fn table_exists(&mut self, name: &str) -> Result<bool, StoreError> {
        self.flag(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1) AS present",
            &[name],
        )
    }

    fn create_table(&mut self, spec: &TableSpec) -> Result<(), StoreError> {
        let table = checked(spec.name)?;
        let key = checked(spec.primary_key)?;
        diesel::sql_query(format!(
            "CREATE TABLE \"{table}\" (\
                id TEXT PRIMARY KEY, \
                doc JSONB NOT NULL, \
                CONSTRAINT \"{table}_key_matches\" CHECK (doc->>'{key}' = id))"
        ))
        .execute(self.conn()?)
        .map_err(classify)?;
        Ok(())
    }

    fn index_exists(&mut self, table: &str, field: &str) -> Result<bool, StoreError> {
        let index_name = index_name(table, field);
        self.flag(
            "SELECT EXISTS (SELECT 1 FROM pg_indexes \
             WHERE schemaname = current_schema() AND tablename = $1 AND indexname = $2) AS present",
            &[table, index_name.as_str()],
        )
    }

    fn create_index(&mut self, table: &str, field: &str) -> Result<(), StoreError> {
        let table = checked(table)?;
        let field = checked(field)?;
        let index_name = index_name(table, field);
        diesel::sql_query(format!(
            "CREATE INDEX \"{index_name}\" ON \"{table}\" ((doc->>'{field}'))"
        ))
        .execute(self.conn()?)
        .map_err(classify)?;
        self.wait_for_index(&index_name)
    }

    fn count(&mut self, table: &str) -> Result<u64, StoreError> {
        let table = checked(table)?;
        let row: Total = diesel::sql_query(format!("SELECT COUNT(*) AS total FROM \"{}\"", table))
            .get_result::<Total>(self.conn()?)
            .map_err(classify)?;
        Ok(u64::try_from(row.total).unwrap_or(0))
    }

    fn insert_batch(&mut self, table: &str, docs: &[Document]) -> Result<usize, StoreError> {
        if docs.is_empty() {
            return Ok(0);
        }
        let table = checked(table)?;
        let keys: Vec<String> = docs.iter().map(|d| d.key.clone()).collect();
        let bodies: Vec<Value> = docs.iter().map(|d| d.body.clone()).collect();
        diesel::sql_query(format!(
            "INSERT INTO \"{table}\" (id, doc) \
             SELECT k, d FROM UNNEST($1::text[], $2::jsonb[]) AS batch(k, d) \
             ON CONFLICT (id) DO NOTHING"
        ))
        .bind::<Array<Text>, _>(keys)
        .bind::<Array<Jsonb>, _>(bodies)
        .execute(self.conn()?)
        .map_err(classify)
    }

    fn scan(&mut self, table: &str, filter: Option<&Filter>) -> Result<Vec<Value>, StoreError> {
        let table = checked(table)?;
        let conn = self.conn()?;
        let rows: Vec<DocRow> = match filter {
            Some(f) => diesel::sql_query(format!(
                "SELECT doc FROM \"{}\" WHERE doc->>$1 = $2 ORDER BY id",
                table
            ))
            .bind::<Text, _>(&f.field)
            .bind::<Text, _>(&f.value)
            .load::<DocRow>(conn),
            None => diesel::sql_query(format!("SELECT doc FROM \"{}\" ORDER BY id", table)).load::<DocRow>(conn),
        }
        .map_err(classify)?;
        Ok(rows.into_iter().map(|r| r.doc).collect())
    }

    fn clear(&mut self, table: &str) -> Result<(), StoreError> {
        let table = checked(table)?;
        diesel::sql_query(format!("TRUNCATE TABLE \"{}\"", table))
            .execute(self.conn()?)
            .map_err(classify)?;
        Ok(())
    }
}

fn index_name(table: &str, field: &str) -> String {
    format!("{}_{}_idx", table, field)
}

fn checked(name: &str) -> Result<&str, StoreError> {
    if is_plain_identifier(name) {
        Ok(name)
    } else {
        Err(StoreError::Rejected(format!("refusing non-plain identifier {:?}", name)))
    }
}

/// Two sessions racing on `CREATE DATABASE`/`TABLE`/`INDEX` can surface as a unique
/// violation on a system catalog index instead of "already exists".
fn is_catalog_race(kind: &DatabaseErrorKind, message: &str) -> bool {
    matches!(kind, DatabaseErrorKind::UniqueViolation)
        && ["pg_type_typname_nsp_index", "pg_class_relname_nsp_index", "pg_database_datname_index"]
            .iter()
            .any(|index| message.contains(index))
}

fn is_transient_message(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("timeout")
        || m.contains("terminating connection")
        || m.contains("could not connect")
        || m.contains("the database system is starting up")
        || m.contains("deadlock detected")
}

fn classify(err: DieselError) -> StoreError {
    match err {
        DieselError::DatabaseError(kind, info) => {
            let message = info.message().to_string();
            if message.contains("already exists") || is_catalog_race(&kind, &message) {
                return StoreError::SchemaConflict(message);
            }
            match kind {
                DatabaseErrorKind::ClosedConnection
                | DatabaseErrorKind::SerializationFailure
                | DatabaseErrorKind::UnableToSendCommand => StoreError::Transient(message),
                _ if is_transient_message(&message) => StoreError::Transient(message),
                _ => StoreError::Rejected(message),
            }
        }
        DieselError::BrokenTransactionManager => StoreError::Transient("broken transaction manager".to_string()),
        other => StoreError::Rejected(other.to_string()),
    }
}

fn classify_connection_error(err: ConnectionError) -> StoreError {
    match err {
        ConnectionError::InvalidConnectionUrl(msg) => StoreError::Rejected(msg),
        ConnectionError::CouldntSetupConfiguration(inner) => classify(inner),
        other => StoreError::Transient(other.to_string()),
    }
}
