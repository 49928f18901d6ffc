//! Idempotent database/table/index provisioning.
//!
//! Every check-then-create pair tolerates losing a race to another creator: a
//! `SchemaConflict` from the create counts as success.

use log::{debug, info};
use std::sync::atomic::AtomicBool;
use thiserror::Error;

use crate::db::store::{IndexSpec, Store, StoreError, TableSpec};
use crate::retry::{RetryPolicies, RetryPolicy, with_retry};

#[derive(Debug, Error)]
#[error("provisioning step '{step}' failed after {attempts} attempt(s): {source}")]
pub struct ProvisioningFailed {
    pub step: String,
    pub attempts: u32,
    #[source]
    pub source: StoreError,
}

impl ProvisioningFailed {
    pub fn is_cancelled(&self) -> bool {
        self.source.is_cancelled()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchemaReport {
    pub tables_created: usize,
    pub indexes_created: usize,
}

fn step<T, F>(policy: &RetryPolicy, cancel: &AtomicBool, step: String, action: F) -> Result<T, ProvisioningFailed>
where
    F: FnMut() -> Result<T, StoreError>,
{
    step_if(policy, cancel, step, StoreError::is_transient, action)
}

fn step_if<T, P, F>(
    policy: &RetryPolicy,
    cancel: &AtomicBool,
    step: String,
    retryable: P,
    action: F,
) -> Result<T, ProvisioningFailed>
where
    P: Fn(&StoreError) -> bool,
    F: FnMut() -> Result<T, StoreError>,
{
    with_retry(policy, &format!("Provision: {}", step), cancel, retryable, action).map_err(|e| ProvisioningFailed {
        step,
        attempts: e.attempts(),
        source: e.into_source(),
    })
}

/// `Ok(true)` when we created the object, `Ok(false)` when someone beat us to it.
fn created(result: Result<(), StoreError>) -> Result<bool, StoreError> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_schema_conflict() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Make sure database `name` exists and select it for all later operations.
pub fn ensure_database<S: Store + ?Sized>(
    store: &mut S,
    name: &str,
    policies: &RetryPolicies,
    cancel: &AtomicBool,
) -> Result<(), ProvisioningFailed> {
    let exists = step(&policies.schema, cancel, format!("check database {}", name), || {
        store.database_exists(name)
    })?;
    if !exists {
        let made = step(&policies.schema, cancel, format!("create database {}", name), || {
            created(store.create_database(name))
        })?;
        if made {
            info!("Provision: created database {}", name);
        } else {
            info!("Provision: database {} was created concurrently", name);
        }
    }
    step(&policies.connect, cancel, format!("select database {}", name), || {
        store.use_database(name)
    })?;
    debug!("Provision: using database {}", name);
    Ok(())
}

/// Block until `table` answers a count. A table that is not visible yet is
/// reported as `Rejected`, so that is polled too.
pub fn wait_for_table<S: Store + ?Sized>(
    store: &mut S,
    table: &str,
    policy: &RetryPolicy,
    cancel: &AtomicBool,
) -> Result<u64, ProvisioningFailed> {
    step_if(
        policy,
        cancel,
        format!("wait for table {}", table),
        |e| e.is_transient() || matches!(e, StoreError::Rejected(_)),
        || store.count(table),
    )
}

fn ensure_table<S: Store + ?Sized>(
    store: &mut S,
    spec: &TableSpec,
    policies: &RetryPolicies,
    cancel: &AtomicBool,
) -> Result<bool, ProvisioningFailed> {
    let exists = step(&policies.schema, cancel, format!("check table {}", spec.name), || {
        store.table_exists(spec.name)
    })?;
    let made = if exists {
        false
    } else {
        let made = step(&policies.schema, cancel, format!("create table {}", spec.name), || {
            created(store.create_table(spec))
        })?;
        if made {
            info!("Provision: created table {}", spec.name);
        } else {
            info!("Provision: table {} was created concurrently", spec.name);
        }
        made
    };
    wait_for_table(store, spec.name, &policies.table_wait, cancel)?;
    Ok(made)
}

fn ensure_index<S: Store + ?Sized>(
    store: &mut S,
    index: &IndexSpec,
    policy: &RetryPolicy,
    cancel: &AtomicBool,
) -> Result<bool, ProvisioningFailed> {
    let exists = step(policy, cancel, format!("check index {}.{}", index.table, index.field), || {
        store.index_exists(index.table, index.field)
    })?;
    if exists {
        return Ok(false);
    }
    let made = step(policy, cancel, format!("create index {}.{}", index.table, index.field), || {
        created(store.create_index(index.table, index.field))
    })?;
    if made {
        info!("Provision: created index {}.{}", index.table, index.field);
    }
    Ok(made)
}

/// Create whatever tables and indexes are missing. All tables are in place
/// (and answering queries) before the first index is attempted.
pub fn ensure_schema<S: Store + ?Sized>(
    store: &mut S,
    tables: &[TableSpec],
    indexes: &[IndexSpec],
    policies: &RetryPolicies,
    cancel: &AtomicBool,
) -> Result<SchemaReport, ProvisioningFailed> {
    let mut report = SchemaReport::default();
    for spec in tables {
        if ensure_table(store, spec, policies, cancel)? {
            report.tables_created += 1;
        }
    }
    for index in indexes {
        if ensure_index(store, index, &policies.schema, cancel)? {
            report.indexes_created += 1;
        }
    }
    info!(
        "Provision: schema ready ({} table(s), {} index(es) created)",
        report.tables_created, report.indexes_created
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{MemoryConnector, MemoryStore};
    use crate::db::store::Connector;
    use crate::schema::{INDEXES, TABLES};
    use std::num::NonZeroU32;
    use std::time::Duration;

    fn policies(attempts: u32) -> RetryPolicies {
        let p = RetryPolicy::new(NonZeroU32::new(attempts).unwrap(), Duration::ZERO);
        RetryPolicies {
            connect: p,
            schema: p,
            table_wait: p,
            insert: p,
        }
    }

    fn no_shutdown() -> AtomicBool {
        AtomicBool::new(false)
    }

    fn selected(connector: &MemoryConnector) -> MemoryStore {
        let mut store = connector.connect().unwrap();
        ensure_database(&mut store, "sensors", &policies(1), &no_shutdown()).unwrap();
        store
    }

    #[test]
    fn database_is_created_once_and_selected() {
        let connector = MemoryConnector::new();
        let mut store = connector.connect().unwrap();
        ensure_database(&mut store, "sensors", &policies(1), &no_shutdown()).unwrap();
        ensure_database(&mut store, "sensors", &policies(1), &no_shutdown()).unwrap();
        let state = connector.state();
        assert_eq!(state.databases.len(), 1);
        assert_eq!(state.current.as_deref(), Some("sensors"));
    }

    #[test]
    fn schema_is_created_then_left_alone() {
        let connector = MemoryConnector::new();
        let mut store = selected(&connector);

        let first = ensure_schema(&mut store, &TABLES, &INDEXES, &policies(1), &no_shutdown()).unwrap();
        assert_eq!(first.tables_created, 4);
        assert_eq!(first.indexes_created, 11);

        let second = ensure_schema(&mut store, &TABLES, &INDEXES, &policies(1), &no_shutdown()).unwrap();
        assert_eq!(second, SchemaReport::default());

        let state = connector.state();
        assert_eq!(state.table_creates, 4);
        assert_eq!(state.index_creates, 11);
        assert_eq!(state.tables.len(), 4);
        for index in INDEXES {
            assert!(state.tables[index.table].indexes.contains(index.field));
        }
    }

    #[test]
    fn lost_creation_race_counts_as_success() {
        let connector = MemoryConnector::new();
        let mut store = selected(&connector);
        connector.state().faults.racing_tables.insert("readings".into());

        let report = ensure_schema(&mut store, &TABLES, &INDEXES, &policies(1), &no_shutdown()).unwrap();
        assert_eq!(report.tables_created, 3);
        assert!(connector.state().tables.contains_key("readings"));
    }

    #[test]
    fn transient_create_failures_are_retried() {
        let connector = MemoryConnector::new();
        let mut store = selected(&connector);
        connector.state().faults.table_create_failures = 2;

        let report = ensure_schema(&mut store, &TABLES, &INDEXES, &policies(3), &no_shutdown()).unwrap();
        assert_eq!(report.tables_created, 4);
    }

    #[test]
    fn exhausted_budget_names_the_step() {
        let connector = MemoryConnector::new();
        let mut store = selected(&connector);
        connector.state().faults.table_create_failures = 10;

        let err = ensure_schema(&mut store, &TABLES, &INDEXES, &policies(2), &no_shutdown()).unwrap_err();
        assert_eq!(err.step, "create table buildings");
        assert_eq!(err.attempts, 2);
        assert!(err.source.is_transient());
        assert!(connector.state().tables.is_empty());
    }

    #[test]
    fn rejected_statements_are_not_retried() {
        let connector = MemoryConnector::new();
        let mut store = connector.connect().unwrap();
        // no database selected
        let err = ensure_schema(&mut store, &TABLES, &INDEXES, &policies(5), &no_shutdown()).unwrap_err();
        assert_eq!(err.step, "check table buildings");
        assert_eq!(err.attempts, 1);
        assert!(matches!(err.source, StoreError::Rejected(_)));
    }

    #[test]
    fn table_wait_polls_until_visible() {
        let connector = MemoryConnector::new();
        let mut store = selected(&connector);
        let err = wait_for_table(&mut store, "readings", &RetryPolicy::new(NonZeroU32::new(3).unwrap(), Duration::ZERO), &no_shutdown())
            .unwrap_err();
        assert_eq!(err.attempts, 3);

        ensure_schema(&mut store, &TABLES, &[], &policies(1), &no_shutdown()).unwrap();
        assert_eq!(wait_for_table(&mut store, "readings", &RetryPolicy::once(), &no_shutdown()).unwrap(), 0);
    }

    #[test]
    fn requested_shutdown_stops_provisioning() {
        let connector = MemoryConnector::new();
        let mut store = selected(&connector);
        connector.state().faults.table_create_failures = 10;

        let err = ensure_schema(&mut store, &TABLES, &INDEXES, &policies(5), &AtomicBool::new(true)).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.step, "check table buildings");
        assert_eq!(err.attempts, 0);
        assert_eq!(connector.state().table_creates, 0);
    }
}
