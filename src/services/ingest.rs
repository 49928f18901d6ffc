use std::sync::atomic::AtomicBool;
use thiserror::Error;

use crate::db::store::{Record, Store, StoreError, insert_records};
use crate::retry::{RetryPolicy, with_retry};

#[derive(Debug, Error)]
#[error("insert into {table} failed after {attempts} attempt(s): {source}")]
pub struct InsertFailed {
    pub table: &'static str,
    pub attempts: u32,
    #[source]
    pub source: StoreError,
}

impl InsertFailed {
    pub fn is_cancelled(&self) -> bool {
        self.source.is_cancelled()
    }
}

/// Insert `rows` as one batch, retrying transient failures under `policy`
/// until `cancel` is set.
pub fn insert_with_retry<S: Store + ?Sized, R: Record>(
    store: &mut S,
    rows: &[R],
    policy: &RetryPolicy,
    cancel: &AtomicBool,
) -> Result<usize, InsertFailed> {
    if rows.is_empty() {
        return Ok(0);
    }
    let label = format!("Insert {} row(s) into {}", rows.len(), R::TABLE);
    with_retry(policy, &label, cancel, StoreError::is_transient, || insert_records(store, rows)).map_err(|e| InsertFailed {
        table: R::TABLE,
        attempts: e.attempts(),
        source: e.into_source(),
    })
}
