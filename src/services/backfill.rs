//! Historical backfill: one reading per sensor per day over the trailing
//! 24 months, written in bounded batches.

use chrono::{DateTime, Duration, Months, NaiveTime, SecondsFormat, Utc};
use log::{debug, info};
use rand::Rng;
use std::iter;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

use crate::db::models::{Reading, Sensor};
use crate::db::store::{Store, StoreError};
use crate::retry::RetryPolicy;
use crate::services::ingest::{InsertFailed, insert_with_retry};
use crate::services::readings::create_reading;

pub const HISTORY_MONTHS: u32 = 24;
pub const DEFAULT_BATCH_SIZE: usize = 1000;
const PROGRESS_EVERY_BATCHES: u64 = 100;

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("backfill insert failed after {attempts} attempt(s): {source}")]
    Insert {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("backfill cancelled")]
    Cancelled,
}

impl From<InsertFailed> for BackfillError {
    fn from(e: InsertFailed) -> Self {
        if e.is_cancelled() {
            return BackfillError::Cancelled;
        }
        BackfillError::Insert {
            attempts: e.attempts,
            source: e.source,
        }
    }
}

/// Daily timestamps from `start` while `<= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BackfillWindow {
    /// Window starting at midnight UTC of the same calendar day
    /// `HISTORY_MONTHS` ago (clamped to month end, so Feb 29 maps to Feb 28).
    pub fn ending_at(now: DateTime<Utc>) -> Self {
        let start_day = now
            .date_naive()
            .checked_sub_months(Months::new(HISTORY_MONTHS))
            .expect("history start is within the supported date range");
        BackfillWindow {
            start: start_day.and_time(NaiveTime::MIN).and_utc(),
            end: now,
        }
    }

    pub fn timestamps(&self) -> impl Iterator<Item = DateTime<Utc>> + use<> {
        let end = self.end;
        iter::successors(Some(self.start), |ts| Some(*ts + Duration::days(1))).take_while(move |ts| *ts <= end)
    }

    pub fn day_count(&self) -> u64 {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start).num_days() as u64 + 1
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackfillSummary {
    pub sensors: usize,
    pub readings: u64,
    pub batches: u64,
}

struct BatchWriter<'a, S: ?Sized> {
    store: &'a mut S,
    policy: &'a RetryPolicy,
    cancel: &'a AtomicBool,
    expected: u64,
    summary: BackfillSummary,
}

impl<S: Store + ?Sized> BatchWriter<'_, S> {
    fn flush(&mut self, batch: &mut Vec<Reading>) -> Result<(), BackfillError> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.cancel.load(Ordering::SeqCst) {
            info!(
                "Backfill: shutdown requested, stopping after {} of {} readings",
                self.summary.readings, self.expected
            );
            return Err(BackfillError::Cancelled);
        }
        insert_with_retry(&mut *self.store, batch.as_slice(), self.policy, self.cancel)?;
        self.summary.readings += batch.len() as u64;
        self.summary.batches += 1;
        debug!(
            "Backfill: batch {} written ({} readings so far)",
            self.summary.batches, self.summary.readings
        );
        if self.summary.batches % PROGRESS_EVERY_BATCHES == 0 {
            info!("Backfill: inserted {} of {} readings", self.summary.readings, self.expected);
        }
        batch.clear();
        Ok(())
    }
}

/// Generate and insert the history for every sensor in `sensors`. Each batch
/// goes through `policy`; `cancel` is checked before every batch and between
/// insert retries.
pub fn run<S: Store + ?Sized, R: Rng + ?Sized>(
    store: &mut S,
    sensors: &[Sensor],
    window: &BackfillWindow,
    batch_size: NonZeroUsize,
    policy: &RetryPolicy,
    rng: &mut R,
    cancel: &AtomicBool,
) -> Result<BackfillSummary, BackfillError> {
    let expected = window.day_count() * sensors.len() as u64;
    info!(
        "Backfill: {} sensor(s) x {} day(s) from {} to {} ({} readings, batch size {})",
        sensors.len(),
        window.day_count(),
        window.start.to_rfc3339_opts(SecondsFormat::Secs, true),
        window.end.to_rfc3339_opts(SecondsFormat::Secs, true),
        expected,
        batch_size
    );

    let mut writer = BatchWriter {
        store,
        policy,
        cancel,
        expected,
        summary: BackfillSummary::default(),
    };
    let mut batch = Vec::with_capacity(batch_size.get());
    for sensor in sensors {
        for ts in window.timestamps() {
            batch.push(create_reading(sensor, ts, Utc::now(), rng));
            if batch.len() >= batch_size.get() {
                writer.flush(&mut batch)?;
            }
        }
        // a batch never spans two sensors
        writer.flush(&mut batch)?;
        writer.summary.sensors += 1;
    }

    info!(
        "Backfill: complete, {} readings in {} batch(es)",
        writer.summary.readings, writer.summary.batches
    );
    Ok(writer.summary)
}
