//! Steady-state emission: one reading per known sensor on a fixed cadence.

use chrono::{DateTime, SecondsFormat, Utc};
use log::{error, info, warn};
use rand::Rng;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

use crate::db::models::Sensor;
use crate::db::store::{Store, StoreError};
use crate::retry::RetryPolicy;
use crate::services::ingest::insert_with_retry;
use crate::services::readings::create_reading;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
#[error("tick for {sensors} sensor(s) failed after {attempts} attempt(s): {source}")]
pub struct TickFailure {
    pub sensors: usize,
    pub attempts: u32,
    #[source]
    pub source: StoreError,
}

impl TickFailure {
    pub fn is_cancelled(&self) -> bool {
        self.source.is_cancelled()
    }
}

#[derive(Debug, Default)]
pub struct TickStats {
    emitted: AtomicU64,
    failed: AtomicU64,
}

impl TickStats {
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Insert one reading per sensor stamped `now`. The store lock is held only
/// for the insert.
pub fn emit_tick<S: Store, R: Rng + ?Sized>(
    store: &Mutex<S>,
    sensors: &[Sensor],
    now: DateTime<Utc>,
    rng: &mut R,
    policy: &RetryPolicy,
    cancel: &AtomicBool,
) -> Result<usize, TickFailure> {
    let readings: Vec<_> = sensors.iter().map(|s| create_reading(s, now, now, rng)).collect();
    let mut guard = store.lock().unwrap_or_else(PoisonError::into_inner);
    insert_with_retry(&mut *guard, &readings, policy, cancel).map_err(|e| TickFailure {
        sensors: sensors.len(),
        attempts: e.attempts,
        source: e.source,
    })
}

/// One tick at the current wall-clock time; failures are logged and counted.
/// A tick abandoned through `cancel` counts as neither.
pub fn tick<S: Store, R: Rng + ?Sized>(
    store: &Mutex<S>,
    sensors: &[Sensor],
    rng: &mut R,
    policy: &RetryPolicy,
    cancel: &AtomicBool,
    stats: &TickStats,
) {
    let now = Utc::now();
    match emit_tick(store, sensors, now, rng, policy, cancel) {
        Ok(n) => {
            stats.emitted.fetch_add(1, Ordering::Relaxed);
            info!(
                "Steady: generated {} reading(s) at {}",
                n,
                now.to_rfc3339_opts(SecondsFormat::Secs, true)
            );
        }
        Err(e) if e.is_cancelled() => info!("Steady: tick abandoned, shutting down"),
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            error!("Steady: {}", e);
        }
    }
}

/// Background thread that calls [`tick`] every `period` until stopped.
#[derive(Debug)]
pub struct Ticker {
    stop: Sender<()>,
    stopping: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Ticker {
    pub fn spawn<S, R>(
        store: Arc<Mutex<S>>,
        sensors: Arc<Vec<Sensor>>,
        period: Duration,
        policy: RetryPolicy,
        mut rng: R,
        stats: Arc<TickStats>,
    ) -> io::Result<Ticker>
    where
        S: Store + Send + 'static,
        R: Rng + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let stopping = Arc::new(AtomicBool::new(false));
        let cancel = Arc::clone(&stopping);
        let handle = thread::Builder::new().name("steady-ticker".into()).spawn(move || {
            info!("Steady: ticker started, period {}s", period.as_secs_f64());
            loop {
                match stopped.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => tick(&*store, &sensors, &mut rng, &policy, &cancel, &stats),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("Steady: ticker stopped");
        })?;
        Ok(Ticker { stop, stopping, handle })
    }

    /// Signal the thread and wait for it. An in-flight insert finishes first;
    /// its remaining retries are skipped.
    pub fn stop(self) {
        self.stopping.store(true, Ordering::SeqCst);
        // the thread may already be gone; a failed send is fine
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("Steady: ticker thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{MemoryConnector, MemoryStore};
    use crate::db::models::{SensorStatus, SensorType, tables};
    use crate::db::store::Connector;
    use crate::retry::RetryPolicies;
    use crate::schema::{INDEXES, TABLES};
    use crate::services::provision::{ensure_database, ensure_schema};
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use std::time::Instant;

    fn sensors(n: usize) -> Vec<Sensor> {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let sensor_type = SensorType::ALL[i % SensorType::ALL.len()];
                Sensor {
                    sensor_id: format!("sns-{i}"),
                    building_id: "bld-1000".into(),
                    sensor_type,
                    unit: sensor_type.unit().into(),
                    installation_date: ts,
                    warranty_years: 1,
                    status: if i == 0 { SensorStatus::Offline } else { SensorStatus::Active },
                    last_maintenance_date: None,
                    created_at: ts,
                }
            })
            .collect()
    }

    fn ready(connector: &MemoryConnector) -> MemoryStore {
        let mut store = connector.connect().unwrap();
        let policies = RetryPolicies::immediate();
        let running = AtomicBool::new(false);
        ensure_database(&mut store, "sensors", &policies, &running).unwrap();
        ensure_schema(&mut store, &TABLES, &INDEXES, &policies, &running).unwrap();
        store
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn tick_covers_every_known_sensor() {
        let connector = MemoryConnector::new();
        let store = Mutex::new(ready(&connector));
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let mut rng = SmallRng::seed_from_u64(8);

        let n = emit_tick(&store, &sensors(7), now, &mut rng, &RetryPolicy::once(), &AtomicBool::new(false)).unwrap();
        assert_eq!(n, 7);
        let rows = connector.state().rows(tables::READINGS);
        assert_eq!(rows.len(), 7);
        assert!(rows.iter().all(|r| r["timestamp"] == serde_json::json!("2025-06-01T09:00:00Z")));
    }

    #[test]
    fn failed_tick_is_counted_not_fatal() {
        let connector = MemoryConnector::new();
        let store = Mutex::new(ready(&connector));
        connector.state().faults.insert_failures = 1;
        let stats = TickStats::default();
        let mut rng = SmallRng::seed_from_u64(8);
        let running = AtomicBool::new(false);

        tick(&store, &sensors(3), &mut rng, &RetryPolicy::once(), &running, &stats);
        assert_eq!((stats.emitted(), stats.failed()), (0, 1));
        tick(&store, &sensors(3), &mut rng, &RetryPolicy::once(), &running, &stats);
        assert_eq!((stats.emitted(), stats.failed()), (1, 1));

        tick(&store, &sensors(3), &mut rng, &RetryPolicy::once(), &AtomicBool::new(true), &stats);
        assert_eq!((stats.emitted(), stats.failed()), (1, 1));
    }

    #[test]
    fn ticker_survives_failures_and_stops_on_request() {
        let connector = MemoryConnector::new();
        let store = Arc::new(Mutex::new(ready(&connector)));
        connector.state().faults.insert_failures = 1;
        let stats = Arc::new(TickStats::default());

        let ticker = Ticker::spawn(
            Arc::clone(&store),
            Arc::new(sensors(2)),
            Duration::from_millis(10),
            RetryPolicy::once(),
            SmallRng::seed_from_u64(3),
            Arc::clone(&stats),
        )
        .unwrap();
        assert!(wait_until(Duration::from_secs(5), || stats.emitted() >= 2));
        ticker.stop();

        assert_eq!(stats.failed(), 1);
        let after_stop = connector.state().row_count(tables::READINGS);
        assert_eq!(after_stop as u64, 2 * stats.emitted());
        thread::sleep(Duration::from_millis(40));
        assert_eq!(connector.state().row_count(tables::READINGS), after_stop);
        assert_eq!(Arc::strong_count(&store), 1);
    }

    #[test]
    fn stop_skips_remaining_insert_retries() {
        let connector = MemoryConnector::new();
        let store = Arc::new(Mutex::new(ready(&connector)));
        connector.state().faults.unwritable_tables.insert(tables::READINGS.into());
        let stats = Arc::new(TickStats::default());

        let ticker = Ticker::spawn(
            Arc::clone(&store),
            Arc::new(sensors(2)),
            Duration::from_millis(10),
            RetryPolicy::new(std::num::NonZeroU32::new(1000).unwrap(), Duration::from_secs(1)),
            SmallRng::seed_from_u64(3),
            Arc::clone(&stats),
        )
        .unwrap();
        assert!(wait_until(Duration::from_secs(5), || connector.state().insert_calls >= 1));

        let start = Instant::now();
        ticker.stop();
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!((stats.emitted(), stats.failed()), (0, 0));
    }
}
