//! Generator lifecycle: provision, seed or resume, backfill, then keep
//! emitting readings on a background ticker until disconnected.

use chrono::{DateTime, Utc};
use log::{info, warn};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::Serialize;
use std::io;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::db::models::{Sensor, tables};
use crate::db::store::{Connector, Store, StoreError, load_records};
use crate::retry::{RetryError, RetryPolicies, RetryPolicy, with_retry};
use crate::schema::{INDEXES, TABLES};
use crate::services::backfill::{self, BackfillError, BackfillWindow};
use crate::services::entities;
use crate::services::ingest::InsertFailed;
use crate::services::provision::{ProvisioningFailed, ensure_database, ensure_schema};
use crate::services::realtime::{self, TickStats, Ticker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Provisioning,
    Backfilling,
    Steady,
    Stopped,
    Failed,
}

impl Phase {
    pub fn is_running(self) -> bool {
        matches!(self, Phase::Provisioning | Phase::Backfilling | Phase::Steady)
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    /// Database created (if missing) and used for all four tables.
    pub database: String,
    pub building_count: usize,
    pub batch_size: NonZeroUsize,
    pub steady_interval: Duration,
    /// Fixed RNG seed for reproducible data; `None` seeds from the OS.
    pub seed: Option<u64>,
    pub retry: RetryPolicies,
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error(transparent)]
    Provisioning(ProvisioningFailed),
    #[error("{step} failed after {attempts} attempt(s): {source}")]
    Store {
        step: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Backfill(BackfillError),
    #[error("initialization cancelled by shutdown request")]
    Cancelled,
    #[error("generator is already running (phase {0:?})")]
    AlreadyRunning(Phase),
    #[error("failed to start the steady ticker: {0}")]
    Spawn(#[source] io::Error),
}

impl GeneratorError {
    /// True when the error only reflects a requested shutdown.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GeneratorError::Cancelled)
    }

    fn store(step: impl Into<String>, e: RetryError<StoreError>) -> Self {
        if e.is_cancelled() {
            return GeneratorError::Cancelled;
        }
        GeneratorError::Store {
            step: step.into(),
            attempts: e.attempts(),
            source: e.into_source(),
        }
    }
}

impl From<BackfillError> for GeneratorError {
    fn from(e: BackfillError) -> Self {
        match e {
            BackfillError::Cancelled => GeneratorError::Cancelled,
            other => GeneratorError::Backfill(other),
        }
    }
}

impl From<ProvisioningFailed> for GeneratorError {
    fn from(e: ProvisioningFailed) -> Self {
        if e.is_cancelled() {
            return GeneratorError::Cancelled;
        }
        GeneratorError::Provisioning(e)
    }
}

impl From<InsertFailed> for GeneratorError {
    fn from(e: InsertFailed) -> Self {
        if e.is_cancelled() {
            return GeneratorError::Cancelled;
        }
        GeneratorError::Store {
            step: format!("insert into {}", e.table),
            attempts: e.attempts,
            source: e.source,
        }
    }
}

/// Cloneable, thread-safe request to abandon startup. Connection attempts,
/// provisioning, seeding and backfill all stop at their next retry or batch.
/// Requests are sticky: once made, every later `initialize` is cancelled.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    fn flag(&self) -> &AtomicBool {
        &self.requested
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GeneratorStatus {
    pub phase: Phase,
    pub sensor_count: usize,
    pub ticking: bool,
    pub connected: bool,
    pub ticks_emitted: u64,
    pub ticks_failed: u64,
}

pub struct Generator<C: Connector> {
    connector: C,
    settings: GeneratorSettings,
    phase: Phase,
    store: Option<Arc<Mutex<C::Store>>>,
    sensors: Arc<Vec<Sensor>>,
    ticker: Option<Ticker>,
    stats: Arc<TickStats>,
    shutdown: ShutdownHandle,
    rng: SmallRng,
    clock: fn() -> DateTime<Utc>,
}

impl<C: Connector> Generator<C> {
    pub fn new(connector: C, settings: GeneratorSettings) -> Self {
        let rng = settings
            .seed
            .map(SmallRng::seed_from_u64)
            .unwrap_or_else(SmallRng::from_os_rng);
        Generator {
            connector,
            settings,
            phase: Phase::Idle,
            store: None,
            sensors: Arc::new(Vec::new()),
            ticker: None,
            stats: Arc::new(TickStats::default()),
            shutdown: ShutdownHandle::default(),
            rng,
            clock: Utc::now,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn status(&self) -> GeneratorStatus {
        GeneratorStatus {
            phase: self.phase,
            sensor_count: self.sensors.len(),
            ticking: self.ticker.is_some(),
            connected: self.store.is_some(),
            ticks_emitted: self.stats.emitted(),
            ticks_failed: self.stats.failed(),
        }
    }

    /// Bring the store up to date and start steady emission. Returns once the
    /// first steady tick has been written and the ticker is running.
    ///
    /// On any error the generator ends up disconnected: `Failed`, or
    /// `Stopped` when a shutdown request cancelled startup.
    pub fn initialize(&mut self, regenerate: bool) -> Result<(), GeneratorError> {
        if self.phase.is_running() {
            return Err(GeneratorError::AlreadyRunning(self.phase));
        }
        self.stats = Arc::new(TickStats::default());
        match self.start(regenerate) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.teardown();
                self.phase = match e {
                    GeneratorError::Cancelled => Phase::Stopped,
                    _ => Phase::Failed,
                };
                Err(e)
            }
        }
    }

    fn start(&mut self, regenerate: bool) -> Result<(), GeneratorError> {
        self.phase = Phase::Provisioning;
        let retry = self.settings.retry;
        let shutdown = self.shutdown.clone();
        let cancel = shutdown.flag();

        let connector = &self.connector;
        let conn = with_retry(&retry.connect, "Generator: connect", cancel, StoreError::is_transient, || {
            connector.connect()
        })
        .map_err(|e| GeneratorError::store("connect", e))?;
        info!("Generator: connected to store");
        let store = Arc::new(Mutex::new(conn));
        self.store = Some(Arc::clone(&store));

        {
            let mut guard = store.lock().unwrap_or_else(PoisonError::into_inner);
            let conn = &mut *guard;
            ensure_database(conn, &self.settings.database, &retry, cancel)?;
            ensure_schema(conn, &TABLES, &INDEXES, &retry, cancel)?;

            let existing = count_rows(conn, tables::READINGS, &retry.schema, cancel)?;

            if existing == 0 || regenerate {
                if regenerate {
                    info!("Generator: regenerating all data ({} existing readings)", existing);
                    clear_tables(conn, &retry.schema, cancel)?;
                } else {
                    // entities left behind by an interrupted first run
                    let mut leftover = 0;
                    for table in [tables::BUILDINGS, tables::CONTACTS, tables::SENSORS] {
                        leftover += count_rows(conn, table, &retry.schema, cancel)?;
                    }
                    if leftover > 0 {
                        warn!(
                            "Generator: {} entity row(s) but no readings, discarding them before seeding",
                            leftover
                        );
                        clear_tables(conn, &retry.schema, cancel)?;
                    } else {
                        info!("Generator: store is empty, generating initial data");
                    }
                }
                self.phase = Phase::Backfilling;
                self.sensors = Arc::new(self.seed_and_backfill(conn)?);
            } else {
                let sensors: Vec<Sensor> =
                    with_retry(&retry.schema, "Generator: load sensors", cancel, StoreError::is_transient, || {
                        load_records(conn, None)
                    })
                    .map_err(|e| GeneratorError::store("load sensors", e))?;
                info!(
                    "Generator: found {} existing readings, resuming with {} sensor(s)",
                    existing,
                    sensors.len()
                );
                self.sensors = Arc::new(sensors);
            }
        }

        self.phase = Phase::Steady;
        realtime::tick(&*store, &self.sensors, &mut self.rng, &retry.insert, cancel, &self.stats);
        let ticker = Ticker::spawn(
            store,
            Arc::clone(&self.sensors),
            self.settings.steady_interval,
            retry.insert,
            SmallRng::from_rng(&mut self.rng),
            Arc::clone(&self.stats),
        )
        .map_err(GeneratorError::Spawn)?;
        self.ticker = Some(ticker);
        info!(
            "Generator: steady state, {} sensor(s) every {}s",
            self.sensors.len(),
            self.settings.steady_interval.as_secs()
        );
        Ok(())
    }

    fn seed_and_backfill(&mut self, conn: &mut C::Store) -> Result<Vec<Sensor>, GeneratorError> {
        let retry = self.settings.retry;
        let now = (self.clock)();
        let cancel = self.shutdown.flag();
        let seeded =
            entities::seed_entities(conn, self.settings.building_count, now, &mut self.rng, &retry.insert, cancel)?;
        backfill::run(
            conn,
            &seeded.sensors,
            &BackfillWindow::ending_at(now),
            self.settings.batch_size,
            &retry.insert,
            &mut self.rng,
            cancel,
        )?;
        Ok(seeded.sensors)
    }

    fn teardown(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.stop();
        }
        if self.store.take().is_some() {
            info!("Generator: connection released");
        }
    }

    /// Stop the ticker and release the connection. Safe to call in any phase,
    /// any number of times.
    pub fn disconnect(&mut self) {
        self.teardown();
        if self.phase != Phase::Stopped {
            info!("Generator: stopped (was {:?})", self.phase);
        }
        self.phase = Phase::Stopped;
    }
}

impl<C: Connector> Drop for Generator<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn count_rows<S: Store + ?Sized>(
    store: &mut S,
    table: &str,
    policy: &RetryPolicy,
    cancel: &AtomicBool,
) -> Result<u64, GeneratorError> {
    with_retry(policy, &format!("Generator: count {}", table), cancel, StoreError::is_transient, || {
        store.count(table)
    })
    .map_err(|e| GeneratorError::store(format!("count {}", table), e))
}

fn clear_tables<S: Store + ?Sized>(store: &mut S, policy: &RetryPolicy, cancel: &AtomicBool) -> Result<(), GeneratorError> {
    // children first, so a partial failure never leaves orphans behind
    for table in [tables::READINGS, tables::SENSORS, tables::CONTACTS, tables::BUILDINGS] {
        with_retry(policy, &format!("Generator: clear {}", table), cancel, StoreError::is_transient, || {
            store.clear(table)
        })
        .map_err(|e| GeneratorError::store(format!("clear {}", table), e))?;
        warn!("Generator: cleared table {}", table);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryConnector;
    use crate::db::models::{Building, Contact, Reading};
    use chrono::TimeZone;
    use std::collections::{BTreeMap, BTreeSet};
    use std::num::NonZeroU32;
    use std::thread;
    use std::time::Instant;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 1, 12, 30, 0).unwrap()
    }

    fn settings(interval: Duration) -> GeneratorSettings {
        GeneratorSettings {
            database: "sensors".into(),
            building_count: 3,
            batch_size: NonZeroUsize::new(500).unwrap(),
            steady_interval: interval,
            seed: Some(17),
            retry: RetryPolicies::immediate(),
        }
    }

    fn hourly(connector: &MemoryConnector) -> Generator<MemoryConnector> {
        let mut generator = Generator::new(connector.clone(), settings(Duration::from_secs(3600)));
        generator.clock = fixed_now;
        generator
    }

    fn stored<T: serde::de::DeserializeOwned>(connector: &MemoryConnector, table: &str) -> Vec<T> {
        connector
            .state()
            .rows(table)
            .into_iter()
            .map(|doc| serde_json::from_value(doc).unwrap())
            .collect()
    }

    fn request_shutdown_after(handle: ShutdownHandle, delay: Duration) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            thread::sleep(delay);
            handle.request();
        })
    }

    fn readings(connector: &MemoryConnector) -> Vec<Reading> {
        stored(connector, tables::READINGS)
    }

    #[test]
    fn empty_store_is_provisioned_seeded_and_backfilled() {
        let connector = MemoryConnector::new();
        let mut generator = hourly(&connector);
        generator.initialize(false).unwrap();

        let status = generator.status();
        assert_eq!(status.phase, Phase::Steady);
        assert!(status.ticking && status.connected);
        assert_eq!((status.ticks_emitted, status.ticks_failed), (1, 0));

        let state = connector.state();
        assert_eq!(state.tables.len(), 4);
        assert_eq!(state.index_creates, 11);
        assert_eq!(state.row_count(tables::BUILDINGS), 3);
        assert!(state.row_count(tables::CONTACTS) >= 6);
        assert_eq!(state.row_count(tables::SENSORS), status.sensor_count);
        assert!((9..=18).contains(&status.sensor_count));

        // daily history plus the immediate steady tick
        let days = BackfillWindow::ending_at(fixed_now()).day_count() as usize;
        assert_eq!(days, 732);
        assert_eq!(state.row_count(tables::READINGS), status.sensor_count * (days + 1));
    }

    #[test]
    fn existing_readings_resume_without_regenerating() {
        let connector = MemoryConnector::new();
        let mut first = hourly(&connector);
        first.initialize(false).unwrap();
        let sensor_count = first.status().sensor_count;
        first.disconnect();

        let buildings_before: BTreeSet<String> = connector
            .state()
            .rows(tables::BUILDINGS)
            .into_iter()
            .map(|doc| serde_json::from_value::<Building>(doc).unwrap().building_id)
            .collect();
        let readings_before = connector.state().row_count(tables::READINGS);

        let mut second = Generator::new(connector.clone(), GeneratorSettings {
            seed: Some(99),
            ..settings(Duration::from_secs(3600))
        });
        second.clock = fixed_now;
        second.initialize(false).unwrap();
        assert_eq!(second.status().sensor_count, sensor_count);
        assert_eq!(connector.state().row_count(tables::BUILDINGS), 3);
        let buildings_after: BTreeSet<String> = connector
            .state()
            .rows(tables::BUILDINGS)
            .into_iter()
            .map(|doc| serde_json::from_value::<Building>(doc).unwrap().building_id)
            .collect();
        assert_eq!(buildings_before, buildings_after);
        assert_eq!(connector.state().row_count(tables::READINGS), readings_before + sensor_count);
    }

    #[test]
    fn regenerate_replaces_previous_data() {
        let connector = MemoryConnector::new();
        let mut generator = hourly(&connector);
        generator.initialize(false).unwrap();
        generator.disconnect();

        generator.initialize(true).unwrap();
        let sensor_count = generator.status().sensor_count;
        assert_eq!(connector.state().row_count(tables::BUILDINGS), 3);
        assert_eq!(connector.state().row_count(tables::SENSORS), sensor_count);

        let current: BTreeSet<String> = connector
            .state()
            .rows(tables::SENSORS)
            .iter()
            .map(|doc| doc["sensor_id"].as_str().unwrap().to_string())
            .collect();
        assert!(readings(&connector).iter().all(|r| current.contains(&r.sensor_id)));
    }

    #[test]
    fn disconnect_stops_emission_and_releases_connection() {
        let connector = MemoryConnector::new();
        let mut generator = Generator::new(connector.clone(), settings(Duration::from_millis(10)));
        generator.clock = fixed_now;
        generator.initialize(false).unwrap();

        let start = Instant::now();
        while generator.status().ticks_emitted < 3 && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(generator.status().ticks_emitted >= 3);

        generator.disconnect();
        let status = generator.status();
        assert_eq!(status.phase, Phase::Stopped);
        assert!(!status.ticking && !status.connected);
        assert_eq!(connector.state().open_connections, 0);

        let after = connector.state().row_count(tables::READINGS);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(connector.state().row_count(tables::READINGS), after);

        generator.disconnect();
        assert_eq!(generator.phase(), Phase::Stopped);
    }

    #[test]
    fn second_initialize_while_running_is_refused() {
        let connector = MemoryConnector::new();
        let mut generator = hourly(&connector);
        generator.initialize(false).unwrap();
        let err = generator.initialize(false).unwrap_err();
        assert!(matches!(err, GeneratorError::AlreadyRunning(Phase::Steady)));
        assert!(generator.status().connected);
    }

    #[test]
    fn unreachable_store_leaves_generator_failed() {
        let connector = MemoryConnector::new();
        connector.state().faults.connect_failures = 3;
        let mut generator = hourly(&connector);

        let err = generator.initialize(false).unwrap_err();
        assert!(matches!(&err, GeneratorError::Store { step, attempts: 1, .. } if step == "connect"));
        assert_eq!(generator.phase(), Phase::Failed);
        assert!(!generator.status().connected);
    }

    #[test]
    fn failed_seeding_releases_everything() {
        let connector = MemoryConnector::new();
        connector.state().faults.insert_failures = 100;
        let mut generator = hourly(&connector);

        let err = generator.initialize(false).unwrap_err();
        assert!(matches!(&err, GeneratorError::Store { step, .. } if step == "insert into buildings"));
        let status = generator.status();
        assert_eq!(status.phase, Phase::Failed);
        assert!(!status.connected && !status.ticking);
        assert_eq!(connector.state().open_connections, 0);

        // failed generators can be started again
        connector.state().faults.insert_failures = 0;
        generator.initialize(false).unwrap();
        assert_eq!(generator.phase(), Phase::Steady);
    }

    #[test]
    fn shutdown_requested_before_start_skips_connecting() {
        let connector = MemoryConnector::new();
        let mut generator = hourly(&connector);
        generator.shutdown_handle().request();

        let err = generator.initialize(false).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(generator.phase(), Phase::Stopped);
        assert_eq!(connector.state().open_connections, 0);
        assert!(connector.state().databases.is_empty());
    }

    #[test]
    fn shutdown_interrupts_connect_retries() {
        let connector = MemoryConnector::new();
        connector.state().faults.connect_failures = 100;
        let mut generator = hourly(&connector);
        generator.settings.retry.connect = RetryPolicy::new(NonZeroU32::new(50).unwrap(), Duration::from_millis(200));
        let requester = request_shutdown_after(generator.shutdown_handle(), Duration::from_millis(50));

        let start = Instant::now();
        let err = generator.initialize(false).unwrap_err();
        requester.join().unwrap();
        assert!(err.is_cancelled(), "{err}");
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(generator.phase(), Phase::Stopped);
        assert!(!generator.status().connected);
    }

    #[test]
    fn restart_after_interrupted_backfill_reseeds_cleanly() {
        let connector = MemoryConnector::new();
        connector.state().faults.unwritable_tables.insert(tables::READINGS.into());
        let mut first = hourly(&connector);
        first.settings.retry.insert = RetryPolicy::new(NonZeroU32::new(1000).unwrap(), Duration::from_millis(20));
        let requester = request_shutdown_after(first.shutdown_handle(), Duration::from_millis(100));

        let err = first.initialize(false).unwrap_err();
        requester.join().unwrap();
        assert!(err.is_cancelled(), "{err}");
        assert_eq!(first.phase(), Phase::Stopped);
        assert_eq!(connector.state().row_count(tables::BUILDINGS), 3);
        assert!(connector.state().row_count(tables::SENSORS) > 0);
        assert_eq!(connector.state().row_count(tables::READINGS), 0);

        connector.state().faults.unwritable_tables.clear();
        let mut second = Generator::new(connector.clone(), GeneratorSettings {
            seed: Some(99),
            ..settings(Duration::from_secs(3600))
        });
        second.clock = fixed_now;
        second.initialize(false).unwrap();

        let sensors: Vec<Sensor> = stored(&connector, tables::SENSORS);
        assert_eq!(sensors.len(), second.status().sensor_count);
        let mut per_building: BTreeMap<String, usize> = BTreeMap::new();
        for s in &sensors {
            *per_building.entry(s.building_id.clone()).or_default() += 1;
        }
        assert_eq!(per_building.len(), 3);
        assert!(per_building.values().all(|n| (3..=6).contains(n)), "{per_building:?}");

        let contacts: Vec<Contact> = stored(&connector, tables::CONTACTS);
        for building in per_building.keys() {
            let primaries = contacts
                .iter()
                .filter(|c| &c.building_id == building && c.is_primary_emergency)
                .count();
            assert_eq!(primaries, 1, "{building}");
        }

        let days = BackfillWindow::ending_at(fixed_now()).day_count() as usize;
        assert_eq!(connector.state().row_count(tables::READINGS), sensors.len() * (days + 1));
        let known: BTreeSet<&str> = sensors.iter().map(|s| s.sensor_id.as_str()).collect();
        assert!(readings(&connector).iter().all(|r| known.contains(r.sensor_id.as_str())));
    }

    #[test]
    fn status_serializes_phase_by_name() {
        let connector = MemoryConnector::new();
        let generator = hourly(&connector);
        let value = serde_json::to_value(generator.status()).unwrap();
        assert_eq!(value["phase"], "idle");
        assert_eq!(value["sensor_count"], 0);
        assert_eq!(value["connected"], false);
    }

    #[test]
    fn dropping_generator_disconnects() {
        let connector = MemoryConnector::new();
        let mut generator = hourly(&connector);
        generator.initialize(false).unwrap();
        assert_eq!(connector.state().open_connections, 1);
        drop(generator);
        assert_eq!(connector.state().open_connections, 0);
    }
}
