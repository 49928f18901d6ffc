//! Synthetic buildings, contacts and sensors.
//!
//! The `generate_*` functions are pure given `now` and an RNG;
//! `seed_entities` persists the three collections, one batch each.

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::sync::atomic::AtomicBool;
use uuid::Uuid;

use crate::db::models::{
    BUILDING_PREFIX, Building, BuildingType, CONTACT_PREFIX, Contact, ContactRole, Location, MaintenanceStatus,
    SENSOR_PREFIX, Sensor, SensorStatus, SensorType, WorkShift,
};
use crate::db::store::{Record, Store};
use crate::models::regions::{EMAIL_DOMAINS, FIRST_NAMES, GOVERNORATES, LAST_NAMES, STREETS};
use crate::retry::RetryPolicy;
use crate::sampling::WeightedChoice;
use crate::services::ingest::{InsertFailed, insert_with_retry};
use crate::utils::{round_to, serde_enum_name};

pub const DEFAULT_BUILDING_COUNT: usize = 150;

const FIRST_BUILDING_NUMBER: usize = 1000;
/// Max offset from the district reference point, per axis (≈1 km).
pub const LOCATION_JITTER_DEG: f64 = 0.01;
const MAX_BUILDING_AGE_YEARS: u32 = 30;
const MAX_FLOORS: u32 = 20;
const EXTRA_CONTACTS: std::ops::RangeInclusive<usize> = 1..=3;
pub const SENSORS_PER_BUILDING: std::ops::RangeInclusive<usize> = 3..=6;
const WARRANTY_YEARS: std::ops::RangeInclusive<u32> = 1..=4;
const HISTORY_DAYS: i64 = 2 * 365;
const RECENT_MAINTENANCE_DAYS: i64 = 30;

static SENSOR_STATUSES: LazyLock<WeightedChoice<SensorStatus>> = LazyLock::new(|| {
    WeightedChoice::new(vec![
        (SensorStatus::Active, 0.85),
        (SensorStatus::Inactive, 0.05),
        (SensorStatus::Maintenance, 0.04),
        (SensorStatus::Faulty, 0.03),
        (SensorStatus::Offline, 0.03),
    ])
    .expect("sensor status weights are valid")
});

#[derive(Debug, Clone, Default)]
pub struct SeededEntities {
    pub buildings: Vec<Building>,
    pub contacts: Vec<Contact>,
    pub sensors: Vec<Sensor>,
}

fn pick<'a, T, R: Rng + ?Sized>(items: &'a [T], rng: &mut R) -> &'a T {
    &items[rng.random_range(0..items.len())]
}

/// A uniformly random instant within `max_days` before `now`.
fn random_past<R: Rng + ?Sized>(now: DateTime<Utc>, max_days: i64, rng: &mut R) -> DateTime<Utc> {
    now - Duration::seconds(rng.random_range(0..max_days * 86_400))
}

fn person<R: Rng + ?Sized>(rng: &mut R) -> (String, String) {
    let first = *pick(&FIRST_NAMES, rng);
    let last = *pick(&LAST_NAMES, rng);
    let email = format!(
        "{}.{}{}@{}",
        first.to_lowercase(),
        last.to_lowercase().replace('-', ""),
        rng.random_range(1..100),
        pick(&EMAIL_DOMAINS, rng)
    );
    (format!("{} {}", first, last), email)
}

fn phone<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!("+9655{:07}", rng.random_range(0..10_000_000u32))
}

pub fn generate_buildings<R: Rng + ?Sized>(count: usize, now: DateTime<Utc>, rng: &mut R) -> Vec<Building> {
    (0..count)
        .map(|i| {
            let governorate = pick(&GOVERNORATES, rng);
            let district = pick(governorate.districts, rng);
            let lat = district.lat + rng.random_range(-LOCATION_JITTER_DEG..LOCATION_JITTER_DEG);
            let long = district.long + rng.random_range(-LOCATION_JITTER_DEG..LOCATION_JITTER_DEG);

            Building {
                building_id: format!("{}{}", BUILDING_PREFIX, FIRST_BUILDING_NUMBER + i),
                building_type: *pick(&BuildingType::ALL, rng),
                location: Location {
                    lat: round_to(lat, 6),
                    long: round_to(long, 6),
                },
                governorate: governorate.name.to_string(),
                district: district.name.to_string(),
                area: format!("Block {}", rng.random_range(1..=12)),
                street_address: format!("{} {}", rng.random_range(1..=300), pick(&STREETS, rng)),
                age_years: rng.random_range(0..MAX_BUILDING_AGE_YEARS),
                floor_count: rng.random_range(0..MAX_FLOORS).max(1),
                maintenance_status: *pick(&MaintenanceStatus::ALL, rng),
                last_inspection_date: random_past(now, HISTORY_DAYS, rng),
                created_at: now,
            }
        })
        .collect()
}

/// One round-the-clock emergency contact per building, then one to three regular ones.
pub fn generate_contacts<R: Rng + ?Sized>(buildings: &[Building], now: DateTime<Utc>, rng: &mut R) -> Vec<Contact> {
    let mut contacts = Vec::with_capacity(buildings.len() * (1 + EXTRA_CONTACTS.end()));
    for building in buildings {
        let (full_name, email) = person(rng);
        contacts.push(Contact {
            contact_id: format!("{}{}", CONTACT_PREFIX, Uuid::new_v4()),
            building_id: building.building_id.clone(),
            full_name,
            role: ContactRole::Emergency,
            phone: phone(rng),
            email,
            workshift: WorkShift::AroundTheClock,
            is_primary_emergency: true,
            created_at: now,
        });

        for _ in 0..rng.random_range(EXTRA_CONTACTS) {
            let (full_name, email) = person(rng);
            contacts.push(Contact {
                contact_id: format!("{}{}", CONTACT_PREFIX, Uuid::new_v4()),
                building_id: building.building_id.clone(),
                full_name,
                role: *pick(&ContactRole::REGULAR, rng),
                phone: phone(rng),
                email,
                workshift: if rng.random_bool(0.5) {
                    WorkShift::Day
                } else {
                    WorkShift::Night
                },
                is_primary_emergency: false,
                created_at: now,
            });
        }
    }
    contacts
}

pub fn generate_sensors<R: Rng + ?Sized>(buildings: &[Building], now: DateTime<Utc>, rng: &mut R) -> Vec<Sensor> {
    let mut sensors = Vec::with_capacity(buildings.len() * SENSORS_PER_BUILDING.end());
    for building in buildings {
        for _ in 0..rng.random_range(SENSORS_PER_BUILDING) {
            let sensor_type = *pick(&SensorType::ALL, rng);
            let status = *SENSOR_STATUSES.sample(rng);
            let last_maintenance_date =
                (status == SensorStatus::Maintenance).then(|| random_past(now, RECENT_MAINTENANCE_DAYS, rng));
            sensors.push(Sensor {
                sensor_id: format!("{}{}", SENSOR_PREFIX, Uuid::new_v4()),
                building_id: building.building_id.clone(),
                sensor_type,
                unit: sensor_type.unit().to_string(),
                installation_date: random_past(now, HISTORY_DAYS, rng),
                warranty_years: rng.random_range(WARRANTY_YEARS),
                status,
                last_maintenance_date,
                created_at: now,
            });
        }
    }
    sensors
}

/// Insert one collection, warning when some rows already existed.
fn persist<S: Store + ?Sized, T: Record>(
    store: &mut S,
    rows: &[T],
    policy: &RetryPolicy,
    cancel: &AtomicBool,
) -> Result<(), InsertFailed> {
    let inserted = insert_with_retry(store, rows, policy, cancel)?;
    if inserted < rows.len() {
        warn!(
            "Entities: {} of {} {} row(s) already existed and were kept",
            rows.len() - inserted,
            rows.len(),
            T::TABLE
        );
    }
    Ok(())
}

/// Generate and persist a fresh entity set. Each collection is written as a
/// single batch under `insert_policy`.
pub fn seed_entities<S: Store + ?Sized, R: Rng + ?Sized>(
    store: &mut S,
    building_count: usize,
    now: DateTime<Utc>,
    rng: &mut R,
    insert_policy: &RetryPolicy,
    cancel: &AtomicBool,
) -> Result<SeededEntities, InsertFailed> {
    let buildings = generate_buildings(building_count, now, rng);
    persist(store, &buildings, insert_policy, cancel)?;
    info!("Entities: generated {} buildings", buildings.len());

    let contacts = generate_contacts(&buildings, now, rng);
    persist(store, &contacts, insert_policy, cancel)?;
    info!("Entities: generated {} contacts", contacts.len());

    let sensors = generate_sensors(&buildings, now, rng);
    persist(store, &sensors, insert_policy, cancel)?;
    info!(
        "Entities: generated {} sensors (status mix: {})",
        sensors.len(),
        status_mix(&sensors)
    );

    Ok(SeededEntities {
        buildings,
        contacts,
        sensors,
    })
}

fn status_mix(sensors: &[Sensor]) -> String {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for s in sensors {
        let name = serde_enum_name(&s.status).unwrap_or_else(|| format!("{:?}", s.status));
        *counts.entry(name).or_default() += 1;
    }
    counts
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}
