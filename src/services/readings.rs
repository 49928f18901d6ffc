//! Per-type signal model for synthetic sensor readings.
//!
//! The constants and the functional form are what the existing history in
//! deployed databases was generated with; changing them makes new readings
//! visibly discontinuous on the dashboards.

use chrono::{DateTime, Datelike, Timelike, Utc};
use rand::Rng;
use std::f64::consts::PI;
use uuid::Uuid;

use crate::db::models::{READING_PREFIX, Reading, ReadingValue, Sensor, SensorType};
use crate::utils::round_to;

const FIRE_ALARM_PROBABILITY: f64 = 0.005;
const WATER_LEAK_PROBABILITY: f64 = 0.003;

/// Deterministic part of the model for numeric sensors, plus the width of the
/// uniform jitter added on top of it. `None` for boolean sensors.
pub fn baseline_for(sensor_type: SensorType, timestamp: DateTime<Utc>) -> Option<(f64, f64)> {
    let hour = timestamp.hour() as f64;
    // zero-based month (January = 0)
    let month = timestamp.month0() as f64;
    match sensor_type {
        SensorType::Temperature => Some((
            20.0 + 5.0 * (hour * PI / 12.0).sin() + 10.0 * ((month - 3.0) * PI / 6.0).sin(),
            2.0,
        )),
        SensorType::Humidity => Some((
            50.0 + 10.0 * ((hour - 6.0) * PI / 12.0).sin() + 10.0 * ((month - 6.0) * PI / 6.0).sin(),
            3.0,
        )),
        SensorType::Co2 => Some((400.0 + 100.0 * (hour * PI / 12.0).sin(), 50.0)),
        SensorType::Pressure => Some((100.0 + 2.0 * (hour * PI / 12.0).sin(), 3.0)),
        SensorType::FireAlarm | SensorType::WaterLeak => None,
    }
}

/// Value for `sensor_type` at `timestamp`. Numeric values are rounded to two
/// decimal places; flags are returned as drawn.
pub fn value_for<R: Rng + ?Sized>(sensor_type: SensorType, timestamp: DateTime<Utc>, rng: &mut R) -> ReadingValue {
    match sensor_type {
        SensorType::FireAlarm => ReadingValue::Flag(rng.random_bool(FIRE_ALARM_PROBABILITY)),
        SensorType::WaterLeak => ReadingValue::Flag(rng.random_bool(WATER_LEAK_PROBABILITY)),
        numeric => {
            let (base, jitter) = baseline_for(numeric, timestamp).unwrap_or((0.0, 0.0));
            let noise = jitter * rng.random::<f64>();
            ReadingValue::Numeric(round_to(base + noise, 2))
        }
    }
}

pub fn create_reading<R: Rng + ?Sized>(
    sensor: &Sensor,
    timestamp: DateTime<Utc>,
    created_at: DateTime<Utc>,
    rng: &mut R,
) -> Reading {
    Reading {
        reading_id: format!("{}{}", READING_PREFIX, Uuid::new_v4()),
        sensor_id: sensor.sensor_id.clone(),
        building_id: sensor.building_id.clone(),
        value: value_for(sensor.sensor_type, timestamp, rng),
        unit: sensor.unit.clone(),
        timestamp,
        created_at,
    }
}
