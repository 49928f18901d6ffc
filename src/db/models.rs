//! Document shapes for the four generated collections.
//!
//! Field names are part of the contract with the CRUD API and the dashboards
//! that read these tables, so serde names must not drift.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::store::Record;

pub const BUILDING_PREFIX: &str = "bld-";
pub const CONTACT_PREFIX: &str = "cnt-";
pub const SENSOR_PREFIX: &str = "sns-";
pub const READING_PREFIX: &str = "rdg-";

pub mod tables {
    pub const BUILDINGS: &str = "buildings";
    pub const CONTACTS: &str = "contacts";
    pub const SENSORS: &str = "sensors";
    pub const READINGS: &str = "readings";
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildingType {
    Residential,
    Commercial,
    Industrial,
    Government,
}

impl BuildingType {
    pub const ALL: [BuildingType; 4] = [
        BuildingType::Residential,
        BuildingType::Commercial,
        BuildingType::Industrial,
        BuildingType::Government,
    ];
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceStatus {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl MaintenanceStatus {
    pub const ALL: [MaintenanceStatus; 5] = [
        MaintenanceStatus::Excellent,
        MaintenanceStatus::Good,
        MaintenanceStatus::Fair,
        MaintenanceStatus::Poor,
        MaintenanceStatus::Critical,
    ];
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub long: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Building {
    pub building_id: String,
    #[serde(rename = "type")]
    pub building_type: BuildingType,
    pub location: Location,
    pub governorate: String,
    pub district: String,
    pub area: String,
    pub street_address: String,
    pub age_years: u32,
    pub floor_count: u32,
    pub maintenance_status: MaintenanceStatus,
    pub last_inspection_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactRole {
    Manager,
    Technician,
    Security,
    Supervisor,
    Emergency,
}

impl ContactRole {
    /// Roles handed out to regular (non-emergency) contacts.
    pub const REGULAR: [ContactRole; 4] = [
        ContactRole::Manager,
        ContactRole::Technician,
        ContactRole::Security,
        ContactRole::Supervisor,
    ];
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkShift {
    #[serde(rename = "24/7")]
    AroundTheClock,
    #[serde(rename = "day")]
    Day,
    #[serde(rename = "night")]
    Night,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub contact_id: String,
    pub building_id: String,
    pub full_name: String,
    pub role: ContactRole,
    pub phone: String,
    pub email: String,
    pub workshift: WorkShift,
    /// Only written for the building's designated emergency contact.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_primary_emergency: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Temperature,
    Humidity,
    FireAlarm,
    Co2,
    Pressure,
    WaterLeak,
}

impl SensorType {
    pub const ALL: [SensorType; 6] = [
        SensorType::Temperature,
        SensorType::Humidity,
        SensorType::FireAlarm,
        SensorType::Co2,
        SensorType::Pressure,
        SensorType::WaterLeak,
    ];

    pub fn unit(self) -> &'static str {
        match self {
            SensorType::Temperature => "°C",
            SensorType::Humidity => "%",
            SensorType::FireAlarm | SensorType::WaterLeak => "boolean",
            SensorType::Co2 => "ppm",
            SensorType::Pressure => "kPa",
        }
    }

    /// Event-style sensors report a flag instead of a measurement.
    pub fn is_boolean(self) -> bool {
        matches!(self, SensorType::FireAlarm | SensorType::WaterLeak)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorStatus {
    Active,
    Inactive,
    Maintenance,
    Faulty,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub sensor_id: String,
    pub building_id: String,
    #[serde(rename = "type")]
    pub sensor_type: SensorType,
    pub unit: String,
    pub installation_date: DateTime<Utc>,
    pub warranty_years: u32,
    pub status: SensorStatus,
    pub last_maintenance_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadingValue {
    Flag(bool),
    Numeric(f64),
}

impl ReadingValue {
    pub fn as_f64(self) -> Option<f64> {
        match self {
            ReadingValue::Numeric(v) => Some(v),
            ReadingValue::Flag(_) => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            ReadingValue::Flag(v) => Some(v),
            ReadingValue::Numeric(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub reading_id: String,
    pub sensor_id: String,
    pub building_id: String,
    pub value: ReadingValue,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Record for Building {
    const TABLE: &'static str = tables::BUILDINGS;
    fn key(&self) -> &str {
        &self.building_id
    }
}

impl Record for Contact {
    const TABLE: &'static str = tables::CONTACTS;
    fn key(&self) -> &str {
        &self.contact_id
    }
}

impl Record for Sensor {
    const TABLE: &'static str = tables::SENSORS;
    fn key(&self) -> &str {
        &self.sensor_id
    }
}

impl Record for Reading {
    const TABLE: &'static str = tables::READINGS;
    fn key(&self) -> &str {
        &self.reading_id
    }
}
