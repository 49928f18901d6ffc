//! Tables and secondary indexes the generator provisions on startup.
//!
//! The CRUD API shares these tables and filters on the indexed fields, so the
//! list has to stay in sync with its queries.

use crate::db::models::tables;
use crate::db::store::{IndexSpec, TableSpec};

pub const TABLES: [TableSpec; 4] = [
    TableSpec {
        name: tables::BUILDINGS,
        primary_key: "building_id",
    },
    TableSpec {
        name: tables::CONTACTS,
        primary_key: "contact_id",
    },
    TableSpec {
        name: tables::SENSORS,
        primary_key: "sensor_id",
    },
    TableSpec {
        name: tables::READINGS,
        primary_key: "reading_id",
    },
];

pub const INDEXES: [IndexSpec; 11] = [
    IndexSpec {
        table: tables::BUILDINGS,
        field: "governorate",
    },
    IndexSpec {
        table: tables::BUILDINGS,
        field: "district",
    },
    IndexSpec {
        table: tables::BUILDINGS,
        field: "type",
    },
    IndexSpec {
        table: tables::CONTACTS,
        field: "building_id",
    },
    IndexSpec {
        table: tables::CONTACTS,
        field: "role",
    },
    IndexSpec {
        table: tables::SENSORS,
        field: "building_id",
    },
    IndexSpec {
        table: tables::SENSORS,
        field: "type",
    },
    IndexSpec {
        table: tables::SENSORS,
        field: "installation_date",
    },
    IndexSpec {
        table: tables::READINGS,
        field: "sensor_id",
    },
    IndexSpec {
        table: tables::READINGS,
        field: "timestamp",
    },
    IndexSpec {
        table: tables::READINGS,
        field: "building_id",
    },
];
