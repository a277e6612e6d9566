//! Health telemetry ETL: pulls wearable-tracker and health-monitor data,
//! flattens it into row records, loads it into SQLite and serves read queries.
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod etl;
pub mod flatten;
pub mod http;
pub mod model;
pub mod token;
pub mod transform;
pub mod whoop;
pub mod withings;
