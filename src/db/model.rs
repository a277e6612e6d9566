//! Row models returned by repositories.
//!
//! Record structs live in `crate::model`; here they are paired with the
//! surrogate id assigned on insert.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

/// A record plus its surrogate row id. Serializes flat, with `id` first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stored<T> {
    pub id: i64,
    #[serde(flatten)]
    pub record: T,
}

impl<'r, T> FromRow<'r, SqliteRow> for Stored<T>
where
    T: FromRow<'r, SqliteRow>,
{
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            record: T::from_row(row)?,
        })
    }
}

/// Recovery averages for one `%Y-%W` week bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WeeklyRecovery {
    pub week: String,
    pub avg_recovery_score: Option<f64>,
    pub avg_resting_heart_rate: Option<f64>,
    pub avg_hrv_rmssd_milli: Option<f64>,
    pub count: i64,
}

/// Sleep averages for one `%Y-%W` week bucket, keyed by sleep start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WeeklySleep {
    pub week: String,
    pub avg_sleep_performance_percentage: Option<f64>,
    pub avg_sleep_efficiency_percentage: Option<f64>,
    pub avg_in_bed_hours: Option<f64>,
    pub count: i64,
}
