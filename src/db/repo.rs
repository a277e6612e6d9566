use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;
use tracing::{info, instrument};

use super::model::{Stored, WeeklyRecovery, WeeklySleep};
use crate::error::Result;
use crate::model::{BodyMeasurementRecord, RecoveryRecord, SleepRecord, VitalsRecord, WorkoutRecord};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL and stricter durability.
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(sqlx::Error::from)?;
    Ok(())
}

/// Destination tables and the natural key the dedup pass groups by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Recovery,
    Sleep,
    Workout,
    BodyMeasurement,
    Vitals,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Recovery,
        Table::Sleep,
        Table::Workout,
        Table::BodyMeasurement,
        Table::Vitals,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Recovery => "recovery",
            Table::Sleep => "sleep",
            Table::Workout => "workout",
            Table::BodyMeasurement => "body_measurement",
            Table::Vitals => "vitals",
        }
    }

    pub fn natural_key(self) -> &'static str {
        match self {
            Table::Recovery => "cycle_id",
            Table::Sleep => "sleep_id",
            Table::Workout => "workout_id",
            Table::BodyMeasurement | Table::Vitals => "grpid",
        }
    }

    /// Column that drives incremental windows.
    pub fn timestamp_column(self) -> &'static str {
        match self {
            Table::Recovery | Table::Sleep | Table::Workout => "created_at",
            Table::BodyMeasurement | Table::Vitals => "measured_at",
        }
    }
}

#[instrument(skip_all, fields(rows = rows.len()))]
pub async fn insert_recoveries(pool: &Pool, rows: &[RecoveryRecord]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    for r in rows {
        sqlx::query(
            "INSERT INTO recovery (user_id, cycle_id, sleep_id, created_at, updated_at, score_state, \
             user_calibrating, recovery_score, resting_heart_rate, hrv_rmssd_milli, spo2_percentage, \
             skin_temp_celsius) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(r.user_id)
        .bind(r.cycle_id)
        .bind(&r.sleep_id)
        .bind(r.created_at)
        .bind(r.updated_at)
        .bind(&r.score_state)
        .bind(r.user_calibrating)
        .bind(r.recovery_score)
        .bind(r.resting_heart_rate)
        .bind(r.hrv_rmssd_milli)
        .bind(r.spo2_percentage)
        .bind(r.skin_temp_celsius)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(rows.len() as u64)
}

#[instrument(skip_all, fields(rows = rows.len()))]
pub async fn insert_sleeps(pool: &Pool, rows: &[SleepRecord]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    for r in rows {
        sqlx::query(
            "INSERT INTO sleep (sleep_id, user_id, created_at, updated_at, start_time, end_time, \
             timezone_offset, nap, score_state, respiratory_rate, sleep_performance_percentage, \
             sleep_consistency_percentage, sleep_efficiency_percentage, total_in_bed_time_milli, \
             total_awake_time_milli, total_no_data_time_milli, total_light_sleep_time_milli, \
             total_slow_wave_sleep_time_milli, total_rem_sleep_time_milli, sleep_cycle_count, \
             disturbance_count, baseline_sleep_needed_milli, need_from_sleep_debt_milli, \
             need_from_recent_strain_milli, need_from_recent_nap_milli) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&r.sleep_id)
        .bind(r.user_id)
        .bind(r.created_at)
        .bind(r.updated_at)
        .bind(r.start_time)
        .bind(r.end_time)
        .bind(&r.timezone_offset)
        .bind(r.nap)
        .bind(&r.score_state)
        .bind(r.respiratory_rate)
        .bind(r.sleep_performance_percentage)
        .bind(r.sleep_consistency_percentage)
        .bind(r.sleep_efficiency_percentage)
        .bind(r.total_in_bed_time_milli)
        .bind(r.total_awake_time_milli)
        .bind(r.total_no_data_time_milli)
        .bind(r.total_light_sleep_time_milli)
        .bind(r.total_slow_wave_sleep_time_milli)
        .bind(r.total_rem_sleep_time_milli)
        .bind(r.sleep_cycle_count)
        .bind(r.disturbance_count)
        .bind(r.baseline_sleep_needed_milli)
        .bind(r.need_from_sleep_debt_milli)
        .bind(r.need_from_recent_strain_milli)
        .bind(r.need_from_recent_nap_milli)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(rows.len() as u64)
}

#[instrument(skip_all, fields(rows = rows.len()))]
pub async fn insert_workouts(pool: &Pool, rows: &[WorkoutRecord]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    for r in rows {
        sqlx::query(
            "INSERT INTO workout (workout_id, user_id, created_at, updated_at, start_time, end_time, \
             timezone_offset, sport_id, sport_name, score_state, strain, average_heart_rate, \
             max_heart_rate, kilojoule, percent_recorded, distance_meter, altitude_gain_meter, \
             altitude_change_meter, zone_zero_minutes, zone_one_minutes, zone_two_minutes, \
             zone_three_minutes, zone_four_minutes, zone_five_minutes) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&r.workout_id)
        .bind(r.user_id)
        .bind(r.created_at)
        .bind(r.updated_at)
        .bind(r.start_time)
        .bind(r.end_time)
        .bind(&r.timezone_offset)
        .bind(r.sport_id)
        .bind(&r.sport_name)
        .bind(&r.score_state)
        .bind(r.strain)
        .bind(r.average_heart_rate)
        .bind(r.max_heart_rate)
        .bind(r.kilojoule)
        .bind(r.percent_recorded)
        .bind(r.distance_meter)
        .bind(r.altitude_gain_meter)
        .bind(r.altitude_change_meter)
        .bind(r.zone_zero_minutes)
        .bind(r.zone_one_minutes)
        .bind(r.zone_two_minutes)
        .bind(r.zone_three_minutes)
        .bind(r.zone_four_minutes)
        .bind(r.zone_five_minutes)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(rows.len() as u64)
}

#[instrument(skip_all, fields(rows = rows.len()))]
pub async fn insert_body_measurements(pool: &Pool, rows: &[BodyMeasurementRecord]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    for r in rows {
        sqlx::query(
            "INSERT INTO body_measurement (grpid, deviceid, date, measured_at, timezone, comment, \
             category, weight_kg, height_m, fat_free_mass_kg, fat_ratio_percent, fat_mass_kg, \
             muscle_mass_kg, bone_mass_kg, hydration_kg, visceral_fat, unknown_measure_type, \
             unknown_value) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(r.grpid)
        .bind(&r.deviceid)
        .bind(r.date)
        .bind(r.measured_at)
        .bind(&r.timezone)
        .bind(&r.comment)
        .bind(r.category)
        .bind(r.weight_kg)
        .bind(r.height_m)
        .bind(r.fat_free_mass_kg)
        .bind(r.fat_ratio_percent)
        .bind(r.fat_mass_kg)
        .bind(r.muscle_mass_kg)
        .bind(r.bone_mass_kg)
        .bind(r.hydration_kg)
        .bind(r.visceral_fat)
        .bind(r.unknown_measure_type)
        .bind(r.unknown_value)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(rows.len() as u64)
}

#[instrument(skip_all, fields(rows = rows.len()))]
pub async fn insert_vitals(pool: &Pool, rows: &[VitalsRecord]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    for r in rows {
        sqlx::query(
            "INSERT INTO vitals (grpid, deviceid, date, measured_at, timezone, category, \
             diastolic_bp_mmhg, systolic_bp_mmhg, heart_rate_bpm, unknown_measure_type, \
             unknown_value) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(r.grpid)
        .bind(&r.deviceid)
        .bind(r.date)
        .bind(r.measured_at)
        .bind(&r.timezone)
        .bind(r.category)
        .bind(r.diastolic_bp_mmhg)
        .bind(r.systolic_bp_mmhg)
        .bind(r.heart_rate_bpm)
        .bind(r.unknown_measure_type)
        .bind(r.unknown_value)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(rows.len() as u64)
}

/// Keep only the highest-id row per natural key. Rows with a null key are
/// left alone. Must not run concurrently with a load into the same table.
#[instrument(skip(pool))]
pub async fn deduplicate(pool: &Pool, table: Table) -> Result<u64> {
    let (name, key) = (table.name(), table.natural_key());
    let sql = format!(
        "DELETE FROM {name} WHERE {key} IS NOT NULL AND id NOT IN \
         (SELECT MAX(id) FROM {name} WHERE {key} IS NOT NULL GROUP BY {key})"
    );
    let removed = sqlx::query(&sql).execute(pool).await?.rows_affected();
    if removed > 0 {
        info!(table = name, removed, "removed duplicate rows");
    }
    Ok(removed)
}

pub async fn deduplicate_all(pool: &Pool) -> Result<Vec<(Table, u64)>> {
    let mut out = Vec::with_capacity(Table::ALL.len());
    for table in Table::ALL {
        out.push((table, deduplicate(pool, table).await?));
    }
    Ok(out)
}

/// Newest value of the table's timestamp column, if any row has one.
pub async fn latest_timestamp(pool: &Pool, table: Table) -> Result<Option<DateTime<Utc>>> {
    let (name, col) = (table.name(), table.timestamp_column());
    let sql = format!(
        "SELECT {col} FROM {name} WHERE {col} IS NOT NULL ORDER BY datetime({col}) DESC LIMIT 1"
    );
    let ts = sqlx::query_scalar::<_, DateTime<Utc>>(&sql)
        .fetch_optional(pool)
        .await?;
    Ok(ts)
}

pub async fn count(pool: &Pool, table: Table) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}", table.name());
    Ok(sqlx::query_scalar::<_, i64>(&sql).fetch_one(pool).await?)
}

/// Rows in insertion order, `skip`/`limit` paginated.
pub async fn list<T>(pool: &Pool, table: Table, skip: i64, limit: i64) -> Result<Vec<Stored<T>>>
where
    T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
{
    let sql = format!("SELECT * FROM {} ORDER BY id ASC LIMIT ? OFFSET ?", table.name());
    let rows = sqlx::query_as::<_, Stored<T>>(&sql)
        .bind(limit)
        .bind(skip)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Most recently inserted row (highest surrogate id).
pub async fn latest<T>(pool: &Pool, table: Table) -> Result<Option<Stored<T>>>
where
    T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
{
    let sql = format!("SELECT * FROM {} ORDER BY id DESC LIMIT 1", table.name());
    let row = sqlx::query_as::<_, Stored<T>>(&sql)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn top_recoveries(pool: &Pool, limit: i64) -> Result<Vec<Stored<RecoveryRecord>>> {
    let rows = sqlx::query_as::<_, Stored<RecoveryRecord>>(
        "SELECT * FROM recovery WHERE recovery_score IS NOT NULL \
         ORDER BY recovery_score DESC, id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}


/// Start of a `weeks`-long window ending at `now`, never earlier than the
/// Unix epoch so SQLite's `datetime()` can still compare it.
fn weeks_before(now: DateTime<Utc>, weeks: u32) -> DateTime<Utc> {
    let floor = DateTime::<Utc>::UNIX_EPOCH;
    Duration::try_weeks(i64::from(weeks))
        .and_then(|span| now.checked_sub_signed(span))
        .map_or(floor, |since| since.max(floor))
}

#[instrument(skip(pool))]
pub async fn weekly_recovery(
    pool: &Pool,
    weeks: u32,
    now: DateTime<Utc>,
) -> Result<Vec<WeeklyRecovery>> {
    let since = weeks_before(now, weeks);
    let rows = sqlx::query_as::<_, WeeklyRecovery>(
        "SELECT strftime('%Y-%W', created_at) AS week, \
                AVG(recovery_score) AS avg_recovery_score, \
                AVG(resting_heart_rate) AS avg_resting_heart_rate, \
                AVG(hrv_rmssd_milli) AS avg_hrv_rmssd_milli, \
                COUNT(*) AS count \
         FROM recovery \
         WHERE strftime('%Y-%W', created_at) IS NOT NULL AND datetime(created_at) >= datetime(?) \
         GROUP BY week ORDER BY week",
    )
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[instrument(skip(pool))]
pub async fn weekly_sleep(pool: &Pool, weeks: u32, now: DateTime<Utc>) -> Result<Vec<WeeklySleep>> {
    let since = weeks_before(now, weeks);
    let rows = sqlx::query_as::<_, WeeklySleep>(
        "SELECT strftime('%Y-%W', start_time) AS week, \
                AVG(sleep_performance_percentage) AS avg_sleep_performance_percentage, \
                AVG(sleep_efficiency_percentage) AS avg_sleep_efficiency_percentage, \
                AVG(total_in_bed_time_milli) / 3600000.0 AS avg_in_bed_hours, \
                COUNT(*) AS count \
         FROM sleep \
         WHERE strftime('%Y-%W', start_time) IS NOT NULL AND datetime(start_time) >= datetime(?) \
         GROUP BY week ORDER BY week",
    )
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
