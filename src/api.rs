//! Read-only HTTP query layer over the loaded tables.
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::FromRow;
use thiserror::Error;
use tracing::error;

use crate::db::{self, Pool, Stored, Table, WeeklyRecovery, WeeklySleep};
use crate::error::EtlError;
use crate::model::{
    BodyMeasurementRecord, RecoveryRecord, SleepRecord, VitalsRecord, WorkoutRecord,
};

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 1000;
const DEFAULT_TOP: u32 = 10;
const MAX_WEEKS: u32 = 5200;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub default_weeks: u32,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no {0} records found")]
    NotFound(&'static str),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Store(#[from] EtlError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Store(err) => {
                error!(%err, "query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

/// A queryable table and the derived fields its responses carry.
trait Resource: for<'r> FromRow<'r, SqliteRow> + Serialize + Send + Unpin + 'static {
    const TABLE: Table;
    const NAME: &'static str;

    fn derived(&self) -> Map<String, Value> {
        Map::new()
    }
}

impl Resource for RecoveryRecord {
    const TABLE: Table = Table::Recovery;
    const NAME: &'static str = "recovery";

    fn derived(&self) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("recovery_category".into(), json!(self.category()));
        m
    }
}

impl Resource for SleepRecord {
    const TABLE: Table = Table::Sleep;
    const NAME: &'static str = "sleep";
}

impl Resource for WorkoutRecord {
    const TABLE: Table = Table::Workout;
    const NAME: &'static str = "workout";

    fn derived(&self) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("total_zone_minutes".into(), json!(self.total_zone_minutes()));
        m
    }
}

impl Resource for BodyMeasurementRecord {
    const TABLE: Table = Table::BodyMeasurement;
    const NAME: &'static str = "body measurement";

    fn derived(&self) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("bmi".into(), json!(self.bmi()));
        m.insert("weight_category".into(), json!(self.weight_category()));
        m
    }
}

impl Resource for VitalsRecord {
    const TABLE: Table = Table::Vitals;
    const NAME: &'static str = "vitals";

    fn derived(&self) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("bp_category".into(), json!(self.bp_category()));
        m
    }
}

/// Stored row with its derived fields inlined.
#[derive(Debug, Serialize)]
struct Annotated<T> {
    #[serde(flatten)]
    row: Stored<T>,
    #[serde(flatten)]
    derived: Map<String, Value>,
}

impl<T: Resource> From<Stored<T>> for Annotated<T> {
    fn from(row: Stored<T>) -> Self {
        let derived = row.record.derived();
        Self { row, derived }
    }
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub skip: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    DEFAULT_LIMIT
}

#[derive(Debug, Deserialize)]
pub struct TopParams {
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct WeeklyParams {
    #[serde(alias = "weeks")]
    pub week: Option<u32>,
}

impl WeeklyParams {
    fn resolve(&self, default_weeks: u32) -> Result<u32, ApiError> {
        match self.week {
            Some(0) => Err(ApiError::BadRequest("week must be at least 1".into())),
            Some(w) if w > MAX_WEEKS => Err(ApiError::BadRequest(format!(
                "week must be at most {MAX_WEEKS}"
            ))),
            Some(w) => Ok(w),
            None => Ok(default_weeks),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/recovery", get(list::<RecoveryRecord>))
        .route("/recovery/latest", get(latest::<RecoveryRecord>))
        .route("/recovery/top", get(top_recovery))
        .route("/recovery/weekly", get(weekly_recovery))
        .route("/sleep", get(list::<SleepRecord>))
        .route("/sleep/latest", get(latest::<SleepRecord>))
        .route("/sleep/weekly", get(weekly_sleep))
        .route("/workout", get(list::<WorkoutRecord>))
        .route("/workout/latest", get(latest::<WorkoutRecord>))
        .route("/body", get(list::<BodyMeasurementRecord>))
        .route("/body/latest", get(latest::<BodyMeasurementRecord>))
        .route("/vitals", get(list::<VitalsRecord>))
        .route("/vitals/latest", get(latest::<VitalsRecord>))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let recovery_rows = db::count(&state.pool, Table::Recovery).await?;
    Ok(Json(json!({ "status": "ok", "recovery_rows": recovery_rows })))
}

async fn list<T: Resource>(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<Annotated<T>>>, ApiError> {
    let limit = page.limit.clamp(1, MAX_LIMIT);
    let rows = db::list::<T>(&state.pool, T::TABLE, i64::from(page.skip), i64::from(limit)).await?;
    Ok(Json(rows.into_iter().map(Annotated::from).collect()))
}

async fn latest<T: Resource>(State(state): State<AppState>) -> Result<Json<Annotated<T>>, ApiError> {
    db::latest::<T>(&state.pool, T::TABLE)
        .await?
        .map(|row| Json(Annotated::from(row)))
        .ok_or(ApiError::NotFound(T::NAME))
}

async fn top_recovery(
    State(state): State<AppState>,
    Query(params): Query<TopParams>,
) -> Result<Json<Vec<Annotated<RecoveryRecord>>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_TOP).clamp(1, MAX_LIMIT);
    let rows = db::top_recoveries(&state.pool, i64::from(limit)).await?;
    Ok(Json(rows.into_iter().map(Annotated::from).collect()))
}

async fn weekly_recovery(
    State(state): State<AppState>,
    Query(params): Query<WeeklyParams>,
) -> Result<Json<Vec<WeeklyRecovery>>, ApiError> {
    let weeks = params.resolve(state.default_weeks)?;
    Ok(Json(db::weekly_recovery(&state.pool, weeks, Utc::now()).await?))
}

async fn weekly_sleep(
    State(state): State<AppState>,
    Query(params): Query<WeeklyParams>,
) -> Result<Json<Vec<WeeklySleep>>, ApiError> {
    let weeks = params.resolve(state.default_weeks)?;
    Ok(Json(db::weekly_sleep(&state.pool, weeks, Utc::now()).await?))
}
