//! Extract-transform-load jobs: one job per destination table, run one at a
//! time. Each job fetches, transforms, appends, then dedups its table.
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument};

use crate::db::{self, Pool, Table};
use crate::error::Result;
use crate::http::FetchWindow;
use crate::transform::{
    merge_measure_group, transform_body_measurement_at, transform_recovery, transform_sleep,
    transform_vitals_at, transform_workout,
};
use crate::whoop::{Category, WhoopClient};
use crate::withings::{explode_measure_groups, MeasureKind, WithingsClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    Whoop(Category),
    Withings(MeasureKind),
}

impl Job {
    pub const ALL: [Job; 5] = [
        Job::Whoop(Category::Recovery),
        Job::Whoop(Category::Sleep),
        Job::Whoop(Category::Workout),
        Job::Withings(MeasureKind::Body),
        Job::Withings(MeasureKind::Vitals),
    ];

    pub fn name(self) -> &'static str {
        match self {
            Job::Whoop(category) => category.as_str(),
            Job::Withings(MeasureKind::Body) => "body",
            Job::Withings(MeasureKind::Vitals) => "vitals",
        }
    }

    pub fn parse(s: &str) -> Option<Job> {
        let s = s.trim().to_ascii_lowercase();
        Job::ALL.into_iter().find(|job| job.name() == s)
    }

    pub fn table(self) -> Table {
        match self {
            Job::Whoop(Category::Recovery) => Table::Recovery,
            Job::Whoop(Category::Sleep) => Table::Sleep,
            Job::Whoop(Category::Workout) => Table::Workout,
            Job::Withings(MeasureKind::Body) => Table::BodyMeasurement,
            Job::Withings(MeasureKind::Vitals) => Table::Vitals,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EtlSummary {
    pub source: String,
    pub fetched: usize,
    pub loaded: u64,
    pub removed_duplicates: u64,
}

/// Everything a run needs besides the job list.
#[derive(Debug, Clone)]
pub struct EtlContext {
    pub pool: Pool,
    pub whoop: WhoopClient,
    pub withings: WithingsClient,
    pub safety_days: i64,
    pub body_meastypes: Vec<i64>,
    pub vitals_meastypes: Vec<i64>,
}

#[instrument(skip_all, fields(category = category.as_str()))]
pub async fn run_whoop(
    client: &WhoopClient,
    pool: &Pool,
    category: Category,
    window: &FetchWindow,
) -> Result<EtlSummary> {
    let prepared = client.fetch_prepared(category, window).await?;
    let loaded = match category {
        Category::Recovery => {
            let rows: Vec<_> = prepared.iter().map(transform_recovery).collect();
            db::insert_recoveries(pool, &rows).await?
        }
        Category::Sleep => {
            let rows: Vec<_> = prepared.iter().map(transform_sleep).collect();
            db::insert_sleeps(pool, &rows).await?
        }
        Category::Workout => {
            let rows: Vec<_> = prepared.iter().map(transform_workout).collect();
            db::insert_workouts(pool, &rows).await?
        }
    };
    let job = Job::Whoop(category);
    let removed_duplicates = db::deduplicate(pool, job.table()).await?;
    Ok(EtlSummary {
        source: job.name().to_string(),
        fetched: prepared.len(),
        loaded,
        removed_duplicates,
    })
}

#[instrument(skip(client, pool, meastypes, window))]
pub async fn run_withings(
    client: &WithingsClient,
    pool: &Pool,
    kind: MeasureKind,
    meastypes: &[i64],
    window: &FetchWindow,
    now: DateTime<Utc>,
) -> Result<EtlSummary> {
    let groups = client.get_measures(meastypes, window).await?;
    let rows = explode_measure_groups(&groups);
    let loaded = match kind {
        MeasureKind::Body => {
            let records: Vec<_> = rows
                .iter()
                .map(|row| transform_body_measurement_at(row, now))
                .collect();
            db::insert_body_measurements(pool, &merge_measure_group(records)).await?
        }
        MeasureKind::Vitals => {
            let records: Vec<_> = rows.iter().map(|row| transform_vitals_at(row, now)).collect();
            db::insert_vitals(pool, &merge_measure_group(records)).await?
        }
    };
    let job = Job::Withings(kind);
    let removed_duplicates = db::deduplicate(pool, job.table()).await?;
    Ok(EtlSummary {
        source: job.name().to_string(),
        fetched: groups.len(),
        loaded,
        removed_duplicates,
    })
}

/// Full reload when `full`, otherwise resume from the newest stored row.
pub async fn window_for(ctx: &EtlContext, job: Job, full: bool) -> Result<FetchWindow> {
    if full {
        return Ok(FetchWindow::full());
    }
    let latest = db::latest_timestamp(&ctx.pool, job.table()).await?;
    Ok(FetchWindow::incremental(latest, ctx.safety_days))
}

pub async fn run_job(ctx: &EtlContext, job: Job, full: bool) -> Result<EtlSummary> {
    let window = window_for(ctx, job, full).await?;
    info!(job = job.name(), start = ?window.start, "starting job");
    match job {
        Job::Whoop(category) => run_whoop(&ctx.whoop, &ctx.pool, category, &window).await,
        Job::Withings(kind) => {
            let meastypes = match kind {
                MeasureKind::Body => &ctx.body_meastypes,
                MeasureKind::Vitals => &ctx.vitals_meastypes,
            };
            run_withings(&ctx.withings, &ctx.pool, kind, meastypes, &window, Utc::now()).await
        }
    }
}

/// Runs `jobs` sequentially. A failed job is logged and reported; the
/// remaining jobs still run.
pub async fn run_all(ctx: &EtlContext, jobs: &[Job], full: bool) -> Vec<(Job, Result<EtlSummary>)> {
    let mut results = Vec::with_capacity(jobs.len());
    for &job in jobs {
        let result = run_job(ctx, job, full).await;
        match &result {
            Ok(summary) => info!(
                job = job.name(),
                fetched = summary.fetched,
                loaded = summary.loaded,
                removed = summary.removed_duplicates,
                "job finished"
            ),
            Err(err) => error!(job = job.name(), %err, "job failed"),
        }
        results.push((job, result));
    }
    results
}
