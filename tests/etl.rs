use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use healthsync::db::{self, Pool, Table};
use healthsync::etl::{run_whoop, run_withings};
use healthsync::http::{FetchWindow, RetryPolicy};
use healthsync::model::{BodyMeasurementRecord, RecoveryRecord};
use healthsync::token::{
    Credential, CredentialFile, TokenStore, WhoopTokenEndpoint, WithingsTokenEndpoint,
};
use healthsync::whoop::{Category, WhoopClient};
use healthsync::withings::{MeasureKind, WithingsClient};
use mockito::Matcher;
use reqwest::{Client, Url};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::Path;
use std::sync::Arc;

async fn setup_pool() -> Pool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

fn seed_credential(path: &Path) {
    CredentialFile::new(path)
        .save(&Credential {
            access_token: "tok".into(),
            refresh_token: Some("r".into()),
            user_id: None,
            expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
        })
        .unwrap();
}

fn whoop_client(server_url: &str, token_path: &Path) -> WhoopClient {
    seed_credential(token_path);
    let base = Url::parse(&format!("{server_url}/")).unwrap();
    let endpoint = WhoopTokenEndpoint::new(
        Client::new(),
        base.join("oauth/oauth2/token").unwrap(),
        "cid".into(),
        "secret".into(),
    );
    let tokens = TokenStore::new(CredentialFile::new(token_path), Arc::new(endpoint));
    WhoopClient::new(Client::new(), base, tokens, RetryPolicy::none())
}

fn withings_client(server_url: &str, token_path: &Path) -> WithingsClient {
    seed_credential(token_path);
    let base = Url::parse(&format!("{server_url}/")).unwrap();
    let endpoint = WithingsTokenEndpoint::new(
        Client::new(),
        base.join("v2/oauth2").unwrap(),
        "cid".into(),
        "secret".into(),
    );
    let tokens = TokenStore::new(CredentialFile::new(token_path), Arc::new(endpoint));
    WithingsClient::new(Client::new(), base, tokens, RetryPolicy::none())
}

fn recovery(cycle_id: i64, score: f64, created_at: &str) -> serde_json::Value {
    json!({
        "cycle_id": cycle_id,
        "sleep_id": format!("s-{cycle_id}"),
        "user_id": 7,
        "created_at": created_at,
        "score_state": "SCORED",
        "score": {"recovery_score": score, "resting_heart_rate": 52, "hrv_rmssd_milli": 61.5}
    })
}

#[tokio::test]
async fn whoop_rerun_replaces_overlapping_records() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let client = whoop_client(&server.url(), &dir.path().join("whoop.json"));
    let pool = setup_pool().await;

    let first = server
        .mock("GET", "/developer/v2/recovery")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!({"records": [
                recovery(1, 40.0, "2024-03-01T06:00:00.000Z"),
                recovery(2, 55.0, "2024-03-02T06:00:00.000Z")
            ]})
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;
    let summary = run_whoop(&client, &pool, Category::Recovery, &FetchWindow::full())
        .await
        .unwrap();
    first.assert_async().await;
    assert_eq!(summary.source, "recovery");
    assert_eq!(summary.fetched, 2);
    assert_eq!(summary.loaded, 2);
    assert_eq!(summary.removed_duplicates, 0);

    // Rescored cycle 2 arrives again alongside a new cycle.
    let second = server
        .mock("GET", "/developer/v2/recovery")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!({"records": [
                recovery(2, 70.0, "2024-03-02T06:00:00.000Z"),
                recovery(3, 90.0, "2024-03-03T06:00:00.000Z")
            ]})
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;
    let latest = db::latest_timestamp(&pool, Table::Recovery).await.unwrap();
    let window = FetchWindow::incremental(latest, 3);
    assert_eq!(
        window.start,
        Some(Utc.with_ymd_and_hms(2024, 2, 28, 6, 0, 0).unwrap())
    );
    let summary = run_whoop(&client, &pool, Category::Recovery, &window)
        .await
        .unwrap();
    second.assert_async().await;
    assert_eq!(summary.loaded, 2);
    assert_eq!(summary.removed_duplicates, 1);

    let rows = db::list::<RecoveryRecord>(&pool, Table::Recovery, 0, 100)
        .await
        .unwrap();
    let scores: Vec<_> = rows
        .iter()
        .map(|r| (r.record.cycle_id.unwrap(), r.record.recovery_score.unwrap()))
        .collect();
    assert_eq!(scores, vec![(1, 40.0), (2, 70.0), (3, 90.0)]);
    assert_eq!(rows[0].record.score_state.as_deref(), Some("SCORED"));
    assert_eq!(rows[0].record.resting_heart_rate, Some(52.0));
}

#[tokio::test]
async fn whoop_workout_zones_land_as_minutes() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let client = whoop_client(&server.url(), &dir.path().join("whoop.json"));
    let pool = setup_pool().await;

    server
        .mock("GET", "/developer/v2/activity/workout")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!({"records": [{
                "id": "w-1",
                "start": "2024-03-01T06:00:00Z",
                "end": "2024-03-01T07:00:00Z",
                "sport_name": "running",
                "score_state": "SCORED",
                "score": {"strain": 12.5, "zone_durations": {"zone_two_milli": 900000}}
            }]})
            .to_string(),
        )
        .create_async()
        .await;

    let summary = run_whoop(&client, &pool, Category::Workout, &FetchWindow::full())
        .await
        .unwrap();
    assert_eq!(summary.loaded, 1);

    let row: (String, f64, f64) = sqlx::query_as(
        "SELECT workout_id, zone_two_minutes, zone_five_minutes FROM workout",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(row, ("w-1".to_string(), 15.0, 0.0));
}

#[tokio::test]
async fn withings_groups_merge_and_dedup_across_runs() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let client = withings_client(&server.url(), &dir.path().join("withings.json"));
    let pool = setup_pool().await;
    let now = Utc::now();

    let body = json!({"status": 0, "body": {
        "measuregrps": [
            {"grpid": 100, "date": 1_700_000_000, "category": 1, "deviceid": "scale",
             "measures": [
                {"type": 1, "value": 72500, "unit": -3},
                {"type": 4, "value": 180, "unit": -2},
                {"type": 9, "value": 80, "unit": 0}
             ]}
        ],
        "more": 0
    }})
    .to_string();
    let mock = server
        .mock("POST", "/measure")
        .with_status(200)
        .with_body(body)
        .expect(2)
        .create_async()
        .await;

    let first = run_withings(
        &client,
        &pool,
        MeasureKind::Body,
        &[1, 4],
        &FetchWindow::full(),
        now,
    )
    .await
    .unwrap();
    assert_eq!(first.fetched, 1);
    assert_eq!(first.loaded, 1);
    assert_eq!(first.removed_duplicates, 0);

    let second = run_withings(
        &client,
        &pool,
        MeasureKind::Body,
        &[1, 4],
        &FetchWindow::full(),
        now,
    )
    .await
    .unwrap();
    mock.assert_async().await;
    assert_eq!(second.removed_duplicates, 1);

    let rows = db::list::<BodyMeasurementRecord>(&pool, Table::BodyMeasurement, 0, 10)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let rec = &rows[0].record;
    assert_eq!(rec.grpid, Some(100));
    assert_eq!(rec.weight_kg, Some(72.5));
    assert_eq!(rec.height_m, Some(1.8));
    assert_eq!(rec.measured_at, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
    // A vitals code in a body group lands in the unknown bucket.
    assert_eq!(rec.unknown_measure_type, Some(9));
    assert_eq!(rec.unknown_value, Some(80.0));
}
