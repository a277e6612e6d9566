use chrono::{Duration as ChronoDuration, Utc};
use healthsync::error::EtlError;
use healthsync::http::{FetchWindow, RetryPolicy};
use healthsync::token::{Credential, CredentialFile, TokenStore, WhoopTokenEndpoint};
use healthsync::whoop::{Category, WhoopClient};
use mockito::Matcher;
use reqwest::{Client, Url};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn client_for(server_url: &str, token_path: &Path) -> WhoopClient {
    CredentialFile::new(token_path)
        .save(&Credential {
            access_token: "live-token".into(),
            refresh_token: Some("r".into()),
            user_id: None,
            expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
        })
        .unwrap();
    let base = Url::parse(&format!("{server_url}/")).unwrap();
    let endpoint = WhoopTokenEndpoint::new(
        Client::new(),
        base.join("oauth/oauth2/token").unwrap(),
        "cid".into(),
        "secret".into(),
    );
    let tokens = TokenStore::new(CredentialFile::new(token_path), Arc::new(endpoint));
    let retry = RetryPolicy {
        max_retries: 2,
        base_delay: Duration::ZERO,
        max_backoff: Duration::ZERO,
    };
    WhoopClient::new(Client::new(), base, tokens, retry)
}

#[tokio::test]
async fn follows_continuation_tokens_in_order() {
    let mut server = mockito::Server::new_async().await;
    let path = "/developer/v2/recovery";
    let page1 = server
        .mock("GET", path)
        .match_query(Matcher::Exact("limit=25".into()))
        .match_header("authorization", "Bearer live-token")
        .with_status(200)
        .with_body(json!({"records": [{"cycle_id": 1}, {"cycle_id": 2}], "next_token": "p2"}).to_string())
        .expect(1)
        .create_async()
        .await;
    let page2 = server
        .mock("GET", path)
        .match_query(Matcher::Exact("limit=25&nextToken=p2".into()))
        .with_status(200)
        .with_body(json!({"records": [{"cycle_id": 3}], "next_token": "p3"}).to_string())
        .expect(1)
        .create_async()
        .await;
    let page3 = server
        .mock("GET", path)
        .match_query(Matcher::Exact("limit=25&nextToken=p3".into()))
        .with_status(200)
        .with_body(json!({"records": [{"cycle_id": 4}], "next_token": null}).to_string())
        .expect(1)
        .create_async()
        .await;

    let td = tempfile::tempdir().unwrap();
    let client = client_for(&server.url(), &td.path().join("whoop.json"));
    let records = client
        .fetch_all(Category::Recovery, &FetchWindow::full())
        .await
        .unwrap();

    let ids: Vec<_> = records.iter().map(|r| r["cycle_id"].as_i64().unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    page1.assert_async().await;
    page2.assert_async().await;
    page3.assert_async().await;
}

#[tokio::test]
async fn window_bounds_are_sent_as_query_parameters() {
    let mut server = mockito::Server::new_async().await;
    let start = "2024-03-09T08:00:00.000Z";
    let mock = server
        .mock("GET", "/developer/v2/activity/sleep")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("limit".into(), "25".into()),
            Matcher::UrlEncoded("start".into(), start.into()),
        ]))
        .with_status(200)
        .with_body(r#"{"records": []}"#)
        .expect(1)
        .create_async()
        .await;

    let td = tempfile::tempdir().unwrap();
    let client = client_for(&server.url(), &td.path().join("whoop.json"));
    let window = FetchWindow {
        start: Some(start.parse().unwrap()),
        end: None,
    };
    let records = client.fetch_all(Category::Sleep, &window).await.unwrap();
    assert!(records.is_empty());
    mock.assert_async().await;
}

#[tokio::test]
async fn null_records_page_counts_as_empty() {
    let mut server = mockito::Server::new_async().await;
    let path = "/developer/v2/activity/sleep";
    server
        .mock("GET", path)
        .match_query(Matcher::Exact("limit=25".into()))
        .with_status(200)
        .with_body(json!({"records": [{"id": "s1"}], "next_token": "p2"}).to_string())
        .create_async()
        .await;
    server
        .mock("GET", path)
        .match_query(Matcher::Exact("limit=25&nextToken=p2".into()))
        .with_status(200)
        .with_body(json!({"records": null, "next_token": null}).to_string())
        .create_async()
        .await;

    let td = tempfile::tempdir().unwrap();
    let client = client_for(&server.url(), &td.path().join("whoop.json"));
    let records = client
        .fetch_all(Category::Sleep, &FetchWindow::full())
        .await
        .unwrap();
    assert_eq!(records, vec![json!({"id": "s1"})]);
}

#[tokio::test]
async fn non_success_page_aborts_the_fetch() {
    let mut server = mockito::Server::new_async().await;
    let path = "/developer/v2/activity/workout";
    server
        .mock("GET", path)
        .match_query(Matcher::Exact("limit=25".into()))
        .with_status(200)
        .with_body(json!({"records": [{"id": "w1"}], "next_token": "p2"}).to_string())
        .create_async()
        .await;
    server
        .mock("GET", path)
        .match_query(Matcher::Exact("limit=25&nextToken=p2".into()))
        .with_status(403)
        .with_body("forbidden")
        .create_async()
        .await;

    let td = tempfile::tempdir().unwrap();
    let client = client_for(&server.url(), &td.path().join("whoop.json"));
    let err = client
        .fetch_all(Category::Workout, &FetchWindow::full())
        .await
        .unwrap_err();
    match err {
        EtlError::Http { vendor, status, .. } => {
            assert_eq!(vendor, "whoop");
            assert_eq!(status, 403);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn rate_limited_page_is_retried() {
    let mut server = mockito::Server::new_async().await;
    let path = "/developer/v2/recovery";
    let limited = server
        .mock("GET", path)
        .match_query(Matcher::Any)
        .with_status(429)
        .expect(1)
        .create_async()
        .await;
    let ok = server
        .mock("GET", path)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(json!({"records": [{"cycle_id": 9}]}).to_string())
        .expect(1)
        .create_async()
        .await;

    let td = tempfile::tempdir().unwrap();
    let client = client_for(&server.url(), &td.path().join("whoop.json"));
    let records = client
        .fetch_all(Category::Recovery, &FetchWindow::full())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    limited.assert_async().await;
    ok.assert_async().await;
}

#[tokio::test]
async fn prepared_records_have_column_names() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/developer/v2/activity/workout")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!({"records": [{
                "id": "w1",
                "sport_name": "running",
                "score": {"strain": 11.5, "zone_durations": {"zone_three_milli": 600000}}
            }]})
            .to_string(),
        )
        .create_async()
        .await;

    let td = tempfile::tempdir().unwrap();
    let client = client_for(&server.url(), &td.path().join("whoop.json"));
    let prepared = client
        .fetch_prepared(Category::Workout, &FetchWindow::full())
        .await
        .unwrap();
    assert_eq!(prepared.len(), 1);
    assert_eq!(prepared[0]["strain"], json!(11.5));
    assert_eq!(prepared[0]["zone_three_minutes"], json!(10.0));
    assert!(prepared[0].get("score.strain").is_none());
}
