//! Wearable-tracker client: paginated reads of recovery, sleep and workout records.
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::error::{EtlError, Result};
use crate::flatten;
use crate::http::{build_client, parse_base, send_with_retry, FetchWindow, RetryPolicy};
use crate::token::{CredentialFile, TokenStore, WhoopTokenEndpoint};

const VENDOR: &str = "whoop";
const PAGE_LIMIT: u32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Recovery,
    Sleep,
    Workout,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Recovery, Category::Sleep, Category::Workout];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Recovery => "recovery",
            Category::Sleep => "sleep",
            Category::Workout => "workout",
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            Category::Recovery => "developer/v2/recovery",
            Category::Sleep => "developer/v2/activity/sleep",
            Category::Workout => "developer/v2/activity/workout",
        }
    }
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    records: Option<Vec<Value>>,
    #[serde(default)]
    next_token: Option<String>,
}

fn format_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Clone)]
pub struct WhoopClient {
    http: Client,
    base_url: Url,
    tokens: TokenStore,
    retry: RetryPolicy,
}

impl fmt::Debug for WhoopClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhoopClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl WhoopClient {
    pub fn new(http: Client, base_url: Url, tokens: TokenStore, retry: RetryPolicy) -> Self {
        Self {
            http,
            base_url,
            tokens,
            retry,
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let http = build_client(cfg.app.request_timeout())?;
        let base_url = parse_base(&cfg.whoop.api_base)?;
        let token_url = Url::parse(&cfg.whoop.token_url)
            .map_err(|e| EtlError::InvalidUrl(format!("whoop token URL: {e}")))?;
        let endpoint = WhoopTokenEndpoint::new(
            http.clone(),
            token_url,
            cfg.whoop.client_id.clone(),
            cfg.whoop.client_secret.clone(),
        );
        let tokens = TokenStore::new(CredentialFile::new(cfg.whoop_token_path()), Arc::new(endpoint));
        Ok(Self::new(
            http,
            base_url,
            tokens,
            RetryPolicy::from_config(&cfg.app),
        ))
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    fn endpoint(&self, category: Category) -> Result<Url> {
        self.base_url
            .join(category.path())
            .map_err(|e| EtlError::InvalidUrl(format!("whoop {} URL: {e}", category.as_str())))
    }

    /// Every raw record of `category` in `window`, in server order.
    /// Any failed page aborts the whole fetch.
    #[instrument(skip_all, fields(category = category.as_str()))]
    pub async fn fetch_all(&self, category: Category, window: &FetchWindow) -> Result<Vec<Value>> {
        let url = self.endpoint(category)?;
        let mut base: Vec<(&str, String)> = vec![("limit", PAGE_LIMIT.to_string())];
        if let Some(start) = window.start {
            base.push(("start", format_time(start)));
        }
        if let Some(end) = window.end {
            base.push(("end", format_time(end)));
        }

        let mut records = Vec::new();
        let mut next_token: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let credential = self.tokens.authenticate().await?;
            let mut query = base.clone();
            if let Some(token) = &next_token {
                query.push(("nextToken", token.clone()));
            }
            let res = send_with_retry(VENDOR, &self.retry, || {
                self.http
                    .get(url.clone())
                    .bearer_auth(&credential.access_token)
                    .query(&query)
            })
            .await?;
            let page: Page = res.json().await?;
            pages += 1;
            records.extend(page.records.unwrap_or_default());
            match page.next_token.filter(|t| !t.is_empty()) {
                Some(token) => {
                    debug!(pages, "following continuation token");
                    next_token = Some(token);
                }
                None => break,
            }
        }
        info!(pages, records = records.len(), "fetched");
        Ok(records)
    }

    /// [`fetch_all`](Self::fetch_all) with every record flattened and renamed.
    pub async fn fetch_prepared(&self, category: Category, window: &FetchWindow) -> Result<Vec<Value>> {
        let raw = self.fetch_all(category, window).await?;
        Ok(raw.iter().map(|r| flatten::prepare(category, r)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn query_times_use_millis_and_z() {
        let ts = Utc.with_ymd_and_hms(2022, 4, 24, 11, 25, 44).unwrap();
        assert_eq!(format_time(ts), "2022-04-24T11:25:44.000Z");
    }

    #[test]
    fn category_paths() {
        assert_eq!(Category::Recovery.path(), "developer/v2/recovery");
        assert_eq!(Category::Workout.path(), "developer/v2/activity/workout");
        assert_eq!(Category::ALL.len(), 3);
    }

    #[test]
    fn page_tolerates_missing_fields() {
        let page: Page = serde_json::from_str(r#"{"records":[{"a":1}],"next_token":null}"#).unwrap();
        assert_eq!(page.records.map(|r| r.len()), Some(1));
        assert!(page.next_token.is_none());
        let page: Page = serde_json::from_str("{}").unwrap();
        assert!(page.records.is_none());
        let page: Page = serde_json::from_str(r#"{"records":null,"next_token":null}"#).unwrap();
        assert!(page.records.unwrap_or_default().is_empty());
    }
}
