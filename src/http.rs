//! Shared HTTP plumbing: client construction, retry with backoff, fetch windows.
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{header::RETRY_AFTER, Client, RequestBuilder, Response, StatusCode, Url};
use std::time::Duration;
use tracing::warn;

use crate::config::App;
use crate::error::{EtlError, Result};

const BASE_DELAY: Duration = Duration::from_secs(5);

pub fn build_client(timeout: Duration) -> Result<Client> {
    let http = Client::builder()
        .user_agent("healthsync/0.1")
        .timeout(timeout)
        .build()?;
    Ok(http)
}

/// Base URLs are joined with relative paths, so they need a trailing slash.
pub fn parse_base(raw: &str) -> Result<Url> {
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized)
        .map_err(|e| EtlError::InvalidUrl(format!("{raw}: {e}")))
}

/// Retries on 429 and 5xx only. Other statuses fail immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Zero means uncapped.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: BASE_DELAY,
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(app: &App) -> Self {
        Self {
            max_retries: app.max_retries,
            base_delay: BASE_DELAY,
            max_backoff: app.max_backoff(),
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// `base * 2^attempt`, or the server's `Retry-After`, capped by `max_backoff`.
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let delay = retry_after.unwrap_or(exp);
        if self.max_backoff.is_zero() {
            delay
        } else {
            delay.min(self.max_backoff)
        }
    }
}

pub fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_after(res: &Response) -> Option<Duration> {
    res.headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Send the request built by `make`, rebuilding it for every attempt.
/// Non-success responses that exhaust the policy become [`EtlError::Http`].
pub async fn send_with_retry<F>(
    vendor: &'static str,
    policy: &RetryPolicy,
    mut make: F,
) -> Result<Response>
where
    F: FnMut() -> RequestBuilder,
{
    let mut attempt = 0u32;
    loop {
        let res = make().send().await?;
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        if is_retryable(status) && attempt < policy.max_retries {
            let delay = policy.backoff(attempt, retry_after(&res));
            warn!(
                vendor,
                status = status.as_u16(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying request"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
            continue;
        }
        let body = res.text().await.unwrap_or_default();
        return Err(EtlError::Http {
            vendor,
            status: status.as_u16(),
            body,
        });
    }
}

/// Time range passed to the vendor APIs. `None` bounds are left open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl FetchWindow {
    pub fn full() -> Self {
        Self::default()
    }

    /// Start from the newest stored record minus a safety margin so late
    /// updates are re-fetched; duplicates are removed after loading.
    pub fn incremental(latest: Option<DateTime<Utc>>, safety_days: i64) -> Self {
        Self {
            start: latest.map(|ts| {
                ChronoDuration::try_days(safety_days)
                    .and_then(|margin| ts.checked_sub_signed(margin))
                    .unwrap_or(ts)
            }),
            end: None,
        }
    }

    pub fn is_full(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}
