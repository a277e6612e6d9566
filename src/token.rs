//! OAuth2 credential cache and refresh for both vendors.
//!
//! A [`Credential`] is an immutable value. Refreshing never mutates the cached
//! credential in place: [`TokenStore::authenticate`] returns a new value and
//! overwrites the credential file with it.
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::{EtlError, Result};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Result of a successful refresh-token exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub user_id: Option<String>,
}

impl Credential {
    /// A credential without a known expiry is never considered valid.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty() && self.expires_at.map_or(false, |exp| now < exp)
    }

    /// Build the successor credential. Fields the grant omits carry over.
    pub fn renewed(&self, grant: TokenGrant, now: DateTime<Utc>) -> Credential {
        Credential {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or_else(|| self.refresh_token.clone()),
            user_id: grant.user_id.or_else(|| self.user_id.clone()),
            // An unrepresentable expiry is unknown, which forces a refresh next time.
            expires_at: grant
                .expires_in
                .and_then(Duration::try_seconds)
                .and_then(|ttl| now.checked_add_signed(ttl)),
        }
    }
}

fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Accepts RFC 3339 and naive ISO-8601 (assumed UTC) expiry strings.
fn lenient_datetime<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.and_then(|s| parse_expiry(&s)))
}

fn parse_expiry(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// On-disk credential cache, one JSON file per vendor.
#[derive(Debug, Clone)]
pub struct CredentialFile {
    path: PathBuf,
}

impl CredentialFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable files load as `None`.
    pub fn load(&self) -> Result<Option<Credential>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(EtlError::CredentialFile {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        match serde_json::from_str::<Credential>(&content) {
            Ok(cred) => Ok(Some(cred)),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "ignoring unreadable credential file");
                Ok(None)
            }
        }
    }

    /// Overwrite the file; owner read/write only.
    pub fn save(&self, credential: &Credential) -> Result<()> {
        let io_err = |source| EtlError::CredentialFile {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let body = serde_json::to_vec_pretty(credential)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path).map_err(io_err)?;
        file.write_all(&body).map_err(io_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
        }
        Ok(())
    }
}

/// Vendor-specific refresh-token exchange.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    fn vendor(&self) -> &'static str;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;
}

fn int_field(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn string_field(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn grant_from(vendor: &'static str, body: &Value) -> Result<TokenGrant> {
    let access_token = body
        .get("access_token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            EtlError::Authentication(format!("{vendor} token response missing access_token"))
        })?;
    Ok(TokenGrant {
        access_token: access_token.to_string(),
        refresh_token: string_field(body.get("refresh_token")),
        expires_in: int_field(body.get("expires_in")),
        user_id: string_field(body.get("userid")).or_else(|| string_field(body.get("user_id"))),
    })
}

async fn read_token_response(vendor: &'static str, res: reqwest::Response) -> Result<Value> {
    let status = res.status();
    let text = res.text().await?;
    if !status.is_success() {
        return Err(EtlError::Authentication(format!(
            "{vendor} token refresh failed with HTTP {status}: {text}"
        )));
    }
    serde_json::from_str(&text).map_err(|err| {
        EtlError::Authentication(format!("{vendor} token response is not JSON: {err}"))
    })
}

/// Wearable tracker token endpoint: plain OAuth2 form post.
#[derive(Clone)]
pub struct WhoopTokenEndpoint {
    http: Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
}

impl WhoopTokenEndpoint {
    pub fn new(http: Client, token_url: Url, client_id: String, client_secret: String) -> Self {
        Self {
            http,
            token_url,
            client_id,
            client_secret,
        }
    }
}

#[async_trait]
impl TokenEndpoint for WhoopTokenEndpoint {
    fn vendor(&self) -> &'static str {
        "whoop"
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let res = self
            .http
            .post(self.token_url.clone())
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;
        let body = read_token_response(self.vendor(), res).await?;
        grant_from(self.vendor(), &body)
    }
}

/// Health-monitor token endpoint: `action=requesttoken`, JSON envelope with
/// `status == 0` on success.
#[derive(Clone)]
pub struct WithingsTokenEndpoint {
    http: Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
}

impl WithingsTokenEndpoint {
    pub fn new(http: Client, token_url: Url, client_id: String, client_secret: String) -> Self {
        Self {
            http,
            token_url,
            client_id,
            client_secret,
        }
    }
}

#[async_trait]
impl TokenEndpoint for WithingsTokenEndpoint {
    fn vendor(&self) -> &'static str {
        "withings"
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let res = self
            .http
            .post(self.token_url.clone())
            .form(&[
                ("action", "requesttoken"),
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;
        let envelope = read_token_response(self.vendor(), res).await?;
        let status = int_field(envelope.get("status")).unwrap_or(-1);
        if status != 0 {
            return Err(EtlError::Authentication(format!(
                "withings token refresh returned status {status}"
            )));
        }
        grant_from(self.vendor(), envelope.get("body").unwrap_or(&Value::Null))
    }
}

#[derive(Clone)]
pub struct TokenStore {
    file: CredentialFile,
    endpoint: Arc<dyn TokenEndpoint>,
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStore")
            .field("vendor", &self.endpoint.vendor())
            .field("file", &self.file.path())
            .finish()
    }
}

impl TokenStore {
    pub fn new(file: CredentialFile, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self { file, endpoint }
    }

    pub fn file(&self) -> &CredentialFile {
        &self.file
    }

    pub async fn authenticate(&self) -> Result<Credential> {
        self.authenticate_at(Utc::now()).await
    }

    /// Cached credential while it is unexpired, otherwise a refreshed one.
    #[instrument(skip_all, fields(vendor = self.endpoint.vendor()))]
    pub async fn authenticate_at(&self, now: DateTime<Utc>) -> Result<Credential> {
        let cached = self.cached()?;
        if cached.is_valid_at(now) {
            debug!("using cached access token");
            return Ok(cached);
        }
        self.refresh_from(&cached, now).await
    }

    /// Refresh even if the cached token looks valid (e.g. after a 401).
    pub async fn force_refresh(&self) -> Result<Credential> {
        let cached = self.cached()?;
        self.refresh_from(&cached, Utc::now()).await
    }

    fn cached(&self) -> Result<Credential> {
        self.file.load()?.ok_or_else(|| {
            EtlError::Authentication(format!(
                "no cached {} credential at {}",
                self.endpoint.vendor(),
                self.file.path().display()
            ))
        })
    }

    async fn refresh_from(&self, cached: &Credential, now: DateTime<Utc>) -> Result<Credential> {
        let Some(refresh_token) = cached.refresh_token.as_deref().filter(|t| !t.is_empty()) else {
            return Err(EtlError::Authentication(format!(
                "{} credential expired and no refresh token is available",
                self.endpoint.vendor()
            )));
        };
        let grant = self.endpoint.refresh(refresh_token).await?;
        let renewed = cached.renewed(grant, now);
        self.file.save(&renewed)?;
        info!(vendor = self.endpoint.vendor(), expires_at = ?renewed.expires_at, "access token refreshed");
        Ok(renewed)
    }
}
