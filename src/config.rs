//! Configuration loader and validator for the health data pipeline.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub whoop: Whoop,
    pub withings: Withings,
    pub api: Api,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_retries")]
    pub max_retries: u32,
    pub max_backoff_seconds: u64,
    #[serde(default = "default_safety_days")]
    pub incremental_safety_days: i64,
}

/// Wearable tracker (vendor 1) OAuth client and endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Whoop {
    pub client_id: String,
    pub client_secret: String,
    pub token_file: String,
    pub api_base: String,
    pub token_url: String,
}

/// Smart scale / health monitor (vendor 2) OAuth client and endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Withings {
    pub client_id: String,
    pub client_secret: String,
    pub token_file: String,
    pub api_base: String,
    pub body_meastypes: Vec<i64>,
    pub vitals_meastypes: Vec<i64>,
}

/// Query API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Api {
    pub bind: String,
    pub default_weeks: u32,
}

fn default_timeout() -> u64 {
    30
}

fn default_retries() -> u32 {
    3
}

const MAX_SAFETY_DAYS: i64 = 365;

fn default_safety_days() -> i64 {
    1
}

impl App {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins; otherwise a sqlite file inside `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/healthsync.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }

    pub fn whoop_token_path(&self) -> PathBuf {
        PathBuf::from(&self.whoop.token_file)
    }

    pub fn withings_token_path(&self) -> PathBuf {
        PathBuf::from(&self.withings.token_file)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn is_url(s: &str) -> bool {
    Url::parse(s).is_ok()
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.request_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("app.request_timeout_seconds must be > 0"));
    }
    if !(0..=MAX_SAFETY_DAYS).contains(&cfg.app.incremental_safety_days) {
        return Err(ConfigError::Invalid(
            "app.incremental_safety_days must be between 0 and 365",
        ));
    }

    if cfg.whoop.client_id.trim().is_empty() {
        return Err(ConfigError::Invalid("whoop.client_id must be non-empty"));
    }
    if cfg.whoop.client_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("whoop.client_secret must be non-empty"));
    }
    if cfg.whoop.token_file.trim().is_empty() {
        return Err(ConfigError::Invalid("whoop.token_file must be non-empty"));
    }
    if !is_url(&cfg.whoop.api_base) {
        return Err(ConfigError::Invalid("whoop.api_base must be a valid URL"));
    }
    if !is_url(&cfg.whoop.token_url) {
        return Err(ConfigError::Invalid("whoop.token_url must be a valid URL"));
    }

    if cfg.withings.client_id.trim().is_empty() {
        return Err(ConfigError::Invalid("withings.client_id must be non-empty"));
    }
    if cfg.withings.client_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("withings.client_secret must be non-empty"));
    }
    if cfg.withings.token_file.trim().is_empty() {
        return Err(ConfigError::Invalid("withings.token_file must be non-empty"));
    }
    if !is_url(&cfg.withings.api_base) {
        return Err(ConfigError::Invalid("withings.api_base must be a valid URL"));
    }
    if cfg.withings.body_meastypes.is_empty() {
        return Err(ConfigError::Invalid("withings.body_meastypes must be non-empty"));
    }
    if cfg.withings.vitals_meastypes.is_empty() {
        return Err(ConfigError::Invalid("withings.vitals_meastypes must be non-empty"));
    }

    if cfg.api.bind.trim().is_empty() {
        return Err(ConfigError::Invalid("api.bind must be non-empty"));
    }
    if cfg.api.default_weeks == 0 {
        return Err(ConfigError::Invalid("api.default_weeks must be > 0"));
    }

    Ok(())
}

/// Returns an example YAML document that passes validation.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  request_timeout_seconds: 30
  max_retries: 3
  max_backoff_seconds: 60
  incremental_safety_days: 1

whoop:
  client_id: "YOUR_WHOOP_CLIENT_ID"
  client_secret: "YOUR_WHOOP_CLIENT_SECRET"
  token_file: ".whoop_tokens.json"
  api_base: "https://api.prod.whoop.com/"
  token_url: "https://api.prod.whoop.com/oauth/oauth2/token"

withings:
  client_id: "YOUR_WITHINGS_CLIENT_ID"
  client_secret: "YOUR_WITHINGS_CLIENT_SECRET"
  token_file: ".withings_tokens.json"
  api_base: "https://wbsapi.withings.net/"
  body_meastypes: [1, 4, 5, 6, 8, 76, 77, 88, 170]
  vitals_meastypes: [9, 10, 11]

api:
  bind: "127.0.0.1:8000"
  default_weeks: 4
"#
}
