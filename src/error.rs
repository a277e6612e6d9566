//! Error kinds shared by the extraction pipeline.
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EtlError {
    /// No cached valid token and no way to obtain a new one.
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("{vendor} returned HTTP {status}: {body}")]
    Http {
        vendor: &'static str,
        status: u16,
        body: String,
    },
    #[error("{vendor} reported status {status}")]
    VendorStatus { vendor: &'static str, status: i64 },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("credential file {}: {source}", path.display())]
    CredentialFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EtlError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, EtlError::Authentication(_))
    }
}

pub type Result<T, E = EtlError> = std::result::Result<T, E>;
