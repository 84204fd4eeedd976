use std::path::PathBuf;

use thiserror::Error;
use touchpoint_core::errors::ApplicationError;

#[derive(Debug, Error)]
pub enum SourceError {
    /// A non-GET request was about to reach a read-only host. Never retried.
    #[error("blocked {method} request to read-only host: {url}")]
    MutationBlocked { method: String, url: String },
    #[error("HTTP {status} from {url}: {body}")]
    Status { status: u16, url: String, body: String },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("HTTP client could not be built: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("invalid URL `{0}`")]
    InvalidUrl(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

impl SourceError {
    pub fn is_mutation_blocked(&self) -> bool {
        matches!(self, Self::MutationBlocked { .. })
    }
}

impl From<SourceError> for ApplicationError {
    fn from(value: SourceError) -> Self {
        match value {
            SourceError::MutationBlocked { .. } => Self::ReadOnlyViolation(value.to_string()),
            SourceError::NotConfigured(_) => Self::Configuration(value.to_string()),
            other => Self::Integration(other.to_string()),
        }
    }
}
