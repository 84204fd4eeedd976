use serde::Serialize;
use thiserror::Error;

use crate::compose::ComposeError;
use crate::config::ConfigError;
use crate::reference::ReferenceError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("unknown touch {touch} on the {track} track")]
    UnknownTouch { track: String, touch: u32 },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
    #[error("read-only violation: {0}")]
    ReadOnlyViolation(String),
    #[error("runtime failure: {0}")]
    Runtime(String),
}

/// Coarse failure class reported by the CLI and used for its exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Config,
    Runtime,
    Upstream,
    Cache,
    ReadOnly,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Runtime => "runtime",
            Self::Upstream => "upstream",
            Self::Cache => "cache",
            Self::ReadOnly => "read_only_violation",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config => 2,
            Self::Runtime => 3,
            Self::Upstream => 4,
            Self::Cache => 5,
            Self::ReadOnly => 70,
        }
    }
}

impl ApplicationError {
    /// A fatal error aborts the whole run instead of skipping one lead.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ReadOnlyViolation(_) | Self::Configuration(_))
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Domain(_) | Self::Runtime(_) => ErrorClass::Runtime,
            Self::Persistence(_) => ErrorClass::Cache,
            Self::Integration(_) => ErrorClass::Upstream,
            Self::Configuration(_) => ErrorClass::Config,
            Self::ReadOnlyViolation(_) => ErrorClass::ReadOnly,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self.class() {
            ErrorClass::Config => "Configuration is invalid. Run `touchpoint config` to inspect it.",
            ErrorClass::Runtime => "The digest run failed unexpectedly.",
            ErrorClass::Upstream => "An upstream service is unavailable. Please retry shortly.",
            ErrorClass::Cache => "The local cache database could not be used.",
            ErrorClass::ReadOnly => {
                "A write request to the CRM was attempted and blocked. The run was aborted."
            }
        }
    }
}

impl From<ConfigError> for ApplicationError {
    fn from(value: ConfigError) -> Self {
        Self::Configuration(value.to_string())
    }
}

impl From<ReferenceError> for ApplicationError {
    fn from(value: ReferenceError) -> Self {
        Self::Configuration(value.to_string())
    }
}

impl From<ComposeError> for ApplicationError {
    fn from(value: ComposeError) -> Self {
        match value {
            ComposeError::UnknownTouch { track, touch } => {
                Self::Domain(DomainError::UnknownTouch { track: track.as_str().to_string(), touch })
            }
            ComposeError::Template(error) => Self::Runtime(error.to_string()),
        }
    }
}
