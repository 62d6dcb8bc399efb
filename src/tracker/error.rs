use axum::http::header::InvalidHeaderValue;
use thiserror::Error;

use super::source::SourceError;

/// Failures surfaced by the conditional-cache engine.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("no version sources registered")]
    EmptyRegistry,
    #[error("version source `{id}` is registered more than once")]
    DuplicateProvider { id: String },
    #[error("version source `{id}` is not registered (available: {available})")]
    ProviderNotFound { id: String, available: String },
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("version source `{source_id}` failed: {source}")]
    Source {
        source_id: String,
        #[source]
        source: SourceError,
    },
    #[error("request cancelled while resolving freshness")]
    Cancelled,
    #[error("computed header value is not valid: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
}

/// Coarse classification used for HTTP mapping and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Backend,
    MalformedInput,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Backend => "backend",
            ErrorKind::MalformedInput => "malformed_input",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl TrackerError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Wrap a backend failure, lifting cancellation and argument errors into
    /// their own variants.
    pub fn from_source(source_id: &str, error: SourceError) -> Self {
        match error {
            SourceError::Cancelled => Self::Cancelled,
            SourceError::InvalidKey | SourceError::LengthMismatch { .. } => {
                Self::invalid_input(format!("version source `{source_id}`: {error}"))
            }
            other => Self::Source {
                source_id: source_id.to_string(),
                source: other,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackerError::EmptyRegistry
            | TrackerError::DuplicateProvider { .. }
            | TrackerError::ProviderNotFound { .. }
            | TrackerError::Configuration { .. } => ErrorKind::Configuration,
            TrackerError::Source { .. } => ErrorKind::Backend,
            TrackerError::InvalidInput { .. } | TrackerError::InvalidHeader(_) => {
                ErrorKind::MalformedInput
            }
            TrackerError::Cancelled => ErrorKind::Cancelled,
        }
    }
}
