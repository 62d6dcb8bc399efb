use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{
    config::LoadError,
    infra::error::InfraError,
    tracker::{ErrorKind, SourceError, TrackerError},
};

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        let report = ErrorReport::from_message(source, status, detail);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message).into_response();
        self.report.attach(&mut response);
        response
    }
}

impl From<TrackerError> for HttpError {
    fn from(error: TrackerError) -> Self {
        const SOURCE: &str = "tracker::coordinator";
        let (status, message) = match error.kind() {
            ErrorKind::Configuration => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Service misconfigured")
            }
            ErrorKind::Backend => (StatusCode::BAD_GATEWAY, "Freshness backend unavailable"),
            ErrorKind::MalformedInput => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
            ErrorKind::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "Request cancelled"),
        };
        HttpError::from_error(SOURCE, status, message, &error)
    }
}

impl From<SourceError> for HttpError {
    fn from(error: SourceError) -> Self {
        const SOURCE: &str = "tracker::source";
        let (status, message) = match &error {
            SourceError::KeyNotFound { .. } => (StatusCode::NOT_FOUND, "Table is not tracked"),
            SourceError::InvalidKey | SourceError::LengthMismatch { .. } => {
                (StatusCode::BAD_REQUEST, "Invalid table name")
            }
            SourceError::Unsupported { .. } => {
                (StatusCode::NOT_IMPLEMENTED, "Operation not supported")
            }
            SourceError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "Request cancelled"),
            SourceError::Backend { .. } | SourceError::Database(_) => {
                (StatusCode::BAD_GATEWAY, "Freshness backend unavailable")
            }
        };
        HttpError::from_error(SOURCE, status, message, &error)
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
