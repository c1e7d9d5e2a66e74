//! Backend error types
//!
//! Errors raised while talking to the REST backend that owns tickets,
//! inspection reports, and their signed attachment URLs.

use thiserror::Error;

/// Error returned by any backend collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Not found: {entity} with id={id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

impl BackendError {
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        BackendError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Map a non-success HTTP status to an error
    pub fn from_status(status: u16, entity: &'static str, id: &str, body: &str) -> Self {
        let message = if body.trim().is_empty() {
            format!("request failed with status {}", status)
        } else {
            body.trim().to_string()
        };

        match status {
            404 => BackendError::not_found(entity, id),
            401 | 403 => BackendError::Unauthorized { message },
            _ => BackendError::Http { status, message },
        }
    }

    /// HTTP status associated with the error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            BackendError::NotFound { .. } => Some(404),
            BackendError::Unauthorized { .. } => Some(401),
            BackendError::Http { status, .. } => Some(*status),
            BackendError::Connection(_)
            | BackendError::Deserialization(_)
            | BackendError::InvalidRequest(_) => None,
        }
    }

    /// Whether repeating the same request later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Connection(_) => true,
            BackendError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            BackendError::NotFound { .. } => "not_found",
            BackendError::Unauthorized { .. } => "unauthorized",
            BackendError::Http { .. } => "http_error",
            BackendError::Connection(_) => "connection_error",
            BackendError::Deserialization(_) => "deserialization_error",
            BackendError::InvalidRequest(_) => "invalid_request",
        }
    }
}
