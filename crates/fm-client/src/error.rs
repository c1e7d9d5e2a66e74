//! Error types for the REST adapter.

use thiserror::Error;

/// Errors raised while setting up the client
#[derive(Debug, Error)]
pub enum ClientError {
    /// The base URL cannot be used to build request URLs
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),

    /// The underlying HTTP client could not be built
    #[error("configuration error: {0}")]
    Configuration(String),
}
