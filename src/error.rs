use std::fmt;
use thiserror::Error;

/// Closed classification of platform error codes, so retry policy is
/// total instead of string-matching on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Access token invalid or expired; one forced refresh-and-retry.
    TokenExpired,
    /// Requested page size too large; caller shrinks and retries the same page.
    PageTooLarge,
    /// Platform throttled the request.
    RateLimited,
    /// Any other platform-reported failure.
    Other,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("auth error: {0}")]
    Auth(String),

    #[error("platform API error (code {code}): {message}")]
    Api {
        kind: ApiErrorKind,
        code: i64,
        message: String,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("sync error for {window}: {message}")]
    Sync { window: String, message: String },

    #[error("request superseded by a newer local read")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The API error kind, when this is a platform-reported error.
    pub fn api_kind(&self) -> Option<ApiErrorKind> {
        match self {
            Error::Api { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
