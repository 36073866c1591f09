//! Crate-wide error type.
//!
//! Mirrors the shape of a hand-rolled `Error` enum over a `thiserror`
//! derive at this top level: manual `Display`/`std::error::Error`, plus
//! constructor helpers and a `category()`/`status_code()` pair so any
//! surface that needs to render one doesn't have to match on variants
//! itself. Focused sub-modules (jobs, parser config) define their own
//! `thiserror` enums and bridge into this one with `From`.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Config(String),
    Network(String),
    Validation(String),
    NotFound(String),
    Payment(String),
    Storage(String),
    Cache(String),
    Notification(String),
    RateLimit(String),
    CircuitOpen,
    HttpError(u16, String),
    Serialization(serde_json::Error),
    Io(std::io::Error),
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "configuration error: {msg}"),
            Error::Network(msg) => write!(f, "network error: {msg}"),
            Error::Validation(msg) => write!(f, "validation error: {msg}"),
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::Payment(msg) => write!(f, "payment error: {msg}"),
            Error::Storage(msg) => write!(f, "storage error: {msg}"),
            Error::Cache(msg) => write!(f, "cache error: {msg}"),
            Error::Notification(msg) => write!(f, "notification error: {msg}"),
            Error::RateLimit(msg) => write!(f, "rate limited: {msg}"),
            Error::CircuitOpen => write!(f, "circuit breaker is open"),
            Error::HttpError(status, msg) => write!(f, "http error {status}: {msg}"),
            Error::Serialization(e) => write!(f, "serialization error: {e}"),
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Serialization(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

/// Error taxonomy tag from spec §7, used for metrics and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Connection,
    Timeout,
    RateLimited,
    ServerError,
    ClientError,
    CircuitOpen,
    Validation,
    Payment,
    Other,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Error::Network(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn payment(msg: impl Into<String>) -> Self {
        Error::Payment(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    pub fn cache(msg: impl Into<String>) -> Self {
        Error::Cache(msg.into())
    }

    pub fn notification(msg: impl Into<String>) -> Self {
        Error::Notification(msg.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Network(_) | Error::Io(_) => ErrorCategory::Connection,
            Error::RateLimit(_) => ErrorCategory::RateLimited,
            Error::CircuitOpen => ErrorCategory::CircuitOpen,
            Error::Validation(_) | Error::NotFound(_) => ErrorCategory::Validation,
            Error::Payment(_) => ErrorCategory::Payment,
            Error::HttpError(status, _) if *status >= 500 => ErrorCategory::ServerError,
            Error::HttpError(_, _) => ErrorCategory::ClientError,
            _ => ErrorCategory::Other,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::NotFound(_) => 404,
            Error::RateLimit(_) => 429,
            Error::CircuitOpen => 503,
            Error::HttpError(status, _) => *status,
            Error::Payment(_) => 402,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_mapping() {
        assert_eq!(Error::validation("x").category(), ErrorCategory::Validation);
        assert_eq!(Error::CircuitOpen.category(), ErrorCategory::CircuitOpen);
        assert_eq!(Error::HttpError(503, "x".into()).category(), ErrorCategory::ServerError);
        assert_eq!(Error::HttpError(404, "x".into()).category(), ErrorCategory::ClientError);
    }

    #[test]
    fn status_code_mapping() {
        assert_eq!(Error::validation("x").status_code(), 400);
        assert_eq!(Error::CircuitOpen.status_code(), 503);
    }
}
