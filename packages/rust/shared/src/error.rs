//! Error types for indexsync.
//!
//! Library crates use [`IndexSyncError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all indexsync operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexSyncError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to the content source or the index.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed job record, manifest, or response body.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid input (bad name, bad parameter, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Transform stage failure for a single item.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// The index rejected a publish or retract call.
    #[error("publish error: {0}")]
    Publish(String),

    /// A job (or other addressed object) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested job state transition is not allowed.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// The request conflicts with the current state of the object.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Bounded retries were used up (e.g. job id allocation).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, IndexSyncError>;

impl IndexSyncError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Build an invalid-transition error from two displayable states.
    pub fn transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// HTTP-style status code an operator-facing adapter should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Validation { .. } => 400,
            Self::InvalidTransition { .. } | Self::Conflict(_) => 409,
            Self::ResourceExhausted(_) => 503,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = IndexSyncError::config("missing index url");
        assert_eq!(err.to_string(), "config error: missing index url");

        let err = IndexSyncError::transition("running", "running");
        assert_eq!(err.to_string(), "invalid state transition: running -> running");
    }

    #[test]
    fn status_codes() {
        assert_eq!(IndexSyncError::NotFound("job 7".into()).status_code(), 404);
        assert_eq!(IndexSyncError::validation("bad action").status_code(), 400);
        assert_eq!(IndexSyncError::transition("paused", "paused").status_code(), 409);
        assert_eq!(IndexSyncError::Conflict("active".into()).status_code(), 409);
        assert_eq!(IndexSyncError::Network("down".into()).status_code(), 500);
    }
}
