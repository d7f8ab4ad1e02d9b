//! Error types for forecache
//!
//! This module defines the common error type shared by the engine and
//! its collaborators. Storage and transfer errors have their own enums in
//! the index and engine crates and convert into this one at the edges.

use thiserror::Error;

/// Common result type for forecache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for forecache
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("invalid cache path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("invalid schedule for model {model}: {reason}")]
    InvalidSchedule { model: String, reason: String },

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("startup failed: {0}")]
    Startup(String),

    #[error("index error: {0}")]
    Index(String),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a startup error
    pub fn startup(msg: impl Into<String>) -> Self {
        Self::Startup(msg.into())
    }

    /// Create an index error
    pub fn index(msg: impl Into<String>) -> Self {
        Self::Index(msg.into())
    }

    pub(crate) fn invalid_timestamp(value: &str, reason: impl ToString) -> Self {
        Self::InvalidTimestamp {
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid_path(path: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// Errors that abort the process instead of being logged and counted
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Startup(_))
    }

    /// Errors caused by configuration or caller input rather than I/O
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::UnknownModel(_)
                | Self::InvalidSchedule { .. }
                | Self::InvalidPath { .. }
        )
    }
}
