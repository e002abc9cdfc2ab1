//! Application-level error type.

use std::fmt::Debug;
use thiserror::Error;

/// Error type shared by configuration loading and process start-up.
///
/// Subsystems with richer failure modes (such as the job queue) define their
/// own error enums and convert into this one at the process boundary.
#[derive(Error, Debug)]
pub enum GraftoError {
    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Database connectivity or query failure.
    #[error("Database error: {0}")]
    Database(String),

    /// External service failure (mail provider, exporter).
    #[error("External service error: {service} - {message}")]
    ExternalService { service: String, message: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GraftoError {
    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration<T: Into<String>>(message: T) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }

    /// Checks if this error is retriable.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::ExternalService { .. })
    }
}

impl From<serde_json::Error> for GraftoError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON serialization error: {}", err))
    }
}
