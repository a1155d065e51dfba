//! Error types for configuration loading

use thiserror::Error;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Configuration error types.
///
/// Both variants are fatal: the CLI exits before any stage runs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required key was not found in the environment or `.env`.
    #[error("missing required configuration: {key}")]
    Missing { key: &'static str },

    /// A key was present but could not be parsed.
    #[error("invalid {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

impl ConfigError {
    /// Create an invalid-value error
    pub fn invalid(key: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            message: message.into(),
        }
    }

    /// The stable error code string for this error.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Missing { .. } => "CONFIG_MISSING",
            Self::Invalid { .. } => "CONFIG_INVALID",
        }
    }
}
