//! Error types for the data access layer

use thiserror::Error;

/// Backend operation error types.
///
/// `Clone` so a single-flight leader can hand the same failure to every
/// caller that joined its refresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    /// The platform answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The request timed out before a response arrived.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Network or protocol failure before a status was received.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body or a header could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Invalid argument
    #[error("Invalid {field}: {message}")]
    InvalidArgument {
        field: &'static str,
        message: String,
    },

    /// Failure produced on purpose by the in-memory backend.
    #[error("injected failure: {0}")]
    Injected(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for backend operations
pub type DbResult<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Create an invalid argument error
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field,
            message: message.into(),
        }
    }

    /// Whether retrying the same call later could plausibly succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// The stable error code string for this error.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Http { .. } | Self::Timeout(_) | Self::Transport(_) => "BACKEND_OPERATION_FAILED",
            Self::Decode(_) => "DECODE_ERROR",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::Injected(_) => "INJECTED_FAILURE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
