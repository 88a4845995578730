//! Error types for the client crate.

use calibra_core::session::LogoutReason;
use thiserror::Error;

use crate::refresh::RefreshFailure;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Retry policy class for API failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Errors that can occur while talking to the lab API.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API error response from the lab service
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Invalid request (already retried, missing data, etc.)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication error (missing or malformed token)
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The session ended; the user has to sign in again
    #[error("Session terminated: {0}")]
    SessionTerminated(LogoutReason),

    /// The shared token refresh failed
    #[error("Token refresh failed: {0}")]
    Refresh(RefreshFailure),

    /// Credential persistence error
    #[error("Store error: {0}")]
    Store(#[from] calibra_core::Error),

    /// The owning view went away before the call completed
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl ClientError {
    /// Create an API error from status and message
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create an auth error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Refresh(failure) => failure.status,
            _ => None,
        }
    }

    /// True when the session is over and the user must sign in again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionTerminated(_) | Self::Refresh(_))
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> ApiRetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                401 | 403 => ApiRetryClass::ReauthRequired,
                408 | 409 | 423 | 425 | 429 => ApiRetryClass::Retryable,
                500..=599 => ApiRetryClass::Retryable,
                _ => ApiRetryClass::Permanent,
            },
            Self::Http(_) => ApiRetryClass::Retryable,
            Self::Json(_) => ApiRetryClass::Permanent,
            Self::InvalidRequest(_) => ApiRetryClass::Permanent,
            Self::Auth(_) | Self::SessionTerminated(_) | Self::Refresh(_) => {
                ApiRetryClass::ReauthRequired
            }
            Self::Store(_) => ApiRetryClass::Permanent,
            Self::Cancelled(_) => ApiRetryClass::Retryable,
        }
    }
}
