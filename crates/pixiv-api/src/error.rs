//! Error types for the upstream API client.

use pixiv_backup_core::classify::{classify_status, ErrorCategory};
use thiserror::Error;

/// Result type alias for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Errors that can occur while talking to the upstream service.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport-level failure (connect, DNS, TLS, timeout, mid-stream EOF).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-success response from the upstream service.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Token exchange failed or the session could not be restored.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Local file trouble while streaming a body or caching a token.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Http(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Map this error onto the retry taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Api { status, message } => classify_status(*status, message),
            Self::Http(err) => {
                if let Some(status) = err.status() {
                    classify_status(status.as_u16(), "")
                } else if err.is_decode() {
                    ErrorCategory::Unknown
                } else {
                    // connect, timeout, request and body errors are all
                    // transport trouble
                    ErrorCategory::Network
                }
            }
            Self::Auth(_) => ErrorCategory::Auth,
            Self::Json(_) | Self::Io(_) => ErrorCategory::Unknown,
        }
    }
}
