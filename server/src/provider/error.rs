//! Provider Gateway Errors

use thiserror::Error;

/// Errors talking to the external call provider.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No provider credentials configured; nothing can succeed.
    #[error("Call provider is not configured")]
    NotConfigured,

    /// The provider did not answer in time.
    #[error("Call provider request timed out")]
    Timeout,

    /// Transport-level failure.
    #[error("Call provider request failed: {0}")]
    Http(String),

    /// The provider answered with an error status.
    #[error("Call provider returned {status}: {message}")]
    Provider {
        /// HTTP status code.
        status: u16,
        /// Error body, truncated.
        message: String,
    },

    /// The provider answered with something we could not read.
    #[error("Invalid call provider response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Http(err.to_string())
        }
    }
}
