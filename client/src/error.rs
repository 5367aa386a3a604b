//! Client Errors

use thiserror::Error;

/// Shown when a join fails without a more specific reason.
pub const JOIN_FALLBACK_MESSAGE: &str = "Could not join the call. Please try again.";

/// Errors returned by the presence server API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Bearer token missing, invalid or expired.
    #[error("Not authenticated")]
    Unauthorized,

    /// Caller may not perform the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Server has no call provider configured.
    #[error("Voice calls are not configured on this server")]
    NotConfigured,

    /// Too many join requests.
    #[error("Rate limited")]
    RateLimited,

    /// Any other non-success response.
    #[error("Server error ({status}): {message}")]
    Server {
        status: u16,
        code: String,
        message: String,
    },

    /// Transport failure.
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// Invalid server URL.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Reasons a join attempt failed.
#[derive(Debug, Error)]
pub enum JoinError {
    /// Server refused the token because the user may not join.
    #[error("You don't have permission to join this call")]
    PermissionDenied,

    /// Token request failed for another reason.
    #[error("Token request failed: {0}")]
    TokenRequest(ApiError),

    /// Microphone or camera access was refused locally.
    #[error("Microphone or camera access was denied")]
    MediaPermissionDenied,

    /// Provider room could not be joined.
    #[error("Could not connect to the call: {0}")]
    Media(String),

    /// A step did not finish in time.
    #[error("Timed out while {0}")]
    Timeout(&'static str),

    /// The call was ended (kick, replacement) while still connecting.
    #[error("Join was cancelled")]
    Aborted,
}

impl JoinError {
    /// Message suitable for showing to the user.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::PermissionDenied | Self::MediaPermissionDenied => self.to_string(),
            Self::TokenRequest(ApiError::NotConfigured) => {
                ApiError::NotConfigured.to_string()
            }
            Self::TokenRequest(_) => "Could not get a call token from the server".to_string(),
            Self::Media(_) | Self::Timeout(_) | Self::Aborted => JOIN_FALLBACK_MESSAGE.to_string(),
        }
    }
}

/// Local track could not be switched.
#[derive(Debug, Error)]
pub enum TrackError {
    #[error("Not in a call")]
    NotJoined,

    #[error("Media operation failed: {0}")]
    Failed(String),

    #[error("Media operation timed out")]
    Timeout,
}

impl ApiError {
    /// The server refused the request outright, so it changed nothing.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized | Self::PermissionDenied(_) | Self::NotConfigured | Self::RateLimited
        )
    }
}

impl From<ApiError> for JoinError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::PermissionDenied(_) => Self::PermissionDenied,
            other => Self::TokenRequest(other),
        }
    }
}
