//! Voice Service Errors

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::access::AccessError;
use crate::presence::PresenceError;
use crate::provider::GatewayError;

/// Errors that can occur during voice operations.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// No call provider configured; nothing voice-related can work.
    #[error("Voice calls are not configured on this server")]
    NotConfigured,

    /// User not allowed to join or view the channel.
    #[error("Not authorized to join this voice channel")]
    PermissionDenied,

    /// Actor's authority does not exceed the target's.
    #[error("Not allowed to moderate this participant")]
    InsufficientAuthority,

    /// Channel not found.
    #[error("Channel not found")]
    ChannelNotFound,

    /// Target (or caller) is not in the voice channel.
    #[error("Not in voice channel")]
    NotInChannel,

    /// Moderation action name not recognized.
    #[error("Unknown moderation action: {0}")]
    UnknownAction(String),

    /// Client-supplied session id is unusable.
    #[error("Invalid session id")]
    InvalidSession,

    /// Rate limited.
    #[error("Rate limited: too many voice join requests")]
    RateLimited,

    /// Authorization service failed to answer.
    #[error("Permission check failed: {0}")]
    AccessUnavailable(String),

    /// Call provider request failed.
    #[error("Call provider error: {0}")]
    Provider(GatewayError),

    /// Presence registry failed.
    #[error("Presence registry error: {0}")]
    Presence(#[from] PresenceError),
}

impl IntoResponse for VoiceError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            Self::NotConfigured => (
                StatusCode::SERVICE_UNAVAILABLE,
                "PROVIDER_NOT_CONFIGURED",
                self.to_string(),
            ),
            Self::PermissionDenied => (StatusCode::FORBIDDEN, "PERMISSION_DENIED", self.to_string()),
            Self::InsufficientAuthority => {
                (StatusCode::FORBIDDEN, "INSUFFICIENT_AUTHORITY", self.to_string())
            }
            Self::ChannelNotFound => (StatusCode::NOT_FOUND, "CHANNEL_NOT_FOUND", self.to_string()),
            Self::NotInChannel => (StatusCode::BAD_REQUEST, "NOT_IN_CHANNEL", self.to_string()),
            Self::UnknownAction(_) => (StatusCode::BAD_REQUEST, "UNKNOWN_ACTION", self.to_string()),
            Self::InvalidSession => (StatusCode::BAD_REQUEST, "INVALID_SESSION", self.to_string()),
            Self::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", self.to_string()),
            Self::AccessUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "PERMISSION_CHECK_FAILED",
                "Could not verify permissions, try again".to_string(),
            ),
            Self::Provider(_) => (
                StatusCode::BAD_GATEWAY,
                "PROVIDER_ERROR",
                "Voice token request failed".to_string(),
            ),
            Self::Presence(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "PRESENCE_UNAVAILABLE",
                "Voice presence is temporarily unavailable".to_string(),
            ),
        };

        let body = Json(serde_json::json!({
            "error": message,
            "code": code,
        }));

        (status, body).into_response()
    }
}

impl From<vc_common::Error> for VoiceError {
    fn from(err: vc_common::Error) -> Self {
        match err {
            vc_common::Error::UnknownAction(action) => Self::UnknownAction(action),
            other => Self::UnknownAction(other.to_string()),
        }
    }
}

impl From<GatewayError> for VoiceError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NotConfigured => Self::NotConfigured,
            other => Self::Provider(other),
        }
    }
}

impl From<AccessError> for VoiceError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::Denied => Self::PermissionDenied,
            AccessError::ChannelNotFound => Self::ChannelNotFound,
            other => Self::AccessUnavailable(other.to_string()),
        }
    }
}
