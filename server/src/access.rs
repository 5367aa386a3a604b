//! Access Control
//!
//! Yes/no capability checks against the external authorization service.
//! The rules themselves live in that service; this module only asks.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;
use vc_common::ModerationAction;

/// What a user may do in a voice channel they are allowed to join.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JoinGrant {
    /// Planet (community) the channel belongs to, if any.
    #[serde(default)]
    pub planet_id: Option<Uuid>,
    /// Name shown to other participants.
    pub display_name: String,
    /// Whether the user may publish video.
    #[serde(default)]
    pub allow_video: bool,
}

/// Authority levels of both sides of a moderation action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ModerationAuthority {
    /// Authority of the acting user.
    pub actor: i64,
    /// Authority of the target user.
    pub target: i64,
}

/// Whether an actor may moderate a target: strictly higher authority wins.
pub const fn can_moderate(authority: ModerationAuthority) -> bool {
    authority.actor > authority.target
}

/// Access check errors.
#[derive(Debug, Error)]
pub enum AccessError {
    /// The user lacks the capability.
    #[error("Permission denied")]
    Denied,

    /// The channel does not exist or is not a voice channel.
    #[error("Channel not found")]
    ChannelNotFound,

    /// The authorization service did not answer in time.
    #[error("Authorization check timed out")]
    Timeout,

    /// The authorization service could not be reached or answered garbage.
    #[error("Authorization service unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for AccessError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

/// External permission collaborator.
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// May `user_id` view and join `channel_id`?
    async fn check_join(&self, user_id: Uuid, channel_id: Uuid) -> Result<JoinGrant, AccessError>;

    /// May `actor_id` apply `action` to `target_id` in `channel_id`?
    ///
    /// Returns both authorities; the caller compares them.
    async fn check_moderation(
        &self,
        actor_id: Uuid,
        target_id: Uuid,
        channel_id: Uuid,
        action: ModerationAction,
    ) -> Result<ModerationAuthority, AccessError>;
}

#[derive(Debug, Serialize)]
struct JoinCheckRequest {
    user_id: Uuid,
    channel_id: Uuid,
}

#[derive(Debug, Serialize)]
struct ModerationCheckRequest {
    actor_user_id: Uuid,
    target_user_id: Uuid,
    channel_id: Uuid,
    action: ModerationAction,
}

/// [`AccessControl`] backed by the authorization service's REST API.
///
/// - `POST {base}/voice/join-check` -> [`JoinGrant`]
/// - `POST {base}/voice/moderation-check` -> [`ModerationAuthority`]
///
/// 403 means denied, 404 means unknown channel.
#[derive(Clone)]
pub struct HttpAccessControl {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAccessControl {
    /// Create a client with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AccessError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AccessError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + Sync, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, AccessError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await?;

        match response.status() {
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => Err(AccessError::Denied),
            StatusCode::NOT_FOUND => Err(AccessError::ChannelNotFound),
            status if status.is_success() => Ok(response.json().await?),
            status => {
                warn!(%status, path, "Authorization service returned an error");
                Err(AccessError::Unavailable(format!("status {status}")))
            }
        }
    }
}

#[async_trait]
impl AccessControl for HttpAccessControl {
    async fn check_join(&self, user_id: Uuid, channel_id: Uuid) -> Result<JoinGrant, AccessError> {
        self.post("/voice/join-check", &JoinCheckRequest { user_id, channel_id })
            .await
    }

    async fn check_moderation(
        &self,
        actor_id: Uuid,
        target_id: Uuid,
        channel_id: Uuid,
        action: ModerationAction,
    ) -> Result<ModerationAuthority, AccessError> {
        self.post(
            "/voice/moderation-check",
            &ModerationCheckRequest {
                actor_user_id: actor_id,
                target_user_id: target_id,
                channel_id,
                action,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_authority_cannot_moderate() {
        assert!(can_moderate(ModerationAuthority { actor: 50, target: 10 }));
        assert!(!can_moderate(ModerationAuthority { actor: 50, target: 50 }));
        assert!(!can_moderate(ModerationAuthority { actor: 10, target: 50 }));
    }

    #[test]
    fn test_join_grant_defaults() {
        let grant: JoinGrant = serde_json::from_str(r#"{"display_name":"Alice"}"#).unwrap();
        assert_eq!(grant.planet_id, None);
        assert!(!grant.allow_video);
    }

    #[test]
    fn test_moderation_request_shape() {
        let body = serde_json::to_value(ModerationCheckRequest {
            actor_user_id: Uuid::nil(),
            target_user_id: Uuid::nil(),
            channel_id: Uuid::nil(),
            action: ModerationAction::Kick,
        })
        .unwrap();
        assert_eq!(body["action"], "kick");
    }
}
