//! Presence Server API
//!
//! REST calls a call session makes against the presence server.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;
use url::Url;
use uuid::Uuid;
use vc_common::{HeartbeatResponse, ModerationAction, ParticipantsResponse, TokenResponse};

use crate::error::ApiError;

/// Voice endpoints of the presence server.
#[async_trait]
pub trait VoiceApi: Send + Sync {
    /// Join `channel_id` as `session_id` and get provider credentials.
    async fn request_token(
        &self,
        channel_id: Uuid,
        session_id: &str,
    ) -> Result<TokenResponse, ApiError>;

    /// Leave `channel_id`. Returns whether a presence entry was removed.
    async fn leave(&self, channel_id: Uuid, session_id: &str) -> Result<bool, ApiError>;

    /// Refresh the caller's presence entry.
    async fn heartbeat(&self) -> Result<HeartbeatResponse, ApiError>;

    /// Current participants of a channel.
    async fn participants(&self, channel_id: Uuid) -> Result<ParticipantsResponse, ApiError>;

    /// Mute, unmute or kick another participant.
    async fn moderate(
        &self,
        channel_id: Uuid,
        target_user_id: Uuid,
        action: ModerationAction,
    ) -> Result<(), ApiError>;
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    code: String,
}

#[derive(Deserialize)]
struct LeaveBody {
    left: bool,
}

/// `VoiceApi` over HTTP with a bearer token.
pub struct HttpVoiceApi {
    http: Client,
    base_url: Url,
    access_token: String,
}

impl HttpVoiceApi {
    /// Client for the server at `base_url` (e.g. `https://voice.example.com`).
    pub fn new(base_url: &str, access_token: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            access_token: access_token.into(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.access_token)
    }

    async fn send<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, ApiError> {
        let response = Self::check(builder.send().await?).await?;
        Ok(response.json().await?)
    }

    /// Turn non-success responses into typed errors.
    async fn check(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.json::<ErrorBody>().await.ok();
        debug!(status = %status, code = ?body.as_ref().map(|b| &b.code), "voice API error");

        Err(match status {
            StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
            StatusCode::FORBIDDEN => {
                ApiError::PermissionDenied(body.map(|b| b.code).unwrap_or_default())
            }
            StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited,
            _ => match body {
                Some(b) if b.code == "PROVIDER_NOT_CONFIGURED" => ApiError::NotConfigured,
                Some(b) => ApiError::Server {
                    status: status.as_u16(),
                    code: b.code,
                    message: b.error,
                },
                None => ApiError::Server {
                    status: status.as_u16(),
                    code: String::new(),
                    message: status.to_string(),
                },
            },
        })
    }
}

#[async_trait]
impl VoiceApi for HttpVoiceApi {
    async fn request_token(
        &self,
        channel_id: Uuid,
        session_id: &str,
    ) -> Result<TokenResponse, ApiError> {
        let url = self.url(&format!("/voice/token/{channel_id}"))?;
        let request = self
            .authed(self.http.post(url))
            .query(&[("session_id", session_id)]);
        Self::send(request).await
    }

    async fn leave(&self, channel_id: Uuid, session_id: &str) -> Result<bool, ApiError> {
        let url = self.url(&format!("/voice/channels/{channel_id}/leave"))?;
        let request = self
            .authed(self.http.post(url))
            .query(&[("session_id", session_id)]);
        Ok(Self::send::<LeaveBody>(request).await?.left)
    }

    async fn heartbeat(&self) -> Result<HeartbeatResponse, ApiError> {
        let url = self.url("/voice/heartbeat")?;
        Self::send(self.authed(self.http.post(url))).await
    }

    async fn participants(&self, channel_id: Uuid) -> Result<ParticipantsResponse, ApiError> {
        let url = self.url(&format!("/voice/channels/{channel_id}/participants"))?;
        Self::send(self.authed(self.http.get(url))).await
    }

    async fn moderate(
        &self,
        channel_id: Uuid,
        target_user_id: Uuid,
        action: ModerationAction,
    ) -> Result<(), ApiError> {
        let url = self.url(&format!(
            "/voice/channels/{channel_id}/participants/{target_user_id}/{action}"
        ))?;
        Self::check(self.authed(self.http.post(url)).send().await?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn test_router() -> Router {
        Router::new()
            .route(
                "/voice/token/{channel_id}",
                post(
                    |headers: HeaderMap,
                     Path(channel_id): Path<Uuid>,
                     Query(q): Query<HashMap<String, String>>| async move {
                        if headers.get("authorization").and_then(|v| v.to_str().ok())
                            != Some("Bearer secret")
                        {
                            return Err((
                                AxumStatus::UNAUTHORIZED,
                                Json(json!({"error": "Invalid token", "code": "UNAUTHORIZED"})),
                            ));
                        }
                        Ok(Json(json!({
                            "channel_id": channel_id,
                            "meeting_id": "m-1",
                            "participant_id": "p-1",
                            "auth_token": "tok",
                            "session_id": q.get("session_id"),
                            "heartbeat_interval_secs": 45,
                        })))
                    },
                ),
            )
            .route(
                "/voice/channels/{channel_id}/leave",
                post(|| async { Json(json!({"left": true})) }),
            )
            .route(
                "/voice/channels/{channel_id}/participants",
                get(|| async {
                    (
                        AxumStatus::FORBIDDEN,
                        Json(json!({"error": "Not authorized", "code": "PERMISSION_DENIED"})),
                    )
                }),
            )
            .route(
                "/voice/heartbeat",
                post(|| async {
                    (
                        AxumStatus::SERVICE_UNAVAILABLE,
                        Json(json!({
                            "error": "Voice calls are not configured on this server",
                            "code": "PROVIDER_NOT_CONFIGURED",
                        })),
                    )
                }),
            )
    }

    #[tokio::test]
    async fn test_token_request_sends_session_and_bearer() {
        let base = serve(test_router()).await;
        let api = HttpVoiceApi::new(&base, "secret").unwrap();
        let channel = Uuid::new_v4();

        let token = api.request_token(channel, "tab-1").await.unwrap();
        assert_eq!(token.channel_id, channel);
        assert_eq!(token.session_id.as_deref(), Some("tab-1"));
        assert_eq!(token.auth_token, "tok");

        assert!(api.leave(channel, "tab-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_error_responses_are_typed() {
        let base = serve(test_router()).await;

        let api = HttpVoiceApi::new(&base, "wrong").unwrap();
        assert!(matches!(
            api.request_token(Uuid::new_v4(), "s").await,
            Err(ApiError::Unauthorized)
        ));

        let api = HttpVoiceApi::new(&base, "secret").unwrap();
        match api.participants(Uuid::new_v4()).await {
            Err(ApiError::PermissionDenied(code)) => assert_eq!(code, "PERMISSION_DENIED"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(api.heartbeat().await, Err(ApiError::NotConfigured)));
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            HttpVoiceApi::new("not a url", "t"),
            Err(ApiError::Url(_))
        ));
    }
}
