//! HTTP client for the call provider's REST API.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::api::{AddParticipantRequest, CreatedParticipant, ProviderApi, SessionParticipant};
use super::GatewayError;
use crate::config::ProviderConfig;

/// Longest error body kept in a [`GatewayError::Provider`].
const MAX_ERROR_BODY: usize = 512;

/// Standard `{ "success": .., "data": .. }` envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Serialize)]
struct CreateMeetingBody<'a> {
    title: &'a str,
}

#[derive(Debug, Deserialize)]
struct MeetingData {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SessionsData {
    #[serde(default)]
    sessions: Vec<SessionData>,
}

#[derive(Debug, Deserialize)]
struct SessionData {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ParticipantsData {
    #[serde(default)]
    participants: Vec<SessionParticipant>,
}

#[derive(Debug, Serialize)]
struct KickBody<'a> {
    participant_ids: &'a [String],
}

/// Provider API over HTTPS with basic auth (`org_id:api_key`).
#[derive(Clone)]
pub struct HttpProviderApi {
    http: Client,
    base_url: String,
    org_id: String,
    api_key: String,
}

impl HttpProviderApi {
    /// Build a client; every request is bounded by the configured timeout.
    pub fn new(config: &ProviderConfig) -> Result<Self, GatewayError> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            org_id: config.org_id.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.org_id, Some(&self.api_key))
    }

    async fn check(response: Response) -> Result<Response, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(GatewayError::Provider {
            status: status.as_u16(),
            message: truncate_body(message),
        })
    }

    async fn data<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, GatewayError> {
        let response = Self::check(request.send().await?).await?;
        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.data)
    }
}

/// Cut an error body to at most [`MAX_ERROR_BODY`] bytes on a char boundary.
fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

#[async_trait]
impl ProviderApi for HttpProviderApi {
    async fn create_meeting(&self, title: &str) -> Result<String, GatewayError> {
        let request = self
            .authed(self.http.post(self.url("/meetings")))
            .json(&CreateMeetingBody { title });
        let meeting: MeetingData = Self::data(request).await?;
        debug!(meeting_id = %meeting.id, "Provider meeting created");
        Ok(meeting.id)
    }

    async fn add_participant(
        &self,
        meeting_id: &str,
        request: &AddParticipantRequest,
    ) -> Result<CreatedParticipant, GatewayError> {
        let builder = self
            .authed(
                self.http
                    .post(self.url(&format!("/meetings/{meeting_id}/participants"))),
            )
            .json(request);
        Self::data(builder).await
    }

    async fn live_sessions(&self, meeting_id: &str) -> Result<Vec<String>, GatewayError> {
        let request = self
            .authed(self.http.get(self.url("/sessions")))
            .query(&[("associated_id", meeting_id), ("status", "LIVE")]);
        let sessions: SessionsData = Self::data(request).await?;
        Ok(sessions.sessions.into_iter().map(|s| s.id).collect())
    }

    async fn session_participants(
        &self,
        session_id: &str,
    ) -> Result<Vec<SessionParticipant>, GatewayError> {
        let request = self.authed(
            self.http
                .get(self.url(&format!("/sessions/{session_id}/participants"))),
        );
        let participants: ParticipantsData = Self::data(request).await?;
        Ok(participants.participants)
    }

    async fn kick_participants(
        &self,
        meeting_id: &str,
        participant_ids: &[String],
    ) -> Result<(), GatewayError> {
        let request = self
            .authed(self.http.post(
                self.url(&format!("/meetings/{meeting_id}/active-session/kick")),
            ))
            .json(&KickBody { participant_ids });
        Self::check(request.send().await?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_listing_parses_left_marker() {
        let json = r#"{
            "success": true,
            "data": {
                "participants": [
                    {"id": "p1", "custom_participant_id": "x", "left_at": null},
                    {"id": "p2", "custom_participant_id": "y", "left_at": "2026-01-01T10:00:00Z"},
                    {"id": "p3"}
                ]
            }
        }"#;
        let envelope: Envelope<ParticipantsData> = serde_json::from_str(json).unwrap();
        let present: Vec<&str> = envelope
            .data
            .participants
            .iter()
            .filter(|p| p.is_present())
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(present, vec!["p1", "p3"]);
    }

    #[test]
    fn test_error_body_truncation_respects_utf8() {
        let body = format!("a{}", "é".repeat(300));
        let cut = truncate_body(body);
        assert!(cut.len() <= MAX_ERROR_BODY);
        assert_eq!(cut.len(), MAX_ERROR_BODY - 1);
        assert!(cut.ends_with('é'));

        assert_eq!(truncate_body("bad gateway".into()), "bad gateway");
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let api = HttpProviderApi::new(&ProviderConfig {
            base_url: "https://provider.example/v2/".into(),
            org_id: "org".into(),
            api_key: "key".into(),
            audio_preset: "a".into(),
            video_preset: "v".into(),
            timeout: std::time::Duration::from_secs(1),
        })
        .unwrap();
        assert_eq!(api.url("/meetings"), "https://provider.example/v2/meetings");
    }
}
