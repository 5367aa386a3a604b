//! Provider REST contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::GatewayError;

/// Body of an add-participant request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddParticipantRequest {
    /// Name shown to other participants.
    pub name: String,
    /// Provider preset (role) deciding audio-only vs. audio+video.
    pub preset_name: String,
    /// Our composite identity, see [`super::ParticipantIdentity`].
    pub custom_participant_id: String,
}

/// Participant created by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreatedParticipant {
    /// Provider-internal participant id.
    pub id: String,
    /// Auth token for the client SDK.
    pub token: String,
}

/// Participant of a live provider session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionParticipant {
    /// Provider-internal participant id.
    pub id: String,
    /// Identity we attached when minting the token.
    #[serde(default)]
    pub custom_participant_id: Option<String>,
    /// Set once the participant left the session.
    #[serde(default)]
    pub left_at: Option<DateTime<Utc>>,
}

impl SessionParticipant {
    /// Whether the participant is still connected.
    pub const fn is_present(&self) -> bool {
        self.left_at.is_none()
    }
}

/// Operations the external call provider exposes.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// Create a meeting; returns its id.
    async fn create_meeting(&self, title: &str) -> Result<String, GatewayError>;

    /// Add a participant to a meeting and mint its token.
    async fn add_participant(
        &self,
        meeting_id: &str,
        request: &AddParticipantRequest,
    ) -> Result<CreatedParticipant, GatewayError>;

    /// Ids of the live sessions of a meeting.
    async fn live_sessions(&self, meeting_id: &str) -> Result<Vec<String>, GatewayError>;

    /// Participants of a session, including departed ones.
    async fn session_participants(
        &self,
        session_id: &str,
    ) -> Result<Vec<SessionParticipant>, GatewayError>;

    /// Remove participants from the meeting's active session.
    async fn kick_participants(
        &self,
        meeting_id: &str,
        participant_ids: &[String],
    ) -> Result<(), GatewayError>;
}
