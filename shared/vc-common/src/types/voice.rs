//! Voice Call Types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// Moderation directive issued against a participant of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationAction {
    /// Disable the target's microphone.
    Mute,
    /// Allow the target to speak again.
    Unmute,
    /// Remove the target from the call.
    Kick,
}

impl ModerationAction {
    /// Path segment / wire name of the action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mute => "mute",
            Self::Unmute => "unmute",
            Self::Kick => "kick",
        }
    }
}

impl fmt::Display for ModerationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModerationAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mute" => Ok(Self::Mute),
            "unmute" => Ok(Self::Unmute),
            "kick" => Ok(Self::Kick),
            other => Err(Error::UnknownAction(other.to_string())),
        }
    }
}

/// Credentials a client needs to join the provider-side meeting of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Channel the token was minted for.
    pub channel_id: Uuid,
    /// Provider meeting backing the channel.
    pub meeting_id: String,
    /// Provider-internal participant id.
    pub participant_id: String,
    /// Auth token handed to the provider SDK.
    pub auth_token: String,
    /// Session id the presence entry was recorded with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// How often the client is expected to send heartbeats.
    pub heartbeat_interval_secs: u64,
}

/// Response of the heartbeat endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Whether the caller still had a live presence entry to refresh.
    pub active: bool,
}

/// Snapshot of the users present in a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantsResponse {
    /// Planet (community) owning the channel, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planet_id: Option<Uuid>,
    /// Channel ID.
    pub channel_id: Uuid,
    /// Users present in the channel, sorted.
    pub user_ids: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moderation_action_parses_path_segments() {
        assert_eq!("mute".parse::<ModerationAction>().unwrap(), ModerationAction::Mute);
        assert_eq!("kick".parse::<ModerationAction>().unwrap(), ModerationAction::Kick);
        assert!("ban".parse::<ModerationAction>().is_err());
    }

    #[test]
    fn token_response_omits_missing_session() {
        let response = TokenResponse {
            channel_id: Uuid::nil(),
            meeting_id: "m".into(),
            participant_id: "p".into(),
            auth_token: "t".into(),
            session_id: None,
            heartbeat_interval_secs: 45,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("session_id"));
        assert!(json.contains("\"heartbeat_interval_secs\":45"));
    }
}
