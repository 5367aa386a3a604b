//! Real-time Protocol
//!
//! Notification events pushed from the presence server to clients, and the
//! small WebSocket envelope around them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::ModerationAction;
use crate::Result;

/// Presence and moderation notification, always scoped to one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceEvent {
    /// A newer join by `user_id` superseded an older session.
    ///
    /// A client belonging to `user_id` whose own session differs from
    /// `active_session_id` must tear down immediately.
    SessionReplaced {
        channel_id: Uuid,
        user_id: Uuid,
        /// Superseded session, when it was known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Session that is live now.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        active_session_id: Option<String>,
    },
    /// A moderator acted on a participant.
    ModerationAction {
        channel_id: Uuid,
        moderator_user_id: Uuid,
        target_user_id: Uuid,
        action: ModerationAction,
    },
    /// Authoritative membership snapshot for a channel.
    ChannelParticipants {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        planet_id: Option<Uuid>,
        channel_id: Uuid,
        user_ids: Vec<Uuid>,
    },
}

impl VoiceEvent {
    /// Channel the event is scoped to.
    #[must_use]
    pub const fn channel_id(&self) -> Uuid {
        match self {
            Self::SessionReplaced { channel_id, .. }
            | Self::ModerationAction { channel_id, .. }
            | Self::ChannelParticipants { channel_id, .. } => *channel_id,
        }
    }

    /// Encode as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Client-to-server WebSocket messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keepalive.
    Ping,
    /// Start receiving events for a channel.
    Subscribe { channel_id: Uuid },
    /// Stop receiving events for a channel.
    Unsubscribe { channel_id: Uuid },
}

/// Server-to-client WebSocket messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection authenticated.
    Ready { user_id: Uuid },
    /// Keepalive response.
    Pong,
    /// Subscription confirmed.
    Subscribed { channel_id: Uuid },
    /// Unsubscription confirmed.
    Unsubscribed { channel_id: Uuid },
    /// Voice notification for a subscribed channel.
    Event { event: VoiceEvent },
    /// Request could not be handled.
    Error { code: String, message: String },
}
