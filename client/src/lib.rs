//! Kaiku Voice Client
//!
//! Call session orchestration for the voice presence server: token
//! acquisition, provider room lifecycle, heartbeats, moderation and
//! session-replacement handling, plus the notification WebSocket that
//! feeds server events into a session.
//!
//! ```ignore
//! let api = Arc::new(HttpVoiceApi::new(server_url, access_token)?);
//! let session = Arc::new(CallSession::new(user_id, api, media, ClientSettings::default()));
//! let socket = NotificationSocket::connect(server_url, access_token)?;
//! spawn_event_pump(session.clone(), socket.events(), cancel.clone());
//!
//! socket.subscribe_channel(channel_id).await?;
//! session.join(channel_id, false).await?;
//! ```

pub mod api;
pub mod error;
pub mod media;
pub mod network;
pub mod session;
pub mod settings;

pub use api::{HttpVoiceApi, VoiceApi};
pub use error::{ApiError, JoinError, TrackError};
pub use media::{LocalTrack, MediaConnector, MediaRoom, RoomOptions};
pub use network::{Backoff, ConnectionStatus, NotificationSocket, SocketError};
pub use session::{
    instance_session_id, spawn_event_pump, CallNotice, CallSession, CallState, EndReason,
    MediaFlags,
};
pub use settings::ClientSettings;
