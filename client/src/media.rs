//! Media Room Abstraction
//!
//! The call provider's SDK sits behind these traits so the session state
//! machine never depends on a concrete media stack.

use std::sync::Arc;

use async_trait::async_trait;

/// What a session needs to enter a provider meeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomOptions {
    pub meeting_id: String,
    pub participant_id: String,
    pub auth_token: String,
}

/// Locally published track kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalTrack {
    Microphone,
    Camera,
    ScreenShare,
}

/// A joined provider meeting.
#[async_trait]
pub trait MediaRoom: Send + Sync {
    /// Start sending a local track.
    async fn publish(&self, track: LocalTrack) -> anyhow::Result<()>;
    /// Stop sending a local track.
    async fn unpublish(&self, track: LocalTrack) -> anyhow::Result<()>;
    /// Fails if the connection to the provider is gone.
    async fn probe(&self) -> anyhow::Result<()>;
    /// Leave the meeting and release local devices.
    async fn leave(&self) -> anyhow::Result<()>;
}

/// Entry point of the provider SDK.
#[async_trait]
pub trait MediaConnector: Send + Sync {
    /// Ask the OS/user for microphone (and camera) access.
    async fn check_permissions(&self, video: bool) -> anyhow::Result<()>;
    /// Join a meeting.
    async fn connect(&self, options: RoomOptions) -> anyhow::Result<Arc<dyn MediaRoom>>;
}
