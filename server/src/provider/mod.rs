//! External Call Provider
//!
//! The media provider hosts the actual audio/video sessions. This module owns
//! everything we ask of it:
//! - one provider meeting per voice channel (created lazily, cached)
//! - participant tokens bound to a reversible `user_id[:session_id]` identity
//! - eviction of stale provider participants (session replace, kicks)
//! - listing live participants for reconciliation

mod api;
mod error;
pub(crate) mod gateway;
mod http;
pub mod identity;

pub use api::{
    AddParticipantRequest, CreatedParticipant, ProviderApi, SessionParticipant,
};
pub use error::GatewayError;
pub use gateway::{CallGateway, MintedToken, Presets};
pub use http::HttpProviderApi;
pub use identity::ParticipantIdentity;
