//! Voice Presence Service
//!
//! Who is in which call, and keeping that true:
//! - [`VoicePresence`] handles join, leave, heartbeat and moderation
//! - [`Sweeper`] periodically corrects drift against TTLs and the provider
//! - HTTP endpoints under `/voice`

mod coordinator;
pub mod error;
pub mod handlers;
mod rate_limit;
mod sweeper;

use axum::routing::{get, post};
use axum::Router;

pub use coordinator::{PresenceSettings, VoicePresence};
pub use error::VoiceError;
pub use sweeper::{SweepReport, Sweeper, SweeperSettings};

use crate::api::AppState;

/// Create voice router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/token/{channel_id}", post(handlers::request_token))
        .route("/heartbeat", post(handlers::heartbeat))
        .route("/channels/{channel_id}/leave", post(handlers::leave_channel))
        .route(
            "/channels/{channel_id}/participants",
            get(handlers::participants),
        )
        .route(
            "/channels/{channel_id}/participants/{target_user_id}/{action}",
            post(handlers::moderate),
        )
}
