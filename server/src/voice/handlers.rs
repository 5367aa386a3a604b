//! Voice HTTP Handlers
//!
//! REST surface of the presence coordinator. All routes require a bearer
//! token; the caller is always the authenticated user.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vc_common::{HeartbeatResponse, ModerationAction, ParticipantsResponse, TokenResponse};

use super::error::VoiceError;
use crate::api::AppState;
use crate::auth::AuthUser;
use crate::presence::LeaveOutcome;

/// Optional client session of a join or leave.
#[derive(Debug, Default, Deserialize, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SessionQuery {
    /// Opaque per-process token chosen by the client.
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
}

/// Result of a leave request.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct LeaveResponse {
    /// Whether a presence entry was removed. `false` for repeated leaves and
    /// leaves from superseded sessions.
    pub left: bool,
}

/// Request a participant token for a voice channel.
///
/// POST /voice/token/{channel_id}
///
/// Supersedes any other live session of the caller, in this or any other
/// channel.
#[utoipa::path(
    post,
    path = "/voice/token/{channel_id}",
    tag = "voice",
    params(
        ("channel_id" = Uuid, Path, description = "Voice channel"),
        SessionQuery,
    ),
    responses(
        (status = 200, description = "Provider token for the channel's meeting"),
        (status = 403, description = "Not allowed to join"),
        (status = 429, description = "Joining too fast"),
        (status = 503, description = "Voice not configured"),
    ),
    security(("bearer_auth" = [])),
)]
pub async fn request_token(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(channel_id): Path<Uuid>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<TokenResponse>, VoiceError> {
    let token = state
        .voice
        .request_join(auth.id, channel_id, query.session_id)
        .await?;
    Ok(Json(token))
}

/// Leave a voice channel.
///
/// POST /voice/channels/{channel_id}/leave
#[utoipa::path(
    post,
    path = "/voice/channels/{channel_id}/leave",
    tag = "voice",
    params(
        ("channel_id" = Uuid, Path, description = "Voice channel"),
        SessionQuery,
    ),
    responses(
        (status = 200, description = "Leave processed", body = LeaveResponse),
    ),
    security(("bearer_auth" = [])),
)]
pub async fn leave_channel(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(channel_id): Path<Uuid>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<LeaveResponse>, VoiceError> {
    let outcome = state
        .voice
        .leave(auth.id, channel_id, query.session_id)
        .await?;
    Ok(Json(LeaveResponse {
        left: outcome == LeaveOutcome::Removed,
    }))
}

/// Refresh the caller's presence.
///
/// POST /voice/heartbeat
#[utoipa::path(
    post,
    path = "/voice/heartbeat",
    tag = "voice",
    responses(
        (status = 200, description = "Whether the caller is still present"),
    ),
    security(("bearer_auth" = [])),
)]
pub async fn heartbeat(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<HeartbeatResponse>, VoiceError> {
    let active = state.voice.heartbeat(auth.id).await?;
    Ok(Json(HeartbeatResponse { active }))
}

/// Mute, unmute or kick a participant.
///
/// POST /voice/channels/{channel_id}/participants/{target_user_id}/{action}
#[utoipa::path(
    post,
    path = "/voice/channels/{channel_id}/participants/{target_user_id}/{action}",
    tag = "voice",
    params(
        ("channel_id" = Uuid, Path, description = "Voice channel"),
        ("target_user_id" = Uuid, Path, description = "Participant to act on"),
        ("action" = String, Path, description = "mute, unmute or kick"),
    ),
    responses(
        (status = 200, description = "Action applied"),
        (status = 400, description = "Unknown action or target not in channel"),
        (status = 403, description = "Not allowed to moderate the target"),
    ),
    security(("bearer_auth" = [])),
)]
pub async fn moderate(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((channel_id, target_user_id, action)): Path<(Uuid, Uuid, String)>,
) -> Result<Json<serde_json::Value>, VoiceError> {
    let action: ModerationAction = action.parse()?;
    state
        .voice
        .moderate(auth.id, channel_id, target_user_id, action)
        .await?;
    Ok(Json(serde_json::json!({ "action": action })))
}

/// Current participants of a voice channel.
///
/// GET /voice/channels/{channel_id}/participants
#[utoipa::path(
    get,
    path = "/voice/channels/{channel_id}/participants",
    tag = "voice",
    params(("channel_id" = Uuid, Path, description = "Voice channel")),
    responses(
        (status = 200, description = "Membership snapshot"),
        (status = 403, description = "Not allowed to view the channel"),
    ),
    security(("bearer_auth" = [])),
)]
pub async fn participants(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(channel_id): Path<Uuid>,
) -> Result<Json<ParticipantsResponse>, VoiceError> {
    Ok(Json(state.voice.participants(auth.id, channel_id).await?))
}
