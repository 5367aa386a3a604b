//! Presence Coordinator
//!
//! Entry point for join, leave, heartbeat and moderation. Joins of the same
//! user are serialized; everything else runs concurrently.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vc_common::{ModerationAction, ParticipantsResponse, TokenResponse, VoiceEvent};

use super::error::VoiceError;
use super::rate_limit::VoiceRateLimiter;
use crate::access::{can_moderate, AccessControl};
use crate::config::Config;
use crate::locks::KeyedLocks;
use crate::notify::NotificationHub;
use crate::presence::{LeaveOutcome, PresenceStore};
use crate::provider::CallGateway;

/// Longest session id accepted from a client.
const MAX_SESSION_LEN: usize = 128;

/// Timing knobs of the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct PresenceSettings {
    /// Lifetime of a presence entry without heartbeat.
    pub ttl: Duration,
    /// Heartbeat interval advertised to clients.
    pub heartbeat_interval: Duration,
    /// Minimum time between two joins of one user.
    pub join_min_interval: Duration,
}

impl From<&Config> for PresenceSettings {
    fn from(config: &Config) -> Self {
        Self {
            ttl: config.presence_ttl(),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            join_min_interval: Duration::from_millis(config.join_min_interval_ms),
        }
    }
}

/// Coordinates the presence registry, the call provider and notifications.
pub struct VoicePresence {
    store: Arc<dyn PresenceStore>,
    gateway: Arc<CallGateway>,
    access: Arc<dyn AccessControl>,
    hub: Arc<NotificationHub>,
    join_locks: KeyedLocks<Uuid>,
    /// Shared while a join is in flight; exclusive while an idle meeting is dropped.
    channel_joins: KeyedLocks<Uuid>,
    rate_limiter: VoiceRateLimiter,
    /// Planet of each channel with a recorded join, until the channel goes idle.
    planets: DashMap<Uuid, Option<Uuid>>,
    settings: PresenceSettings,
}

impl VoicePresence {
    /// Wire up a coordinator.
    pub fn new(
        store: Arc<dyn PresenceStore>,
        gateway: Arc<CallGateway>,
        access: Arc<dyn AccessControl>,
        hub: Arc<NotificationHub>,
        settings: PresenceSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            access,
            hub,
            join_locks: KeyedLocks::new(),
            channel_joins: KeyedLocks::new(),
            rate_limiter: VoiceRateLimiter::new(settings.join_min_interval),
            planets: DashMap::new(),
            settings,
        }
    }

    /// Presence registry.
    pub fn store(&self) -> &Arc<dyn PresenceStore> {
        &self.store
    }

    /// Provider gateway.
    pub fn gateway(&self) -> &Arc<CallGateway> {
        &self.gateway
    }

    /// Notification hub.
    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    /// Coordinator settings.
    pub const fn settings(&self) -> &PresenceSettings {
        &self.settings
    }

    /// Join `channel_id` and return the provider token for it.
    ///
    /// Any earlier session of the user (same or another channel) is evicted
    /// from the provider and told to tear down via `SessionReplaced`.
    /// Nothing is written to the registry unless a token was minted.
    #[tracing::instrument(skip(self, session_id))]
    pub async fn request_join(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
        session_id: Option<String>,
    ) -> Result<TokenResponse, VoiceError> {
        if !self.gateway.is_configured() {
            return Err(VoiceError::NotConfigured);
        }
        let session_id = normalize_session(session_id)?;
        self.rate_limiter.check_join(user_id)?;

        let _guard = self.join_locks.lock(user_id).await;

        let grant = self.access.check_join(user_id, channel_id).await?;

        // Keeps the meeting cached until this join is recorded.
        let _in_flight = self.channel_joins.read(channel_id).await;
        let meeting_id = self.gateway.get_or_create_meeting(channel_id).await?;

        // Evicts every live provider session of this user in the meeting first.
        let minted = self
            .gateway
            .mint_participant_token(
                &meeting_id,
                user_id,
                session_id.as_deref(),
                &grant.display_name,
                grant.allow_video,
            )
            .await?;

        let outcome = match self
            .store
            .join_channel(user_id, channel_id, session_id.as_deref(), self.settings.ttl)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // The token is never handed out, so its participant never connects.
                warn!(error = %e, "Presence write failed after token mint");
                return Err(e.into());
            }
        };

        self.planets.insert(channel_id, grant.planet_id);

        if let Some(old_channel) = outcome.previous_channel {
            info!(user_id = %user_id, from = %old_channel, to = %channel_id, "User moved between voice channels");

            let gateway = self.gateway.clone();
            tokio::spawn(async move {
                gateway.evict_user(old_channel, user_id, None).await;
            });

            self.hub
                .publish(VoiceEvent::SessionReplaced {
                    channel_id: old_channel,
                    user_id,
                    session_id: outcome.previous_session.clone(),
                    active_session_id: session_id.clone(),
                })
                .await;
            self.broadcast_participants(old_channel).await;
        }

        self.hub
            .publish(VoiceEvent::SessionReplaced {
                channel_id,
                user_id,
                session_id: outcome.previous_session,
                active_session_id: session_id.clone(),
            })
            .await;
        self.broadcast_participants(channel_id).await;

        info!(user_id = %user_id, channel_id = %channel_id, "User joined voice channel");

        Ok(TokenResponse {
            channel_id,
            meeting_id,
            participant_id: minted.participant_id,
            auth_token: minted.auth_token,
            session_id,
            heartbeat_interval_secs: self.settings.heartbeat_interval.as_secs(),
        })
    }

    /// Leave `channel_id`. Leaving twice, or leaving with a superseded
    /// session, is a no-op.
    #[tracing::instrument(skip(self, session_id))]
    pub async fn leave(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
        session_id: Option<String>,
    ) -> Result<LeaveOutcome, VoiceError> {
        let session_id = normalize_session(session_id)?;
        let outcome = self
            .store
            .leave_channel(user_id, channel_id, session_id.as_deref())
            .await?;

        match outcome {
            LeaveOutcome::Removed => {
                info!(user_id = %user_id, channel_id = %channel_id, "User left voice channel");
                let gateway = self.gateway.clone();
                tokio::spawn(async move {
                    gateway
                        .evict_user(channel_id, user_id, session_id.as_deref())
                        .await;
                });
                self.broadcast_participants(channel_id).await;
            }
            LeaveOutcome::StaleSession => {
                debug!(user_id = %user_id, channel_id = %channel_id, "Ignoring leave from superseded session");
            }
            LeaveOutcome::NotPresent => {}
        }

        Ok(outcome)
    }

    /// Refresh the caller's presence TTL. Returns whether an entry was alive.
    pub async fn heartbeat(&self, user_id: Uuid) -> Result<bool, VoiceError> {
        Ok(self.store.heartbeat(user_id, self.settings.ttl).await?)
    }

    /// Apply a moderation action from `actor_id` to `target_id`.
    #[tracing::instrument(skip(self))]
    pub async fn moderate(
        &self,
        actor_id: Uuid,
        channel_id: Uuid,
        target_id: Uuid,
        action: ModerationAction,
    ) -> Result<(), VoiceError> {
        let present = self
            .store
            .entry(target_id)
            .await?
            .is_some_and(|e| e.channel_id == channel_id);
        if !present {
            return Err(VoiceError::NotInChannel);
        }

        let authority = self
            .access
            .check_moderation(actor_id, target_id, channel_id, action)
            .await?;
        if !can_moderate(authority) {
            return Err(VoiceError::InsufficientAuthority);
        }

        info!(actor_id = %actor_id, target_id = %target_id, channel_id = %channel_id, %action, "Voice moderation action");

        self.hub
            .publish(VoiceEvent::ModerationAction {
                channel_id,
                moderator_user_id: actor_id,
                target_user_id: target_id,
                action,
            })
            .await;

        if action == ModerationAction::Kick {
            self.store.leave_channel(target_id, channel_id, None).await?;
            self.gateway.evict_user(channel_id, target_id, None).await;
            self.broadcast_participants(channel_id).await;
        }

        Ok(())
    }

    /// Current participants of a channel the caller may join.
    pub async fn participants(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
    ) -> Result<ParticipantsResponse, VoiceError> {
        let grant = self.access.check_join(user_id, channel_id).await?;

        let mut user_ids: Vec<Uuid> = self.store.list_members(channel_id).await?.into_iter().collect();
        user_ids.sort_unstable();

        Ok(ParticipantsResponse {
            planet_id: grant.planet_id,
            channel_id,
            user_ids,
        })
    }

    /// Publish the channel's membership snapshot. Best-effort.
    pub async fn broadcast_participants(&self, channel_id: Uuid) {
        let members = match self.store.list_members(channel_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!(channel_id = %channel_id, error = %e, "Skipping participants broadcast");
                return;
            }
        };

        let mut user_ids: Vec<Uuid> = members.into_iter().collect();
        user_ids.sort_unstable();

        self.hub
            .publish(VoiceEvent::ChannelParticipants {
                planet_id: self.planets.get(&channel_id).and_then(|p| *p),
                channel_id,
                user_ids,
            })
            .await;
    }

    /// Forget the provider meeting and cached planet of a channel nobody is in.
    ///
    /// Skipped while a join for the channel is in flight, since that join
    /// already holds the cached meeting id.
    pub async fn forget_idle_channel(&self, channel_id: Uuid) -> bool {
        let Some(_exclusive) = self.channel_joins.try_lock(channel_id) else {
            debug!(channel_id = %channel_id, "Join in flight, keeping meeting");
            return false;
        };
        match self.store.list_members(channel_id).await {
            Ok(members) if members.is_empty() => {}
            Ok(_) => return false,
            Err(e) => {
                warn!(channel_id = %channel_id, error = %e, "Keeping meeting, registry unavailable");
                return false;
            }
        }
        self.gateway.forget_meeting(channel_id);
        self.planets.remove(&channel_id);
        true
    }

    #[cfg(test)]
    pub(crate) fn known_planets(&self) -> usize {
        self.planets.len()
    }

    /// Drop bookkeeping that only serves rate limiting.
    pub fn cleanup_rate_limits(&self) {
        self.rate_limiter.cleanup();
    }
}

/// Trim the session; treat an empty one as none and reject absurd ones.
fn normalize_session(session_id: Option<String>) -> Result<Option<String>, VoiceError> {
    let Some(raw) = session_id else {
        return Ok(None);
    };
    match raw.trim() {
        "" => Ok(None),
        s if s.len() > MAX_SESSION_LEN => Err(VoiceError::InvalidSession),
        s => Ok(Some(s.to_string())),
    }
}
