//! Call provider gateway: meeting cache, token minting, eviction.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::api::{AddParticipantRequest, ProviderApi};
use super::identity::ParticipantIdentity;
use super::GatewayError;
use crate::config::ProviderConfig;
use crate::locks::KeyedLocks;

/// Provider presets (roles) handed out to participants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Presets {
    /// Audio only.
    pub audio: String,
    /// Audio and video.
    pub video: String,
}

impl From<&ProviderConfig> for Presets {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            audio: config.audio_preset.clone(),
            video: config.video_preset.clone(),
        }
    }
}

/// A freshly minted participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintedToken {
    /// Provider-internal participant id.
    pub participant_id: String,
    /// Token for the client SDK.
    pub auth_token: String,
}

/// A participant currently connected to a provider session.
#[derive(Debug, Clone)]
struct LiveParticipant {
    participant_id: String,
    identity: ParticipantIdentity,
}

/// Gateway to the external call provider.
///
/// Holds exactly one provider meeting per channel for as long as the cache
/// entry lives; creation is guarded by a per-channel lock.
pub struct CallGateway {
    api: Option<Arc<dyn ProviderApi>>,
    presets: Presets,
    meetings: DashMap<Uuid, String>,
    creation_locks: KeyedLocks<Uuid>,
}

impl CallGateway {
    /// Create a gateway. `api = None` means the provider is not configured
    /// and every operation fails with [`GatewayError::NotConfigured`].
    pub fn new(api: Option<Arc<dyn ProviderApi>>, presets: Presets) -> Self {
        Self {
            api,
            presets,
            meetings: DashMap::new(),
            creation_locks: KeyedLocks::new(),
        }
    }

    /// Whether a provider is configured.
    pub const fn is_configured(&self) -> bool {
        self.api.is_some()
    }

    fn api(&self) -> Result<&Arc<dyn ProviderApi>, GatewayError> {
        self.api.as_ref().ok_or(GatewayError::NotConfigured)
    }

    /// Cached meeting of a channel, if one was created.
    pub fn cached_meeting(&self, channel_id: Uuid) -> Option<String> {
        self.meetings.get(&channel_id).map(|m| m.value().clone())
    }

    /// Channels with a cached meeting.
    pub fn cached_channels(&self) -> Vec<Uuid> {
        self.meetings.iter().map(|m| *m.key()).collect()
    }

    /// Drop the cached meeting of a channel.
    pub fn forget_meeting(&self, channel_id: Uuid) {
        if let Some((_, meeting_id)) = self.meetings.remove(&channel_id) {
            info!(channel_id = %channel_id, meeting_id = %meeting_id, "Forgot idle provider meeting");
        }
    }

    /// Return the channel's meeting, creating it on first use.
    #[tracing::instrument(skip(self))]
    pub async fn get_or_create_meeting(&self, channel_id: Uuid) -> Result<String, GatewayError> {
        let api = self.api()?;

        if let Some(meeting_id) = self.cached_meeting(channel_id) {
            return Ok(meeting_id);
        }

        let _guard = self.creation_locks.lock(channel_id).await;

        // Another first-joiner may have created it while we waited.
        if let Some(meeting_id) = self.cached_meeting(channel_id) {
            return Ok(meeting_id);
        }

        let meeting_id = api.create_meeting(&format!("voice-{channel_id}")).await?;
        self.meetings.insert(channel_id, meeting_id.clone());
        info!(channel_id = %channel_id, meeting_id = %meeting_id, "Provider meeting created");
        Ok(meeting_id)
    }

    /// Evict the user's existing participants in the meeting, then mint a new
    /// participant token bound to `user_id[:session_id]`.
    #[tracing::instrument(skip(self, session_id, display_name))]
    pub async fn mint_participant_token(
        &self,
        meeting_id: &str,
        user_id: Uuid,
        session_id: Option<&str>,
        display_name: &str,
        allow_video: bool,
    ) -> Result<MintedToken, GatewayError> {
        let api = self.api()?;

        match self.evict_in_meeting(meeting_id, user_id, None).await {
            Ok(0) => {}
            Ok(kicked) => debug!(kicked, "Evicted previous provider sessions before mint"),
            Err(e) => warn!(error = %e, "Eviction before mint failed, minting anyway"),
        }

        let identity = ParticipantIdentity::new(user_id, session_id);
        let request = AddParticipantRequest {
            name: display_name.to_string(),
            preset_name: if allow_video {
                self.presets.video.clone()
            } else {
                self.presets.audio.clone()
            },
            custom_participant_id: identity.encode(),
        };

        let created = api.add_participant(meeting_id, &request).await?;
        Ok(MintedToken {
            participant_id: created.id,
            auth_token: created.token,
        })
    }

    /// Kick the user's provider participants in the channel's meeting,
    /// optionally only the one bound to `session_id`.
    ///
    /// Best-effort: failures are logged and reported as zero kicks.
    #[tracing::instrument(skip(self, session_id))]
    pub async fn evict_user(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
        session_id: Option<&str>,
    ) -> usize {
        if self.api.is_none() {
            return 0;
        }
        let Some(meeting_id) = self.cached_meeting(channel_id) else {
            return 0;
        };

        match self.evict_in_meeting(&meeting_id, user_id, session_id).await {
            Ok(kicked) => kicked,
            Err(e) => {
                warn!(error = %e, "Failed to evict provider participants");
                0
            }
        }
    }

    async fn evict_in_meeting(
        &self,
        meeting_id: &str,
        user_id: Uuid,
        session_id: Option<&str>,
    ) -> Result<usize, GatewayError> {
        let api = self.api()?;

        let targets: Vec<String> = self
            .live_participants(meeting_id)
            .await?
            .into_iter()
            .filter(|p| p.identity.user_id == user_id)
            .filter(|p| session_id.is_none_or(|s| p.identity.is_session(s)))
            .map(|p| p.participant_id)
            .collect();

        if targets.is_empty() {
            return Ok(0);
        }

        api.kick_participants(meeting_id, &targets).await?;
        info!(user_id = %user_id, kicked = targets.len(), "Kicked provider participants");
        Ok(targets.len())
    }

    /// Participants connected to any live session of the meeting that carry
    /// one of our identities.
    async fn live_participants(
        &self,
        meeting_id: &str,
    ) -> Result<Vec<LiveParticipant>, GatewayError> {
        let api = self.api()?;
        let mut live = Vec::new();

        for session_id in api.live_sessions(meeting_id).await? {
            for participant in api.session_participants(&session_id).await? {
                if !participant.is_present() {
                    continue;
                }
                let Some(identity) = participant
                    .custom_participant_id
                    .as_deref()
                    .and_then(ParticipantIdentity::parse)
                else {
                    continue;
                };
                live.push(LiveParticipant {
                    participant_id: participant.id,
                    identity,
                });
            }
        }

        Ok(live)
    }

    /// Users the provider reports as connected in the channel's meeting.
    ///
    /// `Ok(None)` when the channel has no cached meeting.
    pub async fn live_user_ids(
        &self,
        channel_id: Uuid,
    ) -> Result<Option<HashSet<Uuid>>, GatewayError> {
        let Some(meeting_id) = self.cached_meeting(channel_id) else {
            return Ok(None);
        };
        let users = self
            .live_participants(&meeting_id)
            .await?
            .into_iter()
            .map(|p| p.identity.user_id)
            .collect();
        Ok(Some(users))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::provider::{CreatedParticipant, SessionParticipant};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-memory provider: one live session per meeting.
    #[derive(Default)]
    pub(crate) struct FakeProvider {
        pub(crate) meetings_created: AtomicUsize,
        pub(crate) participants: Mutex<Vec<(String, SessionParticipant)>>,
        pub(crate) kicked: Mutex<Vec<String>>,
        pub(crate) fail_listing: std::sync::atomic::AtomicBool,
        pub(crate) create_delay: Option<Duration>,
        pub(crate) add_delay: Option<Duration>,
        pub(crate) next_id: AtomicUsize,
    }

    impl FakeProvider {
        /// Pretend a participant is connected without going through a mint.
        pub(crate) fn connect(&self, meeting_id: &str, identity: &str) {
            let id = format!("ext-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.participants.lock().unwrap().push((
                meeting_id.to_string(),
                SessionParticipant {
                    id,
                    custom_participant_id: Some(identity.to_string()),
                    left_at: None,
                },
            ));
        }

        pub(crate) fn connected_identities(&self, meeting_id: &str) -> Vec<String> {
            self.participants
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, p)| m == meeting_id && p.is_present())
                .filter_map(|(_, p)| p.custom_participant_id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ProviderApi for FakeProvider {
        async fn create_meeting(&self, _title: &str) -> Result<String, GatewayError> {
            if let Some(delay) = self.create_delay {
                tokio::time::sleep(delay).await;
            }
            let n = self.meetings_created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("meeting-{n}"))
        }

        async fn add_participant(
            &self,
            meeting_id: &str,
            request: &AddParticipantRequest,
        ) -> Result<CreatedParticipant, GatewayError> {
            if let Some(delay) = self.add_delay {
                tokio::time::sleep(delay).await;
            }
            let id = format!("ext-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            // Minted participants count as connected straight away.
            self.participants.lock().unwrap().push((
                meeting_id.to_string(),
                SessionParticipant {
                    id: id.clone(),
                    custom_participant_id: Some(request.custom_participant_id.clone()),
                    left_at: None,
                },
            ));
            Ok(CreatedParticipant {
                token: format!("token-for-{id}"),
                id,
            })
        }

        async fn live_sessions(&self, meeting_id: &str) -> Result<Vec<String>, GatewayError> {
            if self.fail_listing.load(Ordering::SeqCst) {
                return Err(GatewayError::Timeout);
            }
            Ok(vec![format!("session-of-{meeting_id}")])
        }

        async fn session_participants(
            &self,
            session_id: &str,
        ) -> Result<Vec<SessionParticipant>, GatewayError> {
            let meeting_id = session_id.trim_start_matches("session-of-");
            Ok(self
                .participants
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| m == meeting_id)
                .map(|(_, p)| p.clone())
                .collect())
        }

        async fn kick_participants(
            &self,
            _meeting_id: &str,
            participant_ids: &[String],
        ) -> Result<(), GatewayError> {
            let mut participants = self.participants.lock().unwrap();
            for (_, p) in participants.iter_mut() {
                if participant_ids.contains(&p.id) {
                    p.left_at = Some(chrono::Utc::now());
                }
            }
            self.kicked.lock().unwrap().extend(participant_ids.iter().cloned());
            Ok(())
        }
    }

    pub(crate) fn presets() -> Presets {
        Presets {
            audio: "voice".into(),
            video: "video".into(),
        }
    }

    fn gateway(provider: &Arc<FakeProvider>) -> CallGateway {
        CallGateway::new(Some(provider.clone() as Arc<dyn ProviderApi>), presets())
    }

    #[tokio::test]
    async fn test_unconfigured_gateway_fails_fast() {
        let gateway = CallGateway::new(None, presets());
        assert!(matches!(
            gateway.get_or_create_meeting(Uuid::new_v4()).await,
            Err(GatewayError::NotConfigured)
        ));
        assert_eq!(gateway.evict_user(Uuid::new_v4(), Uuid::new_v4(), None).await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_first_joiners_create_one_meeting() {
        let provider = Arc::new(FakeProvider {
            create_delay: Some(Duration::from_millis(20)),
            ..FakeProvider::default()
        });
        let gateway = Arc::new(gateway(&provider));
        let channel_id = Uuid::new_v4();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gateway = gateway.clone();
                tokio::spawn(async move { gateway.get_or_create_meeting(channel_id).await })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().unwrap());
        }

        assert_eq!(ids.len(), 1);
        assert_eq!(provider.meetings_created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mint_evicts_previous_sessions_of_same_user() {
        let provider = Arc::new(FakeProvider::default());
        let gateway = gateway(&provider);
        let channel_id = Uuid::new_v4();
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();

        let meeting = gateway.get_or_create_meeting(channel_id).await.unwrap();
        let first = gateway
            .mint_participant_token(&meeting, user, Some("tab-1"), "Alice", false)
            .await
            .unwrap();
        gateway
            .mint_participant_token(&meeting, other, None, "Bob", false)
            .await
            .unwrap();
        gateway
            .mint_participant_token(&meeting, user, Some("tab-2"), "Alice", true)
            .await
            .unwrap();

        assert_eq!(*provider.kicked.lock().unwrap(), vec![first.participant_id]);
        let mut live = provider.connected_identities(&meeting);
        live.sort();
        let mut expected = vec![other.to_string(), format!("{user}:tab-2")];
        expected.sort();
        assert_eq!(live, expected);
    }

    #[tokio::test]
    async fn test_evict_by_session_only_hits_that_session() {
        let provider = Arc::new(FakeProvider::default());
        let gateway = gateway(&provider);
        let channel_id = Uuid::new_v4();
        let user = Uuid::new_v4();

        let meeting = gateway.get_or_create_meeting(channel_id).await.unwrap();
        provider.connect(&meeting, &format!("{user}:a"));
        provider.connect(&meeting, &format!("{user}:b"));

        assert_eq!(gateway.evict_user(channel_id, user, Some("a")).await, 1);
        assert_eq!(provider.connected_identities(&meeting), vec![format!("{user}:b")]);
    }

    #[tokio::test]
    async fn test_live_user_ids_skip_departed_and_foreign() {
        let provider = Arc::new(FakeProvider::default());
        let gateway = gateway(&provider);
        let channel_id = Uuid::new_v4();
        let user = Uuid::new_v4();

        assert!(gateway.live_user_ids(channel_id).await.unwrap().is_none());

        let meeting = gateway.get_or_create_meeting(channel_id).await.unwrap();
        provider.connect(&meeting, &user.to_string());
        provider.connect(&meeting, "recording-bot");
        let gone = Uuid::new_v4();
        provider.connect(&meeting, &gone.to_string());
        gateway.evict_user(channel_id, gone, None).await;

        let users = gateway.live_user_ids(channel_id).await.unwrap().unwrap();
        assert_eq!(users, HashSet::from([user]));
    }

    #[tokio::test]
    async fn test_eviction_failure_is_absorbed() {
        let provider = Arc::new(FakeProvider::default());
        let gateway = gateway(&provider);
        let channel_id = Uuid::new_v4();
        let meeting = gateway.get_or_create_meeting(channel_id).await.unwrap();

        provider.fail_listing.store(true, Ordering::SeqCst);
        assert_eq!(gateway.evict_user(channel_id, Uuid::new_v4(), None).await, 0);
        // Minting still succeeds when the pre-mint eviction cannot list sessions.
        assert!(gateway
            .mint_participant_token(&meeting, Uuid::new_v4(), None, "Eve", false)
            .await
            .is_ok());
    }
}
