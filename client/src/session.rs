//! Call Session
//!
//! Client-side state machine of one voice call:
//! `Idle -> Connecting -> Joined -> Leaving -> Idle`.
//!
//! Joins are serialized by a join mutex. Moderation and session replacement
//! events arrive out-of-band and tear the call down without taking it; a
//! join that is overtaken by such a teardown notices through the epoch
//! counter and backs out. Teardown never fails: each step is bounded and
//! its errors are logged.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vc_common::{ModerationAction, ParticipantsResponse, TokenResponse, VoiceEvent};

use crate::api::VoiceApi;
use crate::error::{ApiError, JoinError, TrackError};
use crate::media::{LocalTrack, MediaConnector, MediaRoom, RoomOptions};
use crate::settings::ClientSettings;

/// Shown after a moderator kicked us.
pub const KICKED_MESSAGE: &str = "You were removed from this call";
/// Shown after the same account joined from another instance.
pub const REPLACED_MESSAGE: &str =
    "Disconnected because this account joined from another instance";

static INSTANCE_SESSION_ID: OnceLock<String> = OnceLock::new();

/// Voice session id of this process. Stable for the process lifetime so
/// rejoins from the same instance never look like a second device.
pub fn instance_session_id() -> &'static str {
    INSTANCE_SESSION_ID.get_or_init(|| Uuid::new_v4().to_string())
}

/// Coarse call state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallState {
    #[default]
    Idle,
    Connecting { channel_id: Uuid },
    Joined { channel_id: Uuid },
    Leaving { channel_id: Uuid },
}

impl CallState {
    /// Channel of a call that is being set up or is live.
    pub const fn active_channel(self) -> Option<Uuid> {
        match self {
            Self::Connecting { channel_id } | Self::Joined { channel_id } => Some(channel_id),
            Self::Idle | Self::Leaving { .. } => None,
        }
    }
}

/// Local media sub-state of a joined call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaFlags {
    pub audio: bool,
    pub video: bool,
    pub screen_share: bool,
    /// Audio was switched off by a moderator rather than by the user.
    pub muted_by_moderator: bool,
}

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Left,
    Kicked,
    Replaced,
}

impl EndReason {
    /// Message to show the user, if any.
    pub const fn user_message(self) -> Option<&'static str> {
        match self {
            Self::Left => None,
            Self::Kicked => Some(KICKED_MESSAGE),
            Self::Replaced => Some(REPLACED_MESSAGE),
        }
    }
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    State(CallState),
    Media(MediaFlags),
    Participants(ParticipantsResponse),
    Ended { channel_id: Uuid, reason: EndReason },
    /// The server no longer had a presence entry to refresh.
    PresenceLost { channel_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Leave,
    Kicked,
    Replaced,
    /// Local leave before joining another channel.
    Switch,
    /// Local leave before rejoining the same channel.
    Recover,
}

impl Teardown {
    const fn notifies_server(self) -> bool {
        matches!(self, Self::Leave)
    }

    const fn clears_selection(self) -> bool {
        matches!(self, Self::Leave | Self::Kicked | Self::Replaced)
    }

    const fn end_reason(self) -> Option<EndReason> {
        match self {
            Self::Leave => Some(EndReason::Left),
            Self::Kicked => Some(EndReason::Kicked),
            Self::Replaced => Some(EndReason::Replaced),
            Self::Switch | Self::Recover => None,
        }
    }
}

struct ActiveCall {
    room: Arc<dyn MediaRoom>,
    cancel: CancellationToken,
    loops: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    state: CallState,
    flags: MediaFlags,
    active: Option<ActiveCall>,
    /// Channel the app treats as current; survives switches and rejoins.
    selected_channel: Option<Uuid>,
    video_requested: bool,
    /// Bumped by every join and every teardown.
    epoch: u64,
    /// Whether a join overtaken by a teardown must tell the server.
    abort_notifies_server: bool,
}

/// Orchestrates one user's voice call on this client.
pub struct CallSession {
    user_id: Uuid,
    session_id: String,
    api: Arc<dyn VoiceApi>,
    media: Arc<dyn MediaConnector>,
    settings: ClientSettings,
    join_lock: Mutex<()>,
    inner: Mutex<Inner>,
    notices: broadcast::Sender<CallNotice>,
}

impl CallSession {
    pub fn new(
        user_id: Uuid,
        api: Arc<dyn VoiceApi>,
        media: Arc<dyn MediaConnector>,
        settings: ClientSettings,
    ) -> Self {
        let (notices, _) = broadcast::channel(64);
        Self {
            user_id,
            session_id: instance_session_id().to_string(),
            api,
            media,
            settings,
            join_lock: Mutex::new(()),
            inner: Mutex::new(Inner::default()),
            notices,
        }
    }

    /// Use a specific voice session id instead of the process-wide one.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub const fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallNotice> {
        self.notices.subscribe()
    }

    pub async fn state(&self) -> CallState {
        self.inner.lock().await.state
    }

    pub async fn media_flags(&self) -> MediaFlags {
        self.inner.lock().await.flags
    }

    pub async fn selected_channel(&self) -> Option<Uuid> {
        self.inner.lock().await.selected_channel
    }

    fn notify(&self, notice: CallNotice) {
        // No receivers is fine.
        let _ = self.notices.send(notice);
    }

    fn set_state(&self, inner: &mut Inner, state: CallState) {
        inner.state = state;
        self.notify(CallNotice::State(state));
    }

    /// Join a voice channel, leaving the current one first if needed.
    #[instrument(skip(self), fields(user_id = %self.user_id))]
    pub async fn join(&self, channel_id: Uuid, video: bool) -> Result<(), JoinError> {
        let _guard = self.join_lock.lock().await;
        self.join_locked(channel_id, video).await
    }

    async fn join_locked(&self, channel_id: Uuid, video: bool) -> Result<(), JoinError> {
        let current = self.inner.lock().await.state;
        if current == (CallState::Joined { channel_id }) {
            debug!(channel_id = %channel_id, "Already in channel");
            return Ok(());
        }
        if let Some(previous) = current.active_channel() {
            info!(from = %previous, to = %channel_id, "Switching voice channel");
            self.teardown(Teardown::Switch).await;
        }

        let epoch = {
            let mut inner = self.inner.lock().await;
            inner.epoch += 1;
            inner.selected_channel = Some(channel_id);
            inner.video_requested = video;
            inner.abort_notifies_server = false;
            self.set_state(&mut inner, CallState::Connecting { channel_id });
            inner.epoch
        };

        let (token, room, video_on) = match self.connect(channel_id, video).await {
            Ok(connected) => connected,
            Err(e) => {
                warn!(channel_id = %channel_id, error = %e, "Voice join failed");
                let mut inner = self.inner.lock().await;
                if inner.epoch == epoch {
                    self.set_state(&mut inner, CallState::Idle);
                }
                return Err(e);
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            let notify_server = inner.abort_notifies_server;
            drop(inner);
            info!(channel_id = %channel_id, "Call ended while connecting, backing out");
            self.leave_room(room.as_ref()).await;
            if notify_server {
                self.notify_leave(channel_id).await;
            }
            return Err(JoinError::Aborted);
        }

        let cancel = CancellationToken::new();
        let loops = vec![
            self.spawn_heartbeat(
                channel_id,
                self.settings.heartbeat_for(token.heartbeat_interval_secs),
                cancel.clone(),
            ),
            self.spawn_participant_refresh(channel_id, cancel.clone()),
        ];
        inner.active = Some(ActiveCall {
            room,
            cancel,
            loops,
        });
        inner.flags = MediaFlags {
            audio: true,
            video: video_on,
            ..MediaFlags::default()
        };
        self.notify(CallNotice::Media(inner.flags));
        self.set_state(&mut inner, CallState::Joined { channel_id });
        info!(channel_id = %channel_id, meeting_id = %token.meeting_id, "Joined voice channel");
        Ok(())
    }

    /// Token, then room. Never leaves a presence entry behind on failure.
    async fn connect(
        &self,
        channel_id: Uuid,
        video: bool,
    ) -> Result<(TokenResponse, Arc<dyn MediaRoom>, bool), JoinError> {
        let token = match timeout(
            self.settings.token_timeout,
            self.api.request_token(channel_id, &self.session_id),
        )
        .await
        {
            Ok(Ok(token)) => token,
            Ok(Err(e)) => {
                // The server may have committed the join before the response was lost.
                if !e.is_rejection() {
                    self.notify_leave(channel_id).await;
                }
                return Err(e.into());
            }
            Err(_) => {
                self.notify_leave(channel_id).await;
                return Err(JoinError::Timeout("requesting a call token"));
            }
        };

        match self.enter_room(&token, video).await {
            Ok((room, video_on)) => Ok((token, room, video_on)),
            Err(e) => {
                self.notify_leave(channel_id).await;
                Err(e)
            }
        }
    }

    async fn enter_room(
        &self,
        token: &TokenResponse,
        video: bool,
    ) -> Result<(Arc<dyn MediaRoom>, bool), JoinError> {
        match timeout(
            self.settings.permission_timeout,
            self.media.check_permissions(video),
        )
        .await
        {
            Err(_) => return Err(JoinError::Timeout("checking media permissions")),
            Ok(Err(e)) => {
                warn!(error = %e, "Media permission denied");
                return Err(JoinError::MediaPermissionDenied);
            }
            Ok(Ok(())) => {}
        }

        let options = RoomOptions {
            meeting_id: token.meeting_id.clone(),
            participant_id: token.participant_id.clone(),
            auth_token: token.auth_token.clone(),
        };
        let room = timeout(self.settings.room_join_timeout, self.media.connect(options))
            .await
            .map_err(|_| JoinError::Timeout("joining the call"))?
            .map_err(|e| JoinError::Media(e.to_string()))?;

        if let Err(e) = self.toggle_track(room.as_ref(), LocalTrack::Microphone, true).await {
            self.leave_room(room.as_ref()).await;
            return Err(JoinError::Media(e.to_string()));
        }

        let video_on = if video {
            match self.toggle_track(room.as_ref(), LocalTrack::Camera, true).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Camera could not be published, continuing audio-only");
                    false
                }
            }
        } else {
            false
        };

        Ok((room, video_on))
    }

    /// Leave the current call. Always ends in `Idle`.
    pub async fn leave(&self) {
        self.teardown(Teardown::Leave).await;
    }

    /// Stop loops, leave the room, optionally tell the server, reset flags.
    async fn teardown(&self, kind: Teardown) {
        let (active, channel_id, epoch) = {
            let mut inner = self.inner.lock().await;
            let Some(channel_id) = inner.state.active_channel() else {
                return;
            };
            inner.epoch += 1;
            inner.abort_notifies_server = kind.notifies_server();
            if kind.clears_selection() {
                inner.selected_channel = None;
            }
            let active = inner.active.take();
            self.set_state(&mut inner, CallState::Leaving { channel_id });
            (active, channel_id, inner.epoch)
        };
        debug!(channel_id = %channel_id, kind = ?kind, "Tearing down call");

        if let Some(active) = active {
            self.stop_loops(active.cancel, active.loops).await;
            self.leave_room(active.room.as_ref()).await;
        }
        if kind.notifies_server() {
            self.notify_leave(channel_id).await;
        }

        let mut inner = self.inner.lock().await;
        if inner.epoch == epoch {
            inner.flags = MediaFlags::default();
            self.notify(CallNotice::Media(inner.flags));
            self.set_state(&mut inner, CallState::Idle);
        }
        if let Some(reason) = kind.end_reason() {
            self.notify(CallNotice::Ended { channel_id, reason });
        }
    }

    /// Cancel background loops, aborting any that outlive the grace period.
    async fn stop_loops(&self, cancel: CancellationToken, loops: Vec<JoinHandle<()>>) {
        cancel.cancel();
        for mut handle in loops {
            if timeout(self.settings.loop_grace, &mut handle).await.is_err() {
                warn!("Background loop did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    async fn leave_room(&self, room: &dyn MediaRoom) {
        match timeout(self.settings.leave_timeout, room.leave()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Leaving provider room failed"),
            Err(_) => warn!("Leaving provider room timed out"),
        }
    }

    async fn notify_leave(&self, channel_id: Uuid) {
        match timeout(
            self.settings.leave_timeout,
            self.api.leave(channel_id, &self.session_id),
        )
        .await
        {
            Ok(Ok(left)) => debug!(channel_id = %channel_id, left, "Leave acknowledged"),
            Ok(Err(e)) => warn!(channel_id = %channel_id, error = %e, "Leave notification failed"),
            Err(_) => warn!(channel_id = %channel_id, "Leave notification timed out"),
        }
    }

    async fn toggle_track(
        &self,
        room: &dyn MediaRoom,
        track: LocalTrack,
        enabled: bool,
    ) -> Result<(), TrackError> {
        let op = async {
            if enabled {
                room.publish(track).await
            } else {
                room.unpublish(track).await
            }
        };
        timeout(self.settings.media_timeout, op)
            .await
            .map_err(|_| TrackError::Timeout)?
            .map_err(|e| TrackError::Failed(e.to_string()))
    }

    fn spawn_heartbeat(
        &self,
        channel_id: Uuid,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let api = self.api.clone();
        let notices = self.notices.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The join itself refreshed the entry.
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let result = tokio::select! {
                    () = cancel.cancelled() => break,
                    result = timeout(period, api.heartbeat()) => result,
                };
                match result {
                    Ok(Ok(response)) if response.active => debug!("Heartbeat sent"),
                    Ok(Ok(_)) => {
                        warn!(channel_id = %channel_id, "Presence entry expired on the server");
                        let _ = notices.send(CallNotice::PresenceLost { channel_id });
                    }
                    Ok(Err(e)) => warn!(error = %e, "Heartbeat failed"),
                    Err(_) => warn!("Heartbeat timed out"),
                }
            }
            debug!("Heartbeat loop stopped");
        })
    }

    fn spawn_participant_refresh(
        &self,
        channel_id: Uuid,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let api = self.api.clone();
        let notices = self.notices.clone();
        let period = self.settings.participant_refresh_interval;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let result = tokio::select! {
                    () = cancel.cancelled() => break,
                    result = timeout(period, api.participants(channel_id)) => result,
                };
                match result {
                    Ok(Ok(snapshot)) => {
                        let _ = notices.send(CallNotice::Participants(snapshot));
                    }
                    Ok(Err(e)) => debug!(error = %e, "Participant refresh failed"),
                    Err(_) => debug!("Participant refresh timed out"),
                }
            }
            debug!("Participant refresh loop stopped");
        })
    }

    /// Turn a local track on or off.
    pub async fn set_track_enabled(
        &self,
        track: LocalTrack,
        enabled: bool,
    ) -> Result<(), TrackError> {
        let room = {
            let inner = self.inner.lock().await;
            match (&inner.state, &inner.active) {
                (CallState::Joined { .. }, Some(active)) => active.room.clone(),
                _ => return Err(TrackError::NotJoined),
            }
        };
        self.toggle_track(room.as_ref(), track, enabled).await?;

        let mut inner = self.inner.lock().await;
        match track {
            LocalTrack::Microphone => {
                inner.flags.audio = enabled;
                inner.flags.muted_by_moderator = false;
            }
            LocalTrack::Camera => inner.flags.video = enabled,
            LocalTrack::ScreenShare => inner.flags.screen_share = enabled,
        }
        self.notify(CallNotice::Media(inner.flags));
        Ok(())
    }

    /// Ask the server to mute, unmute or kick another participant.
    pub async fn moderate(
        &self,
        channel_id: Uuid,
        target_user_id: Uuid,
        action: ModerationAction,
    ) -> Result<(), ApiError> {
        self.api.moderate(channel_id, target_user_id, action).await
    }

    /// React to a server notification.
    pub async fn handle_event(&self, event: &VoiceEvent) {
        let active_channel = self.inner.lock().await.state.active_channel();
        if active_channel != Some(event.channel_id()) {
            return;
        }

        match event {
            VoiceEvent::ModerationAction {
                target_user_id,
                moderator_user_id,
                action,
                ..
            } if *target_user_id == self.user_id => {
                info!(moderator = %moderator_user_id, action = %action, "Moderation action received");
                match action {
                    ModerationAction::Mute => self.apply_moderator_mute(true).await,
                    ModerationAction::Unmute => self.apply_moderator_mute(false).await,
                    ModerationAction::Kick => self.teardown(Teardown::Kicked).await,
                }
            }
            VoiceEvent::SessionReplaced {
                user_id,
                active_session_id,
                ..
            } if *user_id == self.user_id
                && active_session_id.as_deref() != Some(self.session_id.as_str()) =>
            {
                info!(active_session = ?active_session_id, "Voice session replaced by another instance");
                self.teardown(Teardown::Replaced).await;
            }
            VoiceEvent::ChannelParticipants {
                planet_id,
                channel_id,
                user_ids,
            } => self.notify(CallNotice::Participants(ParticipantsResponse {
                planet_id: *planet_id,
                channel_id: *channel_id,
                user_ids: user_ids.clone(),
            })),
            _ => {}
        }
    }

    /// Moderator mute switches audio off; unmute only restores audio a
    /// moderator switched off.
    async fn apply_moderator_mute(&self, mute: bool) {
        let room = {
            let mut inner = self.inner.lock().await;
            let Some(active) = &inner.active else {
                return;
            };
            let room = active.room.clone();
            if mute {
                if !inner.flags.audio {
                    return;
                }
                inner.flags.audio = false;
                inner.flags.muted_by_moderator = true;
            } else {
                if !inner.flags.muted_by_moderator {
                    return;
                }
                inner.flags.audio = true;
                inner.flags.muted_by_moderator = false;
            }
            self.notify(CallNotice::Media(inner.flags));
            room
        };

        if let Err(e) = self
            .toggle_track(room.as_ref(), LocalTrack::Microphone, !mute)
            .await
        {
            warn!(error = %e, mute, "Applying moderator mute to the room failed");
        }
    }

    /// Check the provider connection after resume; rejoin if it is gone.
    ///
    /// Returns whether a rejoin happened.
    #[instrument(skip(self), fields(user_id = %self.user_id))]
    pub async fn recover(&self) -> Result<bool, JoinError> {
        let _guard = self.join_lock.lock().await;
        let (channel_id, room, video) = {
            let inner = self.inner.lock().await;
            match (inner.state, &inner.active) {
                (CallState::Joined { channel_id }, Some(active)) => {
                    (channel_id, active.room.clone(), inner.video_requested)
                }
                _ => return Ok(false),
            }
        };

        match timeout(self.settings.probe_timeout, room.probe()).await {
            Ok(Ok(())) => return Ok(false),
            Ok(Err(e)) => warn!(error = %e, "Provider connection lost, rejoining"),
            Err(_) => warn!("Provider liveness probe timed out, rejoining"),
        }

        self.teardown(Teardown::Recover).await;
        self.join_locked(channel_id, video).await?;
        Ok(true)
    }
}

/// Feed server notifications into a session until cancelled.
pub fn spawn_event_pump(
    session: Arc<CallSession>,
    mut events: broadcast::Receiver<VoiceEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => session.handle_event(&event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Voice event pump lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
