//! Client Settings
//!
//! Timeouts and loop periods of a call session. Every external call a
//! session makes is bounded by one of these.

use std::time::Duration;

/// Call session tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    /// Token request against the presence server.
    pub token_timeout: Duration,
    /// Microphone/camera permission check.
    pub permission_timeout: Duration,
    /// Connecting to the provider room.
    pub room_join_timeout: Duration,
    /// Publishing or unpublishing a local track.
    pub media_timeout: Duration,
    /// Leaving the room and telling the server about it, per step.
    pub leave_timeout: Duration,
    /// How long a stopping background loop may take before it is aborted.
    pub loop_grace: Duration,
    /// Heartbeat period, unless the server advertises its own.
    pub heartbeat_interval: Duration,
    /// Participant snapshot refresh period.
    pub participant_refresh_interval: Duration,
    /// Provider liveness probe on resume.
    pub probe_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            token_timeout: Duration::from_secs(12),
            permission_timeout: Duration::from_secs(8),
            room_join_timeout: Duration::from_secs(25),
            media_timeout: Duration::from_secs(8),
            leave_timeout: Duration::from_secs(5),
            loop_grace: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(45),
            participant_refresh_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientSettings {
    /// Heartbeat period to use for a call, preferring the server's value.
    #[must_use]
    pub fn heartbeat_for(&self, advertised_secs: u64) -> Duration {
        if advertised_secs == 0 {
            self.heartbeat_interval
        } else {
            Duration::from_secs(advertised_secs)
        }
    }
}
