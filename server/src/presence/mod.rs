//! Voice Presence Registry
//!
//! Records which channel every in-call user occupies (`PresenceEntry`, one
//! per user, expiring unless refreshed by heartbeats) and the reverse index of
//! users per channel (`ChannelMembership`).
//!
//! All mutation goes through [`PresenceStore::join_channel`],
//! [`PresenceStore::leave_channel`], [`PresenceStore::heartbeat`] and
//! [`PresenceStore::sweep_channel`]. Each of them applies completely or not at
//! all, so no observer ever sees a user in two channel sets.

mod memory;
mod redis;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryPresenceStore;
pub use redis::RedisPresenceStore;

/// Live presence record of one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    /// User ID.
    pub user_id: Uuid,
    /// Channel the user occupies.
    pub channel_id: Uuid,
    /// Client session that joined, if the client supplied one.
    pub session_id: Option<String>,
    /// When the join was recorded.
    pub joined_at: DateTime<Utc>,
    /// When the entry expires without another heartbeat.
    pub expires_at: DateTime<Utc>,
}

/// Result of an atomic join.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Channel the user was moved out of (only when different from the new one).
    pub previous_channel: Option<Uuid>,
    /// Session of the entry that was overwritten, if it was still live.
    pub previous_session: Option<String>,
}

/// Result of a leave request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The user was removed from the channel.
    Removed,
    /// Nothing to remove.
    NotPresent,
    /// A newer session owns the entry; the leave was ignored.
    StaleSession,
}

/// Presence registry errors.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// Backing store could not be reached or rejected the operation.
    #[error("Presence store unavailable: {0}")]
    Unavailable(String),

    /// Stored data could not be interpreted.
    #[error("Corrupt presence data: {0}")]
    Corrupt(String),
}

impl From<fred::error::Error> for PresenceError {
    fn from(err: fred::error::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Shared who-is-where registry.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Atomically move `user_id` into `channel_id` with a fresh TTL.
    async fn join_channel(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
        session_id: Option<&str>,
        ttl: Duration,
    ) -> Result<JoinOutcome, PresenceError>;

    /// Remove `user_id` from `channel_id`.
    ///
    /// The entry is only deleted while it still points at `channel_id`, and
    /// only when `session_id` is `None` or matches the stored session.
    async fn leave_channel(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
        session_id: Option<&str>,
    ) -> Result<LeaveOutcome, PresenceError>;

    /// Refresh the TTL of the user's entry. Returns `false` when there is no
    /// live entry to refresh.
    async fn heartbeat(&self, user_id: Uuid, ttl: Duration) -> Result<bool, PresenceError>;

    /// Snapshot of the channel's membership set.
    async fn list_members(&self, channel_id: Uuid) -> Result<HashSet<Uuid>, PresenceError>;

    /// The user's live entry, if any.
    async fn entry(&self, user_id: Uuid) -> Result<Option<PresenceEntry>, PresenceError>;

    /// Channels that currently have a membership set.
    async fn tracked_channels(&self) -> Result<Vec<Uuid>, PresenceError>;

    /// Drop members of `channel_id` whose entry expired or points elsewhere.
    /// Returns the removed users.
    async fn sweep_channel(&self, channel_id: Uuid) -> Result<Vec<Uuid>, PresenceError>;
}

/// Whether a leave carrying `requested` may remove an entry stored with `stored`.
///
/// Sessionless requests are forced leaves; sessionless entries accept any leave.
pub(crate) fn session_matches(stored: Option<&str>, requested: Option<&str>) -> bool {
    match (stored, requested) {
        (Some(stored), Some(requested)) => stored == requested,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_leave_matches_any_session() {
        assert!(session_matches(Some("tab-a"), None));
        assert!(session_matches(None, Some("tab-a")));
        assert!(session_matches(Some("tab-a"), Some("tab-a")));
        assert!(!session_matches(Some("tab-a"), Some("tab-b")));
    }
}
