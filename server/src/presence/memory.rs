//! In-process presence registry.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    session_matches, JoinOutcome, LeaveOutcome, PresenceEntry, PresenceError, PresenceStore,
};

struct StoredEntry {
    channel_id: Uuid,
    session_id: Option<String>,
    joined_at: DateTime<Utc>,
    expires_at: Instant,
}

impl StoredEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<Uuid, StoredEntry>,
    /// Which channel set currently holds each user.
    membership: HashMap<Uuid, Uuid>,
    channels: HashMap<Uuid, HashSet<Uuid>>,
}

impl State {
    fn live_entry(&self, user_id: Uuid, now: Instant) -> Option<&StoredEntry> {
        self.entries.get(&user_id).filter(|e| e.is_live(now))
    }

    fn remove_member(&mut self, channel_id: Uuid, user_id: Uuid) -> bool {
        let removed = match self.channels.get_mut(&channel_id) {
            Some(members) => {
                let removed = members.remove(&user_id);
                if members.is_empty() {
                    self.channels.remove(&channel_id);
                }
                removed
            }
            None => false,
        };
        if self.membership.get(&user_id) == Some(&channel_id) {
            self.membership.remove(&user_id);
        }
        removed
    }
}

/// Presence registry kept in process memory.
///
/// Same contract as the Redis registry; every operation runs under one mutex,
/// which gives the atomicity the trait requires. TTLs follow `tokio::time`, so
/// tests can pause and advance the clock.
#[derive(Default)]
pub struct MemoryPresenceStore {
    state: Mutex<State>,
}

impl MemoryPresenceStore {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, PresenceError> {
        self.state
            .lock()
            .map_err(|_| PresenceError::Unavailable("presence state poisoned".into()))
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn join_channel(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
        session_id: Option<&str>,
        ttl: Duration,
    ) -> Result<JoinOutcome, PresenceError> {
        let now = Instant::now();
        let mut state = self.lock()?;

        let previous_session = state
            .live_entry(user_id, now)
            .and_then(|e| e.session_id.clone());

        let previous_channel = match state.membership.get(&user_id).copied() {
            Some(old) if old != channel_id => {
                state.remove_member(old, user_id);
                Some(old)
            }
            _ => None,
        };

        state.entries.insert(
            user_id,
            StoredEntry {
                channel_id,
                session_id: session_id.map(str::to_owned),
                joined_at: Utc::now(),
                expires_at: now + ttl,
            },
        );
        state.membership.insert(user_id, channel_id);
        state.channels.entry(channel_id).or_default().insert(user_id);

        Ok(JoinOutcome {
            previous_channel,
            previous_session,
        })
    }

    async fn leave_channel(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
        session_id: Option<&str>,
    ) -> Result<LeaveOutcome, PresenceError> {
        let now = Instant::now();
        let mut state = self.lock()?;

        let owns_entry = state
            .live_entry(user_id, now)
            .filter(|e| e.channel_id == channel_id)
            .map(|e| session_matches(e.session_id.as_deref(), session_id));

        match owns_entry {
            Some(false) => return Ok(LeaveOutcome::StaleSession),
            Some(true) => {
                state.entries.remove(&user_id);
            }
            None => {}
        }

        if state.remove_member(channel_id, user_id) {
            Ok(LeaveOutcome::Removed)
        } else {
            Ok(LeaveOutcome::NotPresent)
        }
    }

    async fn heartbeat(&self, user_id: Uuid, ttl: Duration) -> Result<bool, PresenceError> {
        let now = Instant::now();
        let mut state = self.lock()?;
        match state.entries.get_mut(&user_id) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_members(&self, channel_id: Uuid) -> Result<HashSet<Uuid>, PresenceError> {
        let state = self.lock()?;
        Ok(state.channels.get(&channel_id).cloned().unwrap_or_default())
    }

    async fn entry(&self, user_id: Uuid) -> Result<Option<PresenceEntry>, PresenceError> {
        let now = Instant::now();
        let state = self.lock()?;
        Ok(state.live_entry(user_id, now).map(|e| {
            let remaining = e.expires_at.saturating_duration_since(now);
            PresenceEntry {
                user_id,
                channel_id: e.channel_id,
                session_id: e.session_id.clone(),
                joined_at: e.joined_at,
                expires_at: Utc::now()
                    + chrono::Duration::from_std(remaining).unwrap_or_default(),
            }
        }))
    }

    async fn tracked_channels(&self) -> Result<Vec<Uuid>, PresenceError> {
        let state = self.lock()?;
        Ok(state.channels.keys().copied().collect())
    }

    async fn sweep_channel(&self, channel_id: Uuid) -> Result<Vec<Uuid>, PresenceError> {
        let now = Instant::now();
        let mut state = self.lock()?;

        let members: Vec<Uuid> = state
            .channels
            .get(&channel_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();

        let stale: Vec<Uuid> = members
            .into_iter()
            .filter(|user_id| {
                state
                    .live_entry(*user_id, now)
                    .is_none_or(|e| e.channel_id != channel_id)
            })
            .collect();

        for user_id in &stale {
            state.remove_member(channel_id, *user_id);
            if state
                .entries
                .get(user_id)
                .is_some_and(|e| !e.is_live(now))
            {
                state.entries.remove(user_id);
            }
        }

        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(120);

    fn ids() -> (Uuid, Uuid, Uuid) {
        (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_join_then_move_returns_previous_channel() {
        let store = MemoryPresenceStore::new();
        let (user, c1, c2) = ids();

        let first = store.join_channel(user, c1, Some("s1"), TTL).await.unwrap();
        assert_eq!(first, JoinOutcome::default());

        let second = store.join_channel(user, c2, Some("s1"), TTL).await.unwrap();
        assert_eq!(second.previous_channel, Some(c1));
        assert_eq!(second.previous_session.as_deref(), Some("s1"));

        assert!(store.list_members(c1).await.unwrap().is_empty());
        assert_eq!(store.list_members(c2).await.unwrap(), HashSet::from([user]));
        assert_eq!(store.tracked_channels().await.unwrap(), vec![c2]);
    }

    #[tokio::test]
    async fn test_rejoin_same_channel_reports_no_previous_channel() {
        let store = MemoryPresenceStore::new();
        let (user, channel, _) = ids();

        store.join_channel(user, channel, Some("old"), TTL).await.unwrap();
        let outcome = store.join_channel(user, channel, Some("new"), TTL).await.unwrap();

        assert_eq!(outcome.previous_channel, None);
        assert_eq!(outcome.previous_session.as_deref(), Some("old"));
        let entry = store.entry(user).await.unwrap().unwrap();
        assert_eq!(entry.session_id.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let store = MemoryPresenceStore::new();
        let (user, channel, _) = ids();

        store.join_channel(user, channel, Some("s"), TTL).await.unwrap();
        assert_eq!(
            store.leave_channel(user, channel, Some("s")).await.unwrap(),
            LeaveOutcome::Removed
        );
        assert_eq!(
            store.leave_channel(user, channel, Some("s")).await.unwrap(),
            LeaveOutcome::NotPresent
        );
        assert!(store.entry(user).await.unwrap().is_none());
        assert!(store.tracked_channels().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_session_leave_is_ignored() {
        let store = MemoryPresenceStore::new();
        let (user, channel, _) = ids();

        store.join_channel(user, channel, Some("old"), TTL).await.unwrap();
        store.join_channel(user, channel, Some("new"), TTL).await.unwrap();

        assert_eq!(
            store.leave_channel(user, channel, Some("old")).await.unwrap(),
            LeaveOutcome::StaleSession
        );
        assert!(store.list_members(channel).await.unwrap().contains(&user));
    }

    #[tokio::test]
    async fn test_leave_of_old_channel_keeps_newer_join() {
        let store = MemoryPresenceStore::new();
        let (user, c1, c2) = ids();

        store.join_channel(user, c1, Some("s"), TTL).await.unwrap();
        store.join_channel(user, c2, Some("s"), TTL).await.unwrap();

        assert_eq!(
            store.leave_channel(user, c1, Some("s")).await.unwrap(),
            LeaveOutcome::NotPresent
        );
        let entry = store.entry(user).await.unwrap().unwrap();
        assert_eq!(entry.channel_id, c2);
    }

    #[tokio::test]
    async fn test_heartbeat_never_changes_channel() {
        let store = MemoryPresenceStore::new();
        let (user, channel, _) = ids();

        assert!(!store.heartbeat(user, TTL).await.unwrap());
        store.join_channel(user, channel, None, TTL).await.unwrap();
        for _ in 0..3 {
            assert!(store.heartbeat(user, TTL).await.unwrap());
        }
        assert_eq!(store.entry(user).await.unwrap().unwrap().channel_id, channel);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_swept() {
        let store = MemoryPresenceStore::new();
        let (user, other, channel) = ids();

        store.join_channel(user, channel, None, TTL).await.unwrap();
        store.join_channel(other, channel, None, TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        store.heartbeat(other, TTL).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(store.entry(user).await.unwrap().is_none());
        assert_eq!(store.sweep_channel(channel).await.unwrap(), vec![user]);
        assert_eq!(store.list_members(channel).await.unwrap(), HashSet::from([other]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_entry_alive() {
        let store = MemoryPresenceStore::new();
        let (user, channel, _) = ids();

        store.join_channel(user, channel, None, TTL).await.unwrap();
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(45)).await;
            assert!(store.heartbeat(user, TTL).await.unwrap());
        }
        assert!(store.sweep_channel(channel).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_after_expiry_still_leaves_old_set() {
        let store = MemoryPresenceStore::new();
        let (user, c1, c2) = ids();

        store.join_channel(user, c1, None, TTL).await.unwrap();
        tokio::time::advance(Duration::from_secs(500)).await;

        let outcome = store.join_channel(user, c2, None, TTL).await.unwrap();
        assert_eq!(outcome.previous_channel, Some(c1));
        assert_eq!(outcome.previous_session, None);
        assert!(store.list_members(c1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_drops_empty_channel() {
        let store = MemoryPresenceStore::new();
        let (user, channel, _) = ids();

        store.join_channel(user, channel, None, Duration::ZERO).await.unwrap();
        assert_eq!(store.sweep_channel(channel).await.unwrap(), vec![user]);
        assert!(store.tracked_channels().await.unwrap().is_empty());
    }
}
