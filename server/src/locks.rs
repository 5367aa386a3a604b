//! Keyed async locks.
//!
//! A lazily populated map of per-key locks (per user for joins, per channel
//! for meeting creation and in-flight joins). An entry is only pruned when the
//! map holds the last reference to it, so a lock object is never dropped while
//! someone waits on or holds it.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Map of per-key async locks.
///
/// [`KeyedLocks::lock`] is exclusive; [`KeyedLocks::read`] holders only
/// exclude exclusive holders.
pub struct KeyedLocks<K> {
    locks: DashMap<K, Arc<RwLock<()>>>,
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty lock map.
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn slot(&self, key: &K) -> Arc<RwLock<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Acquire the lock for `key` exclusively, waiting behind any current holder.
    pub async fn lock(&self, key: K) -> KeyedGuard<'_, K> {
        let guard = self.slot(&key).write_owned().await;
        self.guard(key, Held::Exclusive(guard))
    }

    /// Acquire a shared hold on `key`, waiting only behind an exclusive holder.
    pub async fn read(&self, key: K) -> KeyedGuard<'_, K> {
        let guard = self.slot(&key).read_owned().await;
        self.guard(key, Held::Shared(guard))
    }

    /// Take the lock for `key` exclusively if nobody holds it in any mode.
    pub fn try_lock(&self, key: K) -> Option<KeyedGuard<'_, K>> {
        let attempt = self.slot(&key).try_write_owned();
        match attempt {
            Ok(guard) => Some(self.guard(key, Held::Exclusive(guard))),
            Err(_) => {
                self.prune(&key);
                None
            }
        }
    }

    fn guard(&self, key: K, held: Held) -> KeyedGuard<'_, K> {
        KeyedGuard {
            owner: self,
            key,
            guard: Some(held),
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn prune(&self, key: &K) {
        // Strong count 1 means only the map references it: no holder, no waiter.
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

// Guards are only held for their release on drop.
#[allow(dead_code)]
enum Held {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// Held lock for one key; releases and prunes on drop.
pub struct KeyedGuard<'a, K>
where
    K: Eq + Hash + Clone,
{
    owner: &'a KeyedLocks<K>,
    key: K,
    guard: Option<Held>,
}

impl<K> Drop for KeyedGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        // Release first so the guard's Arc no longer counts.
        drop(self.guard.take());
        self.owner.prune(&self.key);
    }
}
