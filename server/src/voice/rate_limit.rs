//! Rate limiting for voice joins.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use uuid::Uuid;

use super::error::VoiceError;

/// Allows one join per user per `min_interval`.
pub struct VoiceRateLimiter {
    /// Map of `user_id` to last accepted join.
    last_join: DashMap<Uuid, Instant>,
    /// Minimum time between join requests. Zero disables the limit.
    min_interval: Duration,
}

impl VoiceRateLimiter {
    /// Create a new rate limiter.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_join: DashMap::new(),
            min_interval,
        }
    }

    /// Record a join attempt, rejecting it if the previous one was too recent.
    pub fn check_join(&self, user_id: Uuid) -> Result<(), VoiceError> {
        if self.min_interval.is_zero() {
            return Ok(());
        }

        let now = Instant::now();
        match self.last_join.entry(user_id) {
            Entry::Occupied(mut last) => {
                if now.duration_since(*last.get()) < self.min_interval {
                    return Err(VoiceError::RateLimited);
                }
                last.insert(now);
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
            }
        }
        Ok(())
    }

    /// Forget users whose last join is long past.
    pub fn cleanup(&self) {
        let threshold = self.min_interval * 10;
        self.last_join.retain(|_, last| last.elapsed() < threshold);
    }

    /// Number of users tracked.
    pub fn tracked(&self) -> usize {
        self.last_join.len()
    }
}
