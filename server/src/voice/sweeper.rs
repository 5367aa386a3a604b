//! Reconciliation Sweeper
//!
//! Two periodic passes heal drift between the presence registry and reality:
//! - local sweep: drop members whose entry expired or points elsewhere
//! - provider reconciliation: drop members the provider no longer reports
//!
//! The provider is only trusted to shrink local state, never to grow it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::coordinator::VoicePresence;
use crate::config::Config;
use crate::presence::LeaveOutcome;

/// Sweeper timing.
#[derive(Debug, Clone, Copy)]
pub struct SweeperSettings {
    /// Period of the local TTL sweep.
    pub local_interval: Duration,
    /// Period of provider reconciliation.
    pub provider_interval: Duration,
    /// Entries younger than this are left alone by provider reconciliation.
    pub provider_grace: Duration,
}

impl From<&Config> for SweeperSettings {
    fn from(config: &Config) -> Self {
        Self {
            local_interval: Duration::from_secs(config.local_sweep_interval_secs),
            provider_interval: Duration::from_secs(config.provider_reconcile_interval_secs),
            provider_grace: Duration::from_secs(config.provider_reconcile_grace_secs),
        }
    }
}

/// Result of one pass, for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Channels inspected.
    pub channels: usize,
    /// Members removed.
    pub removed: usize,
}

/// Periodic presence reconciliation.
pub struct Sweeper {
    voice: Arc<VoicePresence>,
    settings: SweeperSettings,
}

impl Sweeper {
    /// Create a sweeper over the coordinator's registry and gateway.
    pub const fn new(voice: Arc<VoicePresence>, settings: SweeperSettings) -> Self {
        Self { voice, settings }
    }

    /// Run both passes on their intervals until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        let mut local = tokio::time::interval(self.settings.local_interval);
        let mut provider = tokio::time::interval(self.settings.provider_interval);
        local.set_missed_tick_behavior(MissedTickBehavior::Delay);
        provider.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately; skip it for the
        // provider pass so fresh joins get a full period.
        provider.tick().await;

        info!(
            local_secs = self.settings.local_interval.as_secs(),
            provider_secs = self.settings.provider_interval.as_secs(),
            "Presence sweeper started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = local.tick() => {
                    self.local_sweep().await;
                }
                _ = provider.tick() => {
                    self.reconcile_provider().await;
                }
            }
        }

        info!("Presence sweeper stopped");
    }

    /// Remove members whose presence entry expired or moved.
    #[tracing::instrument(skip(self))]
    pub async fn local_sweep(&self) -> SweepReport {
        let store = self.voice.store();
        let channels = match store.tracked_channels().await {
            Ok(channels) => channels,
            Err(e) => {
                warn!(error = %e, "Local sweep skipped, registry unavailable");
                return SweepReport::default();
            }
        };

        let mut report = SweepReport {
            channels: channels.len(),
            removed: 0,
        };

        for channel_id in channels {
            match store.sweep_channel(channel_id).await {
                Ok(stale) if stale.is_empty() => {}
                Ok(stale) => {
                    debug!(channel_id = %channel_id, removed = stale.len(), "Swept stale voice members");
                    report.removed += stale.len();
                    self.voice.broadcast_participants(channel_id).await;
                }
                Err(e) => warn!(channel_id = %channel_id, error = %e, "Failed to sweep channel"),
            }
        }

        self.voice.cleanup_rate_limits();

        if report.removed > 0 {
            info!(removed = report.removed, channels = report.channels, "Local presence sweep removed stale members");
        }
        report
    }

    /// Drop local members the provider no longer reports.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_provider(&self) -> SweepReport {
        let gateway = self.voice.gateway();
        if !gateway.is_configured() {
            return SweepReport::default();
        }

        let channels = gateway.cached_channels();
        let mut report = SweepReport {
            channels: channels.len(),
            removed: 0,
        };

        for channel_id in channels {
            report.removed += self.reconcile_channel(channel_id).await;
        }

        if report.removed > 0 {
            info!(removed = report.removed, channels = report.channels, "Provider reconciliation removed stale members");
        }
        report
    }

    async fn reconcile_channel(&self, channel_id: Uuid) -> usize {
        let store = self.voice.store();
        let gateway = self.voice.gateway();

        let live = match gateway.live_user_ids(channel_id).await {
            Ok(Some(live)) => live,
            Ok(None) => return 0,
            Err(e) => {
                // Never evict on a failed query.
                warn!(channel_id = %channel_id, error = %e, "Skipping provider reconciliation");
                return 0;
            }
        };

        let local = match store.list_members(channel_id).await {
            Ok(local) => local,
            Err(e) => {
                warn!(channel_id = %channel_id, error = %e, "Skipping provider reconciliation");
                return 0;
            }
        };

        let unknown = live.difference(&local).count();
        if unknown > 0 {
            debug!(channel_id = %channel_id, unknown, "Provider reports participants without local presence");
        }

        if local.is_empty() && live.is_empty() {
            self.voice.forget_idle_channel(channel_id).await;
            return 0;
        }

        let grace = chrono::Duration::from_std(self.settings.provider_grace).unwrap_or_default();
        let now = Utc::now();
        let mut removed = 0;

        for user_id in local.difference(&live) {
            let entry = match store.entry(*user_id).await {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Failed to read presence entry");
                    continue;
                }
            };
            let entry = entry.filter(|e| e.channel_id == channel_id);
            if entry.as_ref().is_some_and(|e| now - e.joined_at < grace) {
                continue;
            }

            // Guard with the observed session so a rejoin since the read survives.
            let observed = entry.and_then(|e| e.session_id);
            match store
                .leave_channel(*user_id, channel_id, observed.as_deref())
                .await
            {
                Ok(LeaveOutcome::Removed) => {
                    debug!(user_id = %user_id, channel_id = %channel_id, "Removed member unknown to provider");
                    removed += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(user_id = %user_id, error = %e, "Failed to remove stale member"),
            }
        }

        if removed > 0 {
            self.voice.broadcast_participants(channel_id).await;
        }
        removed
    }
}
