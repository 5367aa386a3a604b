//! Server Configuration
//!
//! Loads configuration from environment variables.

use anyhow::{bail, Context, Result};
use std::env;
use std::time::Duration;

/// Where presence state is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceBackend {
    /// Shared Redis registry (multi-node).
    Redis,
    /// Process-local registry (single node, tests).
    Memory,
}

/// Credentials for the external call provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// REST base URL, e.g. `https://api.provider.example/v2`
    pub base_url: String,
    /// Organization id used as the basic-auth user.
    pub org_id: String,
    /// API key used as the basic-auth password.
    pub api_key: String,
    /// Preset for participants allowed audio only.
    pub audio_preset: String,
    /// Preset for participants allowed audio and video.
    pub video_preset: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8080")
    pub bind_address: String,

    /// Redis connection URL
    pub redis_url: String,

    /// Presence registry backend
    pub presence_backend: PresenceBackend,

    /// Prefix for every presence key in Redis
    pub presence_key_prefix: String,

    /// Presence entry TTL in seconds (default: 120)
    pub presence_ttl_secs: u64,

    /// Heartbeat interval advertised to clients in seconds (default: 45)
    pub heartbeat_interval_secs: u64,

    /// Local TTL sweep period in seconds (default: 30)
    pub local_sweep_interval_secs: u64,

    /// Provider reconciliation period in seconds (default: 120)
    pub provider_reconcile_interval_secs: u64,

    /// Entries younger than this are never removed by provider reconciliation (default: 60)
    pub provider_reconcile_grace_secs: u64,

    /// Minimum time between two joins of the same user in milliseconds (default: 1000)
    pub join_min_interval_ms: u64,

    /// Ed25519 public key for access token verification (base64-encoded PEM)
    pub jwt_public_key: String,

    /// External call provider (None = not configured)
    pub provider: Option<ProviderConfig>,

    /// Base URL of the external authorization service
    pub access_service_url: String,

    /// Timeout for authorization checks in seconds (default: 8)
    pub access_timeout_secs: u64,
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let presence_backend = match env::var("PRESENCE_BACKEND")
            .unwrap_or_else(|_| "redis".into())
            .as_str()
        {
            "redis" => PresenceBackend::Redis,
            "memory" => PresenceBackend::Memory,
            other => bail!("PRESENCE_BACKEND must be 'redis' or 'memory', got '{other}'"),
        };

        let provider = match (
            env::var("CALL_PROVIDER_BASE_URL").ok(),
            env::var("CALL_PROVIDER_ORG_ID").ok(),
            env::var("CALL_PROVIDER_API_KEY").ok(),
        ) {
            (Some(base_url), Some(org_id), Some(api_key)) => Some(ProviderConfig {
                base_url,
                org_id,
                api_key,
                audio_preset: env::var("CALL_PROVIDER_AUDIO_PRESET")
                    .unwrap_or_else(|_| "voice_participant".into()),
                video_preset: env::var("CALL_PROVIDER_VIDEO_PRESET")
                    .unwrap_or_else(|_| "video_participant".into()),
                timeout: Duration::from_secs(env_u64("CALL_PROVIDER_TIMEOUT_SECS", 10)),
            }),
            _ => None,
        };

        let config = Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into()),
            presence_backend,
            presence_key_prefix: env::var("PRESENCE_KEY_PREFIX")
                .unwrap_or_else(|_| "kaiku:voice".into()),
            presence_ttl_secs: env_u64("PRESENCE_TTL_SECS", 120),
            heartbeat_interval_secs: env_u64("HEARTBEAT_INTERVAL_SECS", 45),
            local_sweep_interval_secs: env_u64("LOCAL_SWEEP_INTERVAL_SECS", 30),
            provider_reconcile_interval_secs: env_u64("PROVIDER_RECONCILE_INTERVAL_SECS", 120),
            provider_reconcile_grace_secs: env_u64("PROVIDER_RECONCILE_GRACE_SECS", 60),
            join_min_interval_ms: env_u64("JOIN_MIN_INTERVAL_MS", 1000),
            jwt_public_key: env::var("JWT_PUBLIC_KEY").context("JWT_PUBLIC_KEY must be set")?,
            provider,
            access_service_url: env::var("ACCESS_SERVICE_URL")
                .context("ACCESS_SERVICE_URL must be set")?,
            access_timeout_secs: env_u64("ACCESS_TIMEOUT_SECS", 8),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject timing values the sweeper or the presence TTL cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.local_sweep_interval_secs == 0 {
            bail!("LOCAL_SWEEP_INTERVAL_SECS must be greater than 0");
        }
        if self.provider_reconcile_interval_secs == 0 {
            bail!("PROVIDER_RECONCILE_INTERVAL_SECS must be greater than 0");
        }
        if self.heartbeat_interval_secs == 0 {
            bail!("HEARTBEAT_INTERVAL_SECS must be greater than 0");
        }
        if self.presence_ttl_secs <= self.heartbeat_interval_secs {
            bail!(
                "PRESENCE_TTL_SECS ({}) must be greater than HEARTBEAT_INTERVAL_SECS ({})",
                self.presence_ttl_secs,
                self.heartbeat_interval_secs
            );
        }
        Ok(())
    }

    /// Check if the call provider is configured.
    #[must_use]
    pub const fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    /// Presence entry TTL.
    #[must_use]
    pub const fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }

    /// Create a default configuration for testing.
    ///
    /// Uses the in-memory presence backend and no call provider.
    /// Redis-backed tests expect: `docker run -d --name canis-test-redis -e ALLOW_EMPTY_PASSWORD=yes -p 6380:6379 bitnami/redis:latest`
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".into(),
            redis_url: "redis://localhost:6380".into(),
            presence_backend: PresenceBackend::Memory,
            presence_key_prefix: "test:voice".into(),
            presence_ttl_secs: 120,
            heartbeat_interval_secs: 45,
            local_sweep_interval_secs: 30,
            provider_reconcile_interval_secs: 120,
            provider_reconcile_grace_secs: 60,
            join_min_interval_ms: 0,
            jwt_public_key: String::new(),
            provider: None,
            access_service_url: "http://localhost:9090".into(),
            access_timeout_secs: 8,
        }
    }
}
