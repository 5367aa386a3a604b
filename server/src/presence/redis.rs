//! Redis-backed presence registry.
//!
//! Key layout (`{prefix}` defaults to `kaiku:voice`):
//! - `{prefix}:user:{user_id}` hash `channel`/`session`/`joined_at`, expiring
//! - `{prefix}:channel:{channel_id}` set of user ids
//! - `{prefix}:channels` set of channel ids that have a membership set
//! - `{prefix}:membership` hash user id -> channel set holding the user
//!
//! Every mutation is one Lua script so a reader never observes a half-applied
//! move. The join script derives the old channel's key from the membership
//! hash, which keeps this registry on a single Redis node.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fred::prelude::*;
use fred::types::FromValue;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use super::{JoinOutcome, LeaveOutcome, PresenceEntry, PresenceError, PresenceStore};

const JOIN_SCRIPT: &str = include_str!("lua/join.lua");
const LEAVE_SCRIPT: &str = include_str!("lua/leave.lua");
const HEARTBEAT_SCRIPT: &str = include_str!("lua/heartbeat.lua");
const SWEEP_SCRIPT: &str = include_str!("lua/sweep.lua");
const ENTRY_SCRIPT: &str = include_str!("lua/entry.lua");

#[derive(Debug, Clone, Copy)]
enum Script {
    Join,
    Leave,
    Heartbeat,
    Sweep,
    Entry,
}

impl Script {
    const fn source(self) -> &'static str {
        match self {
            Self::Join => JOIN_SCRIPT,
            Self::Leave => LEAVE_SCRIPT,
            Self::Heartbeat => HEARTBEAT_SCRIPT,
            Self::Sweep => SWEEP_SCRIPT,
            Self::Entry => ENTRY_SCRIPT,
        }
    }
}

/// Script SHAs for Lua scripts loaded in Redis.
#[derive(Clone, Default)]
struct ScriptShas {
    join: String,
    leave: String,
    heartbeat: String,
    sweep: String,
    entry: String,
}

impl ScriptShas {
    fn get(&self, script: Script) -> &str {
        match script {
            Script::Join => &self.join,
            Script::Leave => &self.leave,
            Script::Heartbeat => &self.heartbeat,
            Script::Sweep => &self.sweep,
            Script::Entry => &self.entry,
        }
    }
}

/// Presence registry stored in Redis.
#[derive(Clone)]
pub struct RedisPresenceStore {
    redis: Client,
    prefix: Arc<str>,
    scripts: Arc<RwLock<ScriptShas>>,
}

impl RedisPresenceStore {
    /// Creates a new registry.
    ///
    /// Call `init()` after creation to load the Lua scripts into Redis.
    pub fn new(redis: Client, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: Arc::from(prefix.into()),
            scripts: Arc::new(RwLock::new(ScriptShas::default())),
        }
    }

    /// Loads the Lua scripts into Redis.
    pub async fn init(&self) -> Result<(), PresenceError> {
        self.load_scripts().await
    }

    async fn load_scripts(&self) -> Result<(), PresenceError> {
        let shas = ScriptShas {
            join: self.redis.script_load(JOIN_SCRIPT).await?,
            leave: self.redis.script_load(LEAVE_SCRIPT).await?,
            heartbeat: self.redis.script_load(HEARTBEAT_SCRIPT).await?,
            sweep: self.redis.script_load(SWEEP_SCRIPT).await?,
            entry: self.redis.script_load(ENTRY_SCRIPT).await?,
        };

        info!(join_sha = %shas.join, leave_sha = %shas.leave, "Presence scripts loaded into Redis");
        *self.scripts.write().await = shas;
        Ok(())
    }

    /// Checks if an error is a NOSCRIPT error (script not found in Redis).
    fn is_noscript_error(error: &Error) -> bool {
        error.to_string().contains("NOSCRIPT")
    }

    /// Runs a script by SHA, reloading once on NOSCRIPT (Redis restart or flush).
    async fn run<R: FromValue>(
        &self,
        script: Script,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> Result<R, PresenceError> {
        let sha = self.scripts.read().await.get(script).to_string();

        let result: Result<R, Error> = if sha.is_empty() {
            self.redis
                .eval(script.source(), keys.clone(), args.clone())
                .await
        } else {
            self.redis.evalsha(&sha, keys.clone(), args.clone()).await
        };

        match result {
            Ok(value) => Ok(value),
            Err(e) if Self::is_noscript_error(&e) => {
                warn!(?script, "NOSCRIPT error, reloading presence scripts");
                self.load_scripts().await?;
                let sha = self.scripts.read().await.get(script).to_string();
                Ok(self.redis.evalsha(&sha, keys, args).await?)
            }
            Err(e) => {
                warn!(?script, error = %e, "Presence script failed");
                Err(e.into())
            }
        }
    }

    fn user_key(&self, user_id: Uuid) -> String {
        format!("{}{user_id}", self.user_prefix())
    }

    fn user_prefix(&self) -> String {
        format!("{}:user:", self.prefix)
    }

    fn channel_key(&self, channel_id: Uuid) -> String {
        format!("{}{channel_id}", self.channel_prefix())
    }

    fn channel_prefix(&self) -> String {
        format!("{}:channel:", self.prefix)
    }

    fn channels_key(&self) -> String {
        format!("{}:channels", self.prefix)
    }

    fn membership_key(&self) -> String {
        format!("{}:membership", self.prefix)
    }
}

fn parse_id(raw: &str) -> Result<Uuid, PresenceError> {
    Uuid::parse_str(raw).map_err(|e| PresenceError::Corrupt(format!("bad id '{raw}': {e}")))
}

fn parse_ids(raw: Vec<String>) -> Result<Vec<Uuid>, PresenceError> {
    raw.iter().map(|s| parse_id(s)).collect()
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn ttl_secs(ttl: Duration) -> String {
    ttl.as_secs().max(1).to_string()
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    #[tracing::instrument(skip(self, session_id))]
    async fn join_channel(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
        session_id: Option<&str>,
        ttl: Duration,
    ) -> Result<JoinOutcome, PresenceError> {
        let reply: Vec<String> = self
            .run(
                Script::Join,
                vec![
                    self.user_key(user_id),
                    self.channel_key(channel_id),
                    self.channels_key(),
                    self.membership_key(),
                ],
                vec![
                    user_id.to_string(),
                    channel_id.to_string(),
                    session_id.unwrap_or_default().to_string(),
                    ttl_secs(ttl),
                    Utc::now().timestamp().to_string(),
                    self.channel_prefix(),
                ],
            )
            .await?;

        let mut reply = reply.into_iter();
        let previous_channel = reply
            .next()
            .and_then(non_empty)
            .map(|raw| parse_id(&raw))
            .transpose()?;
        let previous_session = reply.next().and_then(non_empty);

        Ok(JoinOutcome {
            previous_channel,
            previous_session,
        })
    }

    #[tracing::instrument(skip(self, session_id))]
    async fn leave_channel(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
        session_id: Option<&str>,
    ) -> Result<LeaveOutcome, PresenceError> {
        let code: i64 = self
            .run(
                Script::Leave,
                vec![
                    self.user_key(user_id),
                    self.channel_key(channel_id),
                    self.channels_key(),
                    self.membership_key(),
                ],
                vec![
                    user_id.to_string(),
                    channel_id.to_string(),
                    session_id.unwrap_or_default().to_string(),
                ],
            )
            .await?;

        Ok(match code {
            1 => LeaveOutcome::Removed,
            -1 => LeaveOutcome::StaleSession,
            _ => LeaveOutcome::NotPresent,
        })
    }

    async fn heartbeat(&self, user_id: Uuid, ttl: Duration) -> Result<bool, PresenceError> {
        let refreshed: i64 = self
            .run(
                Script::Heartbeat,
                vec![self.user_key(user_id)],
                vec![ttl_secs(ttl)],
            )
            .await?;
        Ok(refreshed == 1)
    }

    async fn list_members(&self, channel_id: Uuid) -> Result<HashSet<Uuid>, PresenceError> {
        let raw: Vec<String> = self.redis.smembers(self.channel_key(channel_id)).await?;
        Ok(parse_ids(raw)?.into_iter().collect())
    }

    async fn entry(&self, user_id: Uuid) -> Result<Option<PresenceEntry>, PresenceError> {
        let reply: Option<Vec<String>> = self
            .run(Script::Entry, vec![self.user_key(user_id)], vec![])
            .await?;

        let Some(fields) = reply else {
            return Ok(None);
        };
        let [channel, session, joined_at, ttl] = <[String; 4]>::try_from(fields)
            .map_err(|f| PresenceError::Corrupt(format!("entry has {} fields", f.len())))?;

        let joined_at: DateTime<Utc> = joined_at
            .parse::<i64>()
            .ok()
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .unwrap_or_else(Utc::now);
        let ttl = ttl.parse::<i64>().unwrap_or(0).max(0);

        Ok(Some(PresenceEntry {
            user_id,
            channel_id: parse_id(&channel)?,
            session_id: non_empty(session),
            joined_at,
            expires_at: Utc::now() + chrono::Duration::seconds(ttl),
        }))
    }

    async fn tracked_channels(&self) -> Result<Vec<Uuid>, PresenceError> {
        let raw: Vec<String> = self.redis.smembers(self.channels_key()).await?;
        parse_ids(raw)
    }

    #[tracing::instrument(skip(self))]
    async fn sweep_channel(&self, channel_id: Uuid) -> Result<Vec<Uuid>, PresenceError> {
        let raw: Vec<String> = self
            .run(
                Script::Sweep,
                vec![
                    self.channel_key(channel_id),
                    self.channels_key(),
                    self.membership_key(),
                ],
                vec![channel_id.to_string(), self.user_prefix()],
            )
            .await?;
        parse_ids(raw)
    }
}
