//! Change Notification Channel
//!
//! Every presence mutation and moderation action is published here as a
//! [`VoiceEvent`]. Consumers (WebSocket connections) subscribe to the local
//! hub and filter by channel.
//!
//! With Redis configured, events are published on `voice:channel:{id}` and a
//! relay task feeds every node's local hub from a pattern subscription, so a
//! client connected to node B hears about a join handled by node A.
//! Delivery is at-least-once; order is kept per channel because each channel
//! maps to one pub/sub channel.

use fred::prelude::*;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vc_common::VoiceEvent;

/// Capacity of the in-process broadcast buffer.
const LOCAL_CAPACITY: usize = 1024;

/// Redis pub/sub channel names.
pub mod channels {
    use uuid::Uuid;

    /// Pattern matching every voice channel.
    pub const PATTERN: &str = "voice:channel:*";

    /// Prefix shared by every voice channel.
    pub const PREFIX: &str = "voice:channel:";

    /// Pub/sub channel of one voice channel.
    pub fn voice_channel(channel_id: Uuid) -> String {
        format!("{PREFIX}{channel_id}")
    }
}

/// Fan-out point for voice notifications.
pub struct NotificationHub {
    local: broadcast::Sender<VoiceEvent>,
    redis: Option<Client>,
}

impl NotificationHub {
    /// Single-node hub: events go straight to local subscribers.
    pub fn local() -> Self {
        let (local, _) = broadcast::channel(LOCAL_CAPACITY);
        Self { local, redis: None }
    }

    /// Multi-node hub: events go through Redis pub/sub.
    ///
    /// Call [`NotificationHub::spawn_relay`] so published events reach local
    /// subscribers.
    pub fn with_redis(redis: Client) -> Self {
        let (local, _) = broadcast::channel(LOCAL_CAPACITY);
        Self {
            local,
            redis: Some(redis),
        }
    }

    /// Receive every event delivered to this node.
    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.local.subscribe()
    }

    /// Publish an event. Never fails; delivery problems are logged.
    pub async fn publish(&self, event: VoiceEvent) {
        let channel_id = event.channel_id();

        if let Some(redis) = &self.redis {
            match event.to_json() {
                Ok(payload) => {
                    let result: Result<(), Error> = redis
                        .publish(channels::voice_channel(channel_id), payload)
                        .await;
                    match result {
                        Ok(()) => return,
                        Err(e) => {
                            warn!(channel_id = %channel_id, error = %e, "Redis publish failed, delivering locally only");
                        }
                    }
                }
                Err(e) => {
                    error!(channel_id = %channel_id, error = %e, "Failed to encode voice event");
                    return;
                }
            }
        }

        self.deliver_local(event);
    }

    fn deliver_local(&self, event: VoiceEvent) {
        // Err only means nobody is listening right now.
        if self.local.send(event).is_err() {
            debug!("Voice event dropped, no local subscribers");
        }
    }

    /// Relay Redis pub/sub into the local hub until cancelled.
    ///
    /// Returns `None` for a local-only hub.
    pub fn spawn_relay(
        self: &std::sync::Arc<Self>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let redis = self.redis.clone()?;
        let hub = self.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = hub.relay(redis, cancel).await {
                error!(error = %e, "Voice event relay stopped");
            }
        }))
    }

    async fn relay(&self, redis: Client, cancel: CancellationToken) -> Result<(), Error> {
        let subscriber = redis.clone_new();
        subscriber.connect();
        subscriber.wait_for_connect().await?;

        let mut messages = subscriber.message_rx();
        subscriber.psubscribe(channels::PATTERN).await?;
        info!(pattern = channels::PATTERN, "Voice event relay subscribed");

        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => break,
                message = messages.recv() => message,
            };

            let message = match message {
                Ok(message) => message,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Voice event relay lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let Some(payload) = message.value.as_str() else {
                continue;
            };
            match VoiceEvent::from_json(&payload) {
                Ok(event) if channel_from_topic(&message.channel) == Some(event.channel_id()) => {
                    self.deliver_local(event);
                }
                Ok(_) => warn!(channel = %message.channel, "Voice event published on the wrong channel"),
                Err(e) => warn!(channel = %message.channel, error = %e, "Ignoring malformed voice event"),
            }
        }

        let _ = subscriber.quit().await;
        Ok(())
    }
}

/// Parse the channel id out of a voice pub/sub channel name.
pub fn channel_from_topic(topic: &str) -> Option<Uuid> {
    topic
        .strip_prefix(channels::PREFIX)
        .and_then(|id| Uuid::parse_str(id).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participants(channel_id: Uuid, n: usize) -> VoiceEvent {
        VoiceEvent::ChannelParticipants {
            planet_id: None,
            channel_id,
            user_ids: (0..n).map(|_| Uuid::new_v4()).collect(),
        }
    }

    #[tokio::test]
    async fn test_local_hub_delivers_in_order() {
        let hub = NotificationHub::local();
        let mut rx = hub.subscribe();
        let channel_id = Uuid::new_v4();

        for n in 0..3 {
            hub.publish(participants(channel_id, n)).await;
        }

        for n in 0..3 {
            match rx.recv().await.unwrap() {
                VoiceEvent::ChannelParticipants { user_ids, .. } => assert_eq!(user_ids.len(), n),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let hub = NotificationHub::local();
        hub.publish(participants(Uuid::new_v4(), 1)).await;
    }

    #[test]
    fn test_local_hub_has_no_relay() {
        let hub = std::sync::Arc::new(NotificationHub::local());
        assert!(hub.spawn_relay(CancellationToken::new()).is_none());
    }

    #[test]
    fn test_channel_topic_round_trip() {
        let id = Uuid::new_v4();
        assert_eq!(channel_from_topic(&channels::voice_channel(id)), Some(id));
        assert_eq!(channel_from_topic("channel:abc"), None);
    }
}
