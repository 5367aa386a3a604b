//! Notification WebSocket
//!
//! Keeps a WebSocket to the presence server open, reconnecting with
//! exponential backoff, re-subscribing to the channels of interest and
//! forwarding voice events to local subscribers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;
use vc_common::{ClientMessage, ServerMessage, VoiceEvent};

/// Connection state of the notification socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Invalid server URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Unsupported URL scheme: {0}")]
    Scheme(String),

    #[error("Notification socket is shut down")]
    Closed,
}

/// Reconnect delays: doubles per attempt up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt `attempt` (starting at 1).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.clamp(1, 5) - 1;
        self.initial.saturating_mul(1 << exponent).min(self.max)
    }
}

/// Handle to the background connection.
pub struct NotificationSocket {
    tx: mpsc::Sender<ClientMessage>,
    status: Arc<RwLock<ConnectionStatus>>,
    subscriptions: Arc<RwLock<HashSet<Uuid>>>,
    events: broadcast::Sender<VoiceEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl NotificationSocket {
    /// Connect to `server_url` (http/https/ws/wss) with default backoff.
    pub fn connect(server_url: &str, token: &str) -> Result<Self, SocketError> {
        Self::connect_with(server_url, token, Backoff::default())
    }

    pub fn connect_with(
        server_url: &str,
        token: &str,
        backoff: Backoff,
    ) -> Result<Self, SocketError> {
        let ws_url = build_ws_url(server_url, token)?;
        let (tx, rx) = mpsc::channel(100);
        let (events, _) = broadcast::channel(256);
        let status = Arc::new(RwLock::new(ConnectionStatus::Disconnected));
        let subscriptions = Arc::new(RwLock::new(HashSet::new()));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(connection_loop(
            ws_url,
            backoff,
            rx,
            events.clone(),
            status.clone(),
            subscriptions.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            tx,
            status,
            subscriptions,
            events,
            cancel,
            task,
        })
    }

    /// Voice events of subscribed channels.
    pub fn events(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    pub async fn status(&self) -> ConnectionStatus {
        *self.status.read().await
    }

    /// Receive events for `channel_id`, now and after every reconnect.
    pub async fn subscribe_channel(&self, channel_id: Uuid) -> Result<(), SocketError> {
        self.subscriptions.write().await.insert(channel_id);
        self.send(ClientMessage::Subscribe { channel_id }).await
    }

    pub async fn unsubscribe_channel(&self, channel_id: Uuid) -> Result<(), SocketError> {
        self.subscriptions.write().await.remove(&channel_id);
        self.send(ClientMessage::Unsubscribe { channel_id }).await
    }

    async fn send(&self, message: ClientMessage) -> Result<(), SocketError> {
        self.tx.send(message).await.map_err(|_| SocketError::Closed)
    }

    /// Close the connection and stop reconnecting.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Notification socket task failed: {}", e);
        }
    }
}

/// Main connection loop with reconnection logic.
async fn connection_loop(
    ws_url: Url,
    backoff: Backoff,
    mut outbox: mpsc::Receiver<ClientMessage>,
    events: broadcast::Sender<VoiceEvent>,
    status: Arc<RwLock<ConnectionStatus>>,
    subscriptions: Arc<RwLock<HashSet<Uuid>>>,
    cancel: CancellationToken,
) {
    let mut attempt = 0u32;

    loop {
        *status.write().await = if attempt > 0 {
            ConnectionStatus::Reconnecting { attempt }
        } else {
            ConnectionStatus::Connecting
        };
        info!(url = %redacted(&ws_url), attempt, "Connecting notification socket");

        let connected = tokio::select! {
            () = cancel.cancelled() => break,
            result = connect_async(ws_url.as_str()) => result,
        };

        match connected {
            Ok((ws_stream, _)) => {
                info!("Notification socket connected");
                attempt = 0;
                *status.write().await = ConnectionStatus::Connected;

                let (mut write, mut read) = ws_stream.split();

                let channels: Vec<Uuid> = subscriptions.read().await.iter().copied().collect();
                let mut resubscribed = true;
                for channel_id in channels {
                    let message = ClientMessage::Subscribe { channel_id };
                    if let Err(e) = send_message(&mut write, &message).await {
                        error!("Failed to re-subscribe: {}", e);
                        resubscribed = false;
                        break;
                    }
                }

                while resubscribed {
                    tokio::select! {
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => handle_server_message(&events, &text),
                                Some(Ok(Message::Ping(data))) => {
                                    if let Err(e) = write.send(Message::Pong(data)).await {
                                        warn!("Failed to send pong: {}", e);
                                    }
                                }
                                Some(Ok(Message::Close(_))) => {
                                    info!("Server closed connection");
                                    break;
                                }
                                Some(Err(e)) => {
                                    error!("WebSocket error: {}", e);
                                    break;
                                }
                                None => {
                                    info!("WebSocket stream ended");
                                    break;
                                }
                                Some(Ok(_)) => {}
                            }
                        }

                        message = outbox.recv() => {
                            let Some(message) = message else {
                                info!("Outbox closed");
                                let _ = write.send(Message::Close(None)).await;
                                *status.write().await = ConnectionStatus::Disconnected;
                                return;
                            };
                            if let Err(e) = send_message(&mut write, &message).await {
                                error!("Failed to send message: {}", e);
                                break;
                            }
                        }

                        () = cancel.cancelled() => {
                            info!("Shutdown received during connection");
                            let _ = write.send(Message::Close(None)).await;
                            *status.write().await = ConnectionStatus::Disconnected;
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                error!("Failed to connect: {}", e);
            }
        }

        *status.write().await = ConnectionStatus::Disconnected;

        attempt += 1;
        let delay = backoff.delay(attempt);
        info!("Reconnecting in {:?} (attempt {})", delay, attempt);

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => break,
        }
    }

    *status.write().await = ConnectionStatus::Disconnected;
}

async fn send_message<S>(write: &mut S, message: &ClientMessage) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(message).map_err(|e| e.to_string())?;
    debug!("Sending: {}", json);
    write
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| e.to_string())
}

/// Build the WebSocket URL with authentication token.
fn build_ws_url(server_url: &str, token: &str) -> Result<Url, SocketError> {
    let mut url = Url::parse(server_url)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(SocketError::Scheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|()| SocketError::Scheme(scheme.to_string()))?;
    url.set_path("/ws");
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

/// URL without the token, for logs.
fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

/// Handle a message from the server.
fn handle_server_message(events: &broadcast::Sender<VoiceEvent>, text: &str) {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(ServerMessage::Event { event }) => {
            debug!(channel_id = %event.channel_id(), "Voice event received");
            let _ = events.send(event);
        }
        Ok(ServerMessage::Error { code, message }) => {
            warn!(code = %code, "Server rejected request: {}", message);
        }
        Ok(other) => debug!("Received: {:?}", other),
        Err(e) => warn!("Failed to parse server message: {} - {}", e, text),
    }
}
