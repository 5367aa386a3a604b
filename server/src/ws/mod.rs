//! WebSocket Handler
//!
//! Pushes voice notifications of subscribed channels to clients.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vc_common::{ClientMessage, ServerMessage, VoiceEvent};

use crate::api::AppState;

/// Outbound buffer per connection.
const OUTBOUND_CAPACITY: usize = 100;

/// WebSocket connection query params.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// JWT access token for authentication
    pub token: String,
}

/// WebSocket upgrade handler.
///
/// GET /ws?token=...
pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    // Validate token before upgrade
    let user_id = match state.jwt.verify_access(&query.token) {
        Ok(user_id) => user_id,
        Err(_) => return (StatusCode::UNAUTHORIZED, "Invalid token").into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

/// Handle WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState, user_id: Uuid) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);
    let subscribed: Arc<RwLock<HashSet<Uuid>>> = Arc::new(RwLock::new(HashSet::new()));

    info!(user_id = %user_id, "WebSocket connected");
    let _ = tx.send(ServerMessage::Ready { user_id }).await;

    // Forward hub events for subscribed channels
    let events = state.voice.hub().subscribe();
    let forward_handle = tokio::spawn(forward_events(events, tx.clone(), subscribed.clone()));

    // Serialize outbound messages onto the socket
    let sender_handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Failed to serialize server message");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_client_message(text.as_str(), user_id, &state, &tx, &subscribed).await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    forward_handle.abort();
    sender_handle.abort();
    info!(user_id = %user_id, "WebSocket disconnected");
}

/// Handle a client message.
async fn handle_client_message(
    text: &str,
    user_id: Uuid,
    state: &AppState,
    tx: &mpsc::Sender<ServerMessage>,
    subscribed: &RwLock<HashSet<Uuid>>,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            let _ = tx
                .send(ServerMessage::Error {
                    code: "invalid_message".to_string(),
                    message: e.to_string(),
                })
                .await;
            return;
        }
    };

    match message {
        ClientMessage::Ping => {
            let _ = tx.send(ServerMessage::Pong).await;
        }

        ClientMessage::Subscribe { channel_id } => {
            // Subscribing requires the right to join; the answer doubles as
            // the initial membership snapshot.
            match state.voice.participants(user_id, channel_id).await {
                Ok(snapshot) => {
                    subscribed.write().await.insert(channel_id);
                    let _ = tx.send(ServerMessage::Subscribed { channel_id }).await;
                    let _ = tx
                        .send(ServerMessage::Event {
                            event: VoiceEvent::ChannelParticipants {
                                planet_id: snapshot.planet_id,
                                channel_id,
                                user_ids: snapshot.user_ids,
                            },
                        })
                        .await;
                    debug!(user_id = %user_id, channel_id = %channel_id, "Subscribed to voice channel");
                }
                Err(e) => {
                    let _ = tx
                        .send(ServerMessage::Error {
                            code: "subscribe_failed".to_string(),
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        }

        ClientMessage::Unsubscribe { channel_id } => {
            subscribed.write().await.remove(&channel_id);
            let _ = tx.send(ServerMessage::Unsubscribed { channel_id }).await;
        }
    }
}

/// Relay hub events of subscribed channels into the connection's outbox.
async fn forward_events(
    mut events: broadcast::Receiver<VoiceEvent>,
    tx: mpsc::Sender<ServerMessage>,
    subscribed: Arc<RwLock<HashSet<Uuid>>>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "WebSocket connection lagged behind voice events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if !subscribed.read().await.contains(&event.channel_id()) {
            continue;
        }
        if tx.send(ServerMessage::Event { event }).await.is_err() {
            break;
        }
    }
}
