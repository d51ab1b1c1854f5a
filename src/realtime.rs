//! Inbox feed: broadcast hub and WebSocket endpoint
//!
//! Pipeline and API code publish [`WsEvent`]s tagged with the owner of the
//! account they concern; each socket forwards only the events its user may see.

use axum::{
    extract::{
        Query, State,
        ws::{Message as WsFrame, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::AppState;
use crate::error::ApiError;
use crate::storage::{
    ConversationSummary, CrmStore, Direction, Message, MessageType, StorageResult, User,
};
use crate::types::{WsClientMessage, WsEvent};

const CHANNEL_CAPACITY: usize = 256;

const FREE_MESSAGE_WINDOW_HOURS: i64 = 24;

const LAST_MESSAGE_PREVIEW_CHARS: usize = 100;

// =============================================================================
// Payloads
// =============================================================================

/// REST/feed representation of a message
pub fn message_json(message: &Message) -> Value {
    json!({
        "id": message.id,
        "body": message.body,
        "message_type": message.message_type,
        "direction": message.direction,
        "delivery_status": message.delivery_status,
        "created_at": message.created_at,
        "media_url": message.media_url,
        "is_from_me": message.direction == Direction::Outgoing,
        "metadata": message.metadata,
    })
}

/// Preview of the newest message: text truncated, other types as `[TYPE]`
fn last_message_preview(summary: &ConversationSummary) -> Option<String> {
    match summary.last_message_type? {
        MessageType::Text => summary
            .last_message_body
            .as_deref()
            .filter(|b| !b.is_empty())
            .map(|b| b.chars().take(LAST_MESSAGE_PREVIEW_CHARS).collect()),
        other => Some(format!("[{}]", other.as_str().to_uppercase())),
    }
}

fn can_send_free_message(summary: &ConversationSummary, now: DateTime<Utc>) -> bool {
    summary
        .last_incoming_message_at
        .is_some_and(|at| now < at + Duration::hours(FREE_MESSAGE_WINDOW_HOURS))
}

fn conversation_base(summary: &ConversationSummary, now: DateTime<Utc>) -> Value {
    let conversation = &summary.conversation;
    json!({
        "id": conversation.id,
        "contact": summary.contact,
        "account_name": summary.account_name,
        "account_id": conversation.account_id,
        "status": conversation.status,
        "last_message_at": conversation.last_message_at,
        "can_send_free_message": can_send_free_message(summary, now),
        "last_incoming_message_at": summary.last_incoming_message_at,
        "created_at": conversation.created_at,
    })
}

/// Conversation list entry
pub fn conversation_json(summary: &ConversationSummary, now: DateTime<Utc>) -> Value {
    let mut value = conversation_base(summary, now);
    value["last_message"] = json!(last_message_preview(summary));
    value["unread_count"] = json!(summary.unread_count);
    value
}

/// Single conversation view
pub fn conversation_detail_json(summary: &ConversationSummary, now: DateTime<Utc>) -> Value {
    let mut value = conversation_base(summary, now);
    value["updated_at"] = json!(summary.conversation.updated_at);
    value
}

fn status_update_json(message: &Message) -> Value {
    json!({
        "message_id": message.id,
        "whatsapp_id": message.whatsapp_id,
        "conversation_id": message.conversation_id,
        "status": message.delivery_status,
    })
}

// =============================================================================
// Hub
// =============================================================================

/// Event plus the owner of the account it belongs to
#[derive(Debug, Clone)]
pub struct InboxEvent {
    pub owner_id: Option<i64>,
    pub event: WsEvent,
}

impl InboxEvent {
    /// Superusers see every account; others only their own
    pub fn visible_to(&self, user: &User) -> bool {
        user.is_superuser || self.owner_id == Some(user.id)
    }
}

/// Fan-out point for inbox events
#[derive(Clone)]
pub struct InboxHub {
    tx: broadcast::Sender<InboxEvent>,
    /// Open sockets: connection id -> user id
    connections: Arc<DashMap<Uuid, i64>>,
}

impl Default for InboxHub {
    fn default() -> Self {
        Self::new()
    }
}

impl InboxHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            connections: Arc::new(DashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboxEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; returns the number of live subscribers
    pub fn publish(&self, owner_id: Option<i64>, event: WsEvent) -> usize {
        // no subscribers is not an error
        self.tx.send(InboxEvent { owner_id, event }).unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Push `new_message` for a stored message
    pub fn notify_new_message(&self, store: &CrmStore, message: &Message) -> StorageResult<()> {
        let Some(summary) = store.conversation_summary(&message.conversation_id)? else {
            return Ok(());
        };

        let mut payload = message_json(message);
        payload["conversation_id"] = json!(message.conversation_id);
        payload["contact_name"] = json!(summary.contact.name);
        payload["contact_phone"] = json!(summary.contact.phone_number);

        self.publish(summary.owner_id, WsEvent::NewMessage { message: payload });
        Ok(())
    }

    /// Push `conversation_update` with the current list entry
    pub fn notify_conversation(&self, store: &CrmStore, conversation_id: &str) -> StorageResult<()> {
        let Some(summary) = store.conversation_summary(conversation_id)? else {
            return Ok(());
        };
        self.publish(
            summary.owner_id,
            WsEvent::ConversationUpdate {
                conversation: conversation_json(&summary, Utc::now()),
            },
        );
        Ok(())
    }

    /// Push `new_message` followed by the refreshed `conversation_update`
    pub fn notify_message_activity(&self, store: &CrmStore, message: &Message) {
        if let Err(e) = self.notify_new_message(store, message) {
            warn!("Failed to push new message {}: {}", message.id, e);
        }
        if let Err(e) = self.notify_conversation(store, &message.conversation_id) {
            warn!(
                "Failed to push conversation {}: {}",
                message.conversation_id, e
            );
        }
    }

    /// Push `status_update` for a message
    pub fn notify_status(&self, store: &CrmStore, message: &Message) -> StorageResult<()> {
        let Some(summary) = store.conversation_summary(&message.conversation_id)? else {
            return Ok(());
        };
        self.publish(
            summary.owner_id,
            WsEvent::StatusUpdate {
                status_update: status_update_json(message),
            },
        );
        Ok(())
    }
}

// =============================================================================
// WebSocket endpoint
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SocketParams {
    #[serde(default)]
    token: Option<String>,
}

/// `GET /ws/chat/inbox/?token=<access>`
pub async fn inbox_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<SocketParams>,
) -> Result<Response, ApiError> {
    let token = params.token.filter(|t| !t.is_empty()).ok_or(ApiError::Unauthorized)?;
    let user = state.auth.authenticate(&token)?;

    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub, user)))
}

async fn handle_socket(socket: WebSocket, hub: InboxHub, user: User) {
    let connection_id = Uuid::new_v4();
    hub.connections.insert(connection_id, user.id);
    info!("Inbox client {} connected (user {})", connection_id, user.username);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsEvent>(32);
    let mut events = hub.subscribe();

    // Writer
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize inbox event: {}", e);
                    continue;
                }
            };
            if ws_tx.send(WsFrame::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let _ = tx
        .send(WsEvent::ConnectionEstablished {
            message: "Connected to inbox updates".to_string(),
        })
        .await;

    // Broadcast -> this socket
    let forward_tx = tx.clone();
    let forward_user = user.clone();
    let forward_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if !event.visible_to(&forward_user) {
                        continue;
                    }
                    if forward_tx.send(event.event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Inbox client lagging, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(WsFrame::Text(text)) => match serde_json::from_str::<WsClientMessage>(&text) {
                Ok(WsClientMessage::Ping) => {
                    let _ = tx.send(WsEvent::Pong).await;
                }
                Err(_) => debug!("Ignoring inbox client message"),
            },
            Ok(WsFrame::Close(_)) => {
                debug!("Inbox client {} closed connection", connection_id);
                break;
            }
            Err(e) => {
                warn!("Inbox WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    hub.connections.remove(&connection_id);
    forward_task.abort();
    send_task.abort();
    info!("Inbox client {} disconnected", connection_id);
}
