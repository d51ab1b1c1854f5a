//! Wire types for Meta webhooks and the inbox WebSocket feed

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Webhook verification (GET)
// =============================================================================

/// Meta webhook subscription handshake parameters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

// =============================================================================
// Webhook notifications (POST)
// =============================================================================

/// Top-level webhook notification body
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub value: ChangeValue,
}

/// Body of a `messages` field change.
///
/// Messages and statuses stay raw so they can be stored verbatim.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub contacts: Vec<WebhookContact>,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub statuses: Vec<Value>,
}

impl ChangeValue {
    /// Profile name WhatsApp reports for a sender
    pub fn profile_name(&self, wa_id: &str) -> Option<String> {
        self.contacts
            .iter()
            .find(|c| c.wa_id.as_deref() == Some(wa_id))
            .or_else(|| self.contacts.first())
            .and_then(|c| c.profile.as_ref())
            .and_then(|p| p.name.clone())
            .filter(|name| !name.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebhookContact {
    #[serde(default)]
    pub wa_id: Option<String>,
    #[serde(default)]
    pub profile: Option<ContactProfile>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ContactProfile {
    #[serde(default)]
    pub name: Option<String>,
}

/// Incoming WhatsApp message, the fields the CRM reads
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub from: String,
    #[serde(rename = "type", default = "default_message_type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<TextContent>,
    #[serde(default)]
    pub image: Option<MediaContent>,
    #[serde(default)]
    pub video: Option<MediaContent>,
    #[serde(default)]
    pub audio: Option<MediaContent>,
    #[serde(default)]
    pub document: Option<MediaContent>,
    #[serde(default)]
    pub sticker: Option<MediaContent>,
    #[serde(default)]
    pub interactive: Option<InteractiveContent>,
    #[serde(default)]
    pub button: Option<ButtonContent>,
    #[serde(default)]
    pub location: Option<LocationContent>,
}

fn default_message_type() -> String {
    "text".to_string()
}

impl InboundMessage {
    /// Media object for media message types
    pub fn media(&self) -> Option<&MediaContent> {
        match self.kind.as_str() {
            "image" => self.image.as_ref(),
            "video" => self.video.as_ref(),
            "audio" => self.audio.as_ref(),
            "document" => self.document.as_ref(),
            "sticker" => self.sticker.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TextContent {
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaContent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InteractiveContent {
    #[serde(default)]
    pub button_reply: Option<ReplyOption>,
    #[serde(default)]
    pub list_reply: Option<ReplyOption>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplyOption {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// Quick-reply button press on a template
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ButtonContent {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocationContent {
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

/// Delivery status notification for an outgoing message
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusNotification {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub errors: Vec<Value>,
}

// =============================================================================
// Inbox WebSocket protocol
// =============================================================================

/// Events pushed to inbox WebSocket clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    /// Greeting sent right after the upgrade
    ConnectionEstablished { message: String },
    /// A message was stored (incoming or outgoing)
    NewMessage { message: Value },
    /// Conversation list entry changed
    ConversationUpdate { conversation: Value },
    /// Delivery status of a message changed
    StatusUpdate { status_update: Value },
    /// Heartbeat response
    Pong,
}

/// Messages accepted from inbox clients
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    Ping,
}
