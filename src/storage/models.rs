//! Database models for the CRM

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declares a closed set of string labels stored as TEXT columns
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $label:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $label)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok($name::$variant),)+
                    other => Err(format!("invalid {}: {}", stringify!($name), other)),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

string_enum! {
    /// Connection state of a WhatsApp Business account
    pub enum AccountStatus {
        Active => "active",
        Disconnected => "disconnected",
    }
}

string_enum! {
    pub enum TemplateCategory {
        Marketing => "MARKETING",
        Utility => "UTILITY",
        Authentication => "AUTHENTICATION",
    }
}

string_enum! {
    /// Meta review state of a template
    pub enum TemplateStatus {
        Approved => "APPROVED",
        Rejected => "REJECTED",
        Pending => "PENDING",
    }
}

string_enum! {
    pub enum ConversationStatus {
        Open => "open",
        Resolved => "resolved",
        Pending => "pending",
    }
}

string_enum! {
    pub enum Direction {
        Incoming => "incoming",
        Outgoing => "outgoing",
    }
}

string_enum! {
    pub enum MessageType {
        Text => "text",
        Image => "image",
        Video => "video",
        Audio => "audio",
        Document => "document",
        Template => "template",
        Interactive => "interactive",
        Sticker => "sticker",
        Location => "location",
        Contacts => "contacts",
    }
}

string_enum! {
    pub enum DeliveryStatus {
        Sent => "sent",
        Delivered => "delivered",
        Read => "read",
        Failed => "failed",
    }
}

string_enum! {
    pub enum AiProviderKind {
        Gemini => "gemini",
    }
}

impl AiProviderKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            AiProviderKind::Gemini => "Google Gemini",
        }
    }
}

impl MessageType {
    /// Types whose payload is a downloadable/linkable file
    pub fn is_media(&self) -> bool {
        matches!(
            self,
            MessageType::Image
                | MessageType::Video
                | MessageType::Audio
                | MessageType::Document
                | MessageType::Sticker
        )
    }
}

impl DeliveryStatus {
    fn rank(&self) -> u8 {
        match self {
            DeliveryStatus::Sent => 1,
            DeliveryStatus::Delivered => 2,
            DeliveryStatus::Read => 3,
            DeliveryStatus::Failed => 0,
        }
    }

    /// Whether a status update may move a message from `self` to `next`.
    ///
    /// Statuses only move forward (sent -> delivered -> read); `failed` is
    /// terminal and cannot follow `read`.
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        match (self, next) {
            (DeliveryStatus::Failed, _) => false,
            (DeliveryStatus::Read, DeliveryStatus::Failed) => false,
            (_, DeliveryStatus::Failed) => true,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

/// Application user
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip)]
    pub is_superuser: bool,
    pub date_joined: DateTime<Utc>,
}

/// Kind of opaque auth token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

/// WhatsApp Business account. Tokens are held decrypted in memory.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub owner_id: Option<i64>,
    pub name: String,
    pub phone_number_id: String,
    pub business_account_id: String,
    pub access_token: String,
    pub webhook_verify_token: String,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub owner_id: Option<i64>,
    pub name: String,
    pub phone_number_id: String,
    pub business_account_id: String,
    pub access_token: String,
    pub webhook_verify_token: String,
    pub status: AccountStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountPatch {
    pub name: Option<String>,
    pub phone_number_id: Option<String>,
    pub business_account_id: Option<String>,
    pub access_token: Option<String>,
    pub webhook_verify_token: Option<String>,
    pub status: Option<AccountStatus>,
}

/// Message template approved (or pending) at Meta
#[derive(Debug, Clone, Serialize)]
pub struct Template {
    pub id: String,
    pub account: String,
    pub name: String,
    pub language: String,
    pub category: TemplateCategory,
    pub status: TemplateStatus,
    pub components: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTemplate {
    pub account_id: String,
    pub name: String,
    pub language: String,
    pub category: TemplateCategory,
    pub status: TemplateStatus,
    pub components: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplatePatch {
    pub name: Option<String>,
    pub language: Option<String>,
    pub category: Option<TemplateCategory>,
    pub status: Option<TemplateStatus>,
    pub components: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateFilter {
    pub account: Option<String>,
    pub category: Option<TemplateCategory>,
    pub status: Option<TemplateStatus>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Contact {
    pub id: String,
    pub account: String,
    pub phone_number: String,
    pub name: String,
    pub profile_picture_url: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewContact {
    pub account_id: String,
    pub phone_number: String,
    pub name: String,
    pub profile_picture_url: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactPatch {
    pub phone_number: Option<String>,
    pub name: Option<String>,
    pub profile_picture_url: Option<String>,
    pub metadata: Option<Value>,
}

/// Contact row as listed, with computed columns
#[derive(Debug, Clone, Serialize)]
pub struct ContactListing {
    #[serde(flatten)]
    pub contact: Contact,
    pub account_name: String,
    pub conversations_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ContactFilter {
    pub account: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub account_id: String,
    pub contact_id: String,
    pub status: ConversationStatus,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Compact contact representation embedded in conversations
#[derive(Debug, Clone, Serialize)]
pub struct ContactSummary {
    pub id: String,
    pub name: String,
    pub phone_number: String,
    pub profile_picture_url: Option<String>,
}

/// Conversation joined with its contact, account and message aggregates
#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub contact: ContactSummary,
    pub account_name: String,
    pub owner_id: Option<i64>,
    pub unread_count: i64,
    pub last_message_type: Option<MessageType>,
    pub last_message_body: Option<String>,
    pub last_incoming_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub status: Option<ConversationStatus>,
    pub account: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub whatsapp_id: String,
    pub direction: Direction,
    pub message_type: MessageType,
    pub body: Option<String>,
    pub media_url: Option<String>,
    pub metadata: Value,
    pub delivery_status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub whatsapp_id: String,
    pub direction: Direction,
    pub message_type: MessageType,
    pub body: Option<String>,
    pub media_url: Option<String>,
    pub metadata: Value,
    pub delivery_status: DeliveryStatus,
}

impl NewMessage {
    /// Outgoing message with a locally generated placeholder id
    pub fn outgoing(
        conversation_id: &str,
        id_prefix: &str,
        message_type: MessageType,
        body: Option<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            whatsapp_id: format!("{}{}", id_prefix, uuid::Uuid::new_v4().simple()),
            direction: Direction::Outgoing,
            message_type,
            body,
            media_url: None,
            metadata: Value::Object(Default::default()),
            delivery_status: DeliveryStatus::Sent,
        }
    }
}

/// Per-account AI auto-responder configuration. `api_key` is decrypted.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub id: String,
    pub account_id: String,
    pub enabled: bool,
    pub provider: AiProviderKind,
    pub api_key: String,
    pub system_prompt: String,
    pub max_history_messages: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAiConfig {
    pub account_id: String,
    pub enabled: bool,
    pub provider: AiProviderKind,
    pub api_key: String,
    pub system_prompt: String,
    pub max_history_messages: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AiConfigPatch {
    pub account: Option<String>,
    pub enabled: Option<bool>,
    pub provider: Option<AiProviderKind>,
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
    pub max_history_messages: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct AiConfigFilter {
    pub account: Option<String>,
    pub enabled: Option<bool>,
    pub provider: Option<AiProviderKind>,
}
