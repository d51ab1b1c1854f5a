//! WhatsApp Business CRM backend
//!
//! Manages WhatsApp Business accounts, their contacts and conversations,
//! ingests Meta webhooks, and answers customers through an optional AI
//! auto-responder.
//!
//! # Architecture
//!
//! ```text
//! Meta Cloud API ──webhook──▶ API (axum) ──enqueue──▶ Task queue ──▶ Workers
//!                               │                                     │
//!        Inbox UI ◀──WebSocket──┤◀──────────── InboxHub ◀─────────────┤
//!                               │                                     │
//!                               └──────────── SQLite store ◀──────────┘
//!                                                                     │
//!                                             Graph API / Gemini ◀────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! export ENCRYPTION_KEY=$(openssl rand -base64 32)
//! export PUBLIC_BASE_URL=https://crm.example.com   # for outgoing media links
//! export META_APP_SECRET=...                        # optional webhook signatures
//!
//! wa-crm
//! ```
//!
//! The inbox feed is available at `/ws/chat/inbox/?token=<access token>`:
//!
//! ```json
//! {"type": "connection_established", "message": "Connected to inbox updates"}
//! {"type": "new_message", "message": {...}}
//! {"type": "conversation_update", "conversation": {...}}
//! {"type": "status_update", "status_update": {...}}
//! ```

pub mod ai;
pub mod api;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod media;
pub mod pipeline;
pub mod queue;
pub mod realtime;
pub mod storage;
pub mod templates;
pub mod types;
pub mod whatsapp_api;

pub use config::CrmConfig;
pub use crypto::FieldCipher;
pub use storage::CrmStore;

/// Prelude for common imports
pub mod prelude {
    pub use crate::api::AppState;
    pub use crate::config::CrmConfig;
    pub use crate::pipeline::Pipeline;
    pub use crate::queue::{Task, TaskQueue};
    pub use crate::realtime::InboxHub;
    pub use crate::storage::CrmStore;
    pub use crate::types::*;
}
