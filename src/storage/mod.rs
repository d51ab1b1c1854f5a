//! Storage module for the CRM
//!
//! Provides SQLite-based persistence for:
//! - Users and opaque auth tokens
//! - WhatsApp Business accounts and their templates
//! - Contacts, conversations and messages
//! - Per-account AI auto-responder settings

mod accounts;
mod ai_configs;
mod contacts;
mod conversations;
mod messages;
pub mod models;
mod sqlite;
mod users;

pub use messages::StatusChange;
pub use models::*;
pub use sqlite::{CrmStore, StorageError, StorageResult};

#[cfg(test)]
pub(crate) use sqlite::test_support;
