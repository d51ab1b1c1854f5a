//! Auto-responder service: configuration lookup, history, provider call

use std::sync::Arc;

use tracing::debug;

use super::{AiProviderError, ChatMessage, ChatRole, ProviderFactory};
use crate::storage::{AiConfig, AiProviderKind, Conversation, CrmStore, Direction, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum AiBotError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Provider error: {0}")]
    Provider(#[from] AiProviderError),
}

/// What the bot decided for a conversation
#[derive(Debug, Clone, PartialEq)]
pub enum AiOutcome {
    /// No config, disabled, or no api key
    Disabled,
    /// Nothing to answer
    NoHistory,
    Reply {
        text: String,
        provider: AiProviderKind,
    },
}

#[derive(Clone)]
pub struct AiBotService {
    store: Arc<CrmStore>,
    factory: Arc<dyn ProviderFactory>,
}

impl AiBotService {
    pub fn new(store: Arc<CrmStore>, factory: Arc<dyn ProviderFactory>) -> Self {
        Self { store, factory }
    }

    /// Active configuration for the conversation's account, if the bot is on
    pub fn active_config(&self, conversation: &Conversation) -> Result<Option<AiConfig>, AiBotError> {
        let config = self.store.get_ai_config_for_account(&conversation.account_id)?;
        Ok(config.filter(|c| c.enabled && !c.api_key.is_empty()))
    }

    /// Last `limit` text messages as provider history.
    ///
    /// Incoming messages are `user` turns, outgoing ones `model` turns.
    pub fn history(&self, conversation_id: &str, limit: u32) -> Result<Vec<ChatMessage>, AiBotError> {
        let messages = self.store.recent_text_messages(conversation_id, limit)?;
        Ok(messages
            .into_iter()
            .filter_map(|m| {
                let body = m.body.filter(|b| !b.is_empty())?;
                let role = match m.direction {
                    Direction::Incoming => ChatRole::User,
                    Direction::Outgoing => ChatRole::Model,
                };
                Some(ChatMessage::new(role, body))
            })
            .collect())
    }

    /// Generate a reply for the conversation when the bot is enabled
    pub async fn generate_reply(&self, conversation: &Conversation) -> Result<AiOutcome, AiBotError> {
        let Some(config) = self.active_config(conversation)? else {
            return Ok(AiOutcome::Disabled);
        };

        let history = self.history(&conversation.id, config.max_history_messages)?;
        if history.is_empty() {
            return Ok(AiOutcome::NoHistory);
        }

        let provider = self.factory.create(&config)?;
        debug!(
            "Generating {} reply for conversation {} from {} turns",
            config.provider,
            conversation.id,
            history.len()
        );
        let text = provider.generate_response(&history).await?;

        Ok(AiOutcome::Reply {
            text,
            provider: config.provider,
        })
    }
}
