//! AI auto-responder
//!
//! Providers generate a reply from a conversation history; the service
//! decides whether the bot is active for an account and builds the history.

mod gemini;
mod service;

use async_trait::async_trait;
use serde::Serialize;

use crate::storage::{AiConfig, AiProviderKind};

pub use gemini::GeminiProvider;
pub use service::{AiBotError, AiBotService, AiOutcome};

#[cfg(test)]
pub(crate) use service::test_support;

/// Speaker of a history turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// The contact
    User,
    /// The business (bot or agent)
    Model,
}

/// One turn of conversation history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AiProviderError {
    #[error("[{provider}] Request timeout")]
    Timeout { provider: &'static str },

    #[error("[{provider}] Request failed: {message}")]
    Request {
        provider: &'static str,
        message: String,
    },

    #[error("[{provider}] API returned {status}: {detail}")]
    Api {
        provider: &'static str,
        status: u16,
        detail: String,
    },

    #[error("[{provider}] Empty response")]
    EmptyResponse { provider: &'static str },

    #[error("Unsupported provider: {0}")]
    Unsupported(String),
}

/// A text-generation backend
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Generate the next `model` turn for `history`
    async fn generate_response(&self, history: &[ChatMessage]) -> Result<String, AiProviderError>;
}

/// Builds providers from stored configuration
pub trait ProviderFactory: Send + Sync {
    fn create(&self, config: &AiConfig) -> Result<Box<dyn AiProvider>, AiProviderError>;
}

/// Factory for the real HTTP providers
#[derive(Debug, Clone, Default)]
pub struct DefaultProviderFactory;

impl ProviderFactory for DefaultProviderFactory {
    fn create(&self, config: &AiConfig) -> Result<Box<dyn AiProvider>, AiProviderError> {
        match config.provider {
            AiProviderKind::Gemini => Ok(Box::new(GeminiProvider::new(
                &config.api_key,
                &config.system_prompt,
            ))),
        }
    }
}

/// Entry of the provider catalogue exposed to clients
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub id: &'static str,
    pub name: &'static str,
}

/// Supported providers
pub fn providers() -> Vec<ProviderInfo> {
    AiProviderKind::ALL
        .iter()
        .map(|kind| ProviderInfo {
            id: kind.as_str(),
            name: kind.display_name(),
        })
        .collect()
}
