//! WhatsApp Cloud API client (Meta Graph API)
//!
//! Handles:
//! - Outbound messages (text, media by link, templates)
//! - Template catalogue listing for template sync
//! - Media download for incoming attachments

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::storage::MessageType;

/// Upper bound on `paging.next` hops when listing templates
const MAX_TEMPLATE_PAGES: usize = 50;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GraphApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Graph API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Graph API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unexpected Graph API response: {0}")]
    InvalidResponse(String),
}

/// Graph error envelope `{"error": {"message", "code"}}`
#[derive(Debug, Deserialize)]
struct GraphErrorEnvelope {
    error: GraphErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GraphErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i64,
}

// =============================================================================
// Request / response types
// =============================================================================

/// Message body to deliver to a contact
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Text {
        body: String,
    },
    /// Media fetched by Meta from a public link
    Media {
        kind: MessageType,
        link: String,
        caption: Option<String>,
    },
    Template {
        name: String,
        language: String,
        components: Value,
    },
}

impl OutboundMessage {
    /// JSON body for `POST /{phone_number_id}/messages`
    pub fn to_payload(&self, to: &str) -> Value {
        let mut payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
        });

        match self {
            OutboundMessage::Text { body } => {
                payload["type"] = json!("text");
                payload["text"] = json!({ "preview_url": false, "body": body });
            }
            OutboundMessage::Media {
                kind,
                link,
                caption,
            } => {
                let mut media = json!({ "link": link });
                // audio and stickers reject captions
                let captionable = !matches!(kind, MessageType::Audio | MessageType::Sticker);
                if captionable
                    && let Some(caption) = caption.as_deref().filter(|c| !c.is_empty())
                {
                    media["caption"] = json!(caption);
                }
                payload["type"] = json!(kind.as_str());
                payload[kind.as_str()] = media;
            }
            OutboundMessage::Template {
                name,
                language,
                components,
            } => {
                let mut template = json!({
                    "name": name,
                    "language": { "code": language },
                });
                let has_components = components.as_array().is_some_and(|c| !c.is_empty());
                if has_components {
                    template["components"] = components.clone();
                }
                payload["type"] = json!("template");
                payload["template"] = template;
            }
        }

        payload
    }
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    #[serde(default)]
    messages: Vec<SentMessageId>,
}

#[derive(Debug, Deserialize)]
struct SentMessageId {
    id: String,
}

/// Template definition as returned by `GET /{waba_id}/message_templates`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaTemplate {
    pub name: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub components: Value,
}

#[derive(Debug, Deserialize)]
struct TemplatePage {
    #[serde(default)]
    data: Vec<MetaTemplate>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaInfo {
    url: String,
    #[serde(default)]
    mime_type: Option<String>,
}

/// Downloaded media file
#[derive(Debug, Clone)]
pub struct DownloadedMedia {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

// =============================================================================
// Client
// =============================================================================

/// Operations the CRM needs from the WhatsApp Cloud API
#[async_trait]
pub trait WhatsAppApi: Send + Sync {
    /// Send a message; returns the wamid Meta assigned
    async fn send_message(
        &self,
        phone_number_id: &str,
        access_token: &str,
        to: &str,
        message: &OutboundMessage,
    ) -> Result<String, GraphApiError>;

    /// All message templates of a business account
    async fn list_templates(
        &self,
        business_account_id: &str,
        access_token: &str,
    ) -> Result<Vec<MetaTemplate>, GraphApiError>;

    /// Resolve and download a media object
    async fn download_media(
        &self,
        media_id: &str,
        access_token: &str,
    ) -> Result<DownloadedMedia, GraphApiError>;
}

/// Graph API client over `reqwest`
#[derive(Clone)]
pub struct GraphApiClient {
    base_url: String,
    http_client: Client,
}

impl GraphApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        }
    }

    /// Send a request and decode a JSON body, mapping Graph error envelopes
    async fn execute<T: serde::de::DeserializeOwned>(
        request: RequestBuilder,
    ) -> Result<T, GraphApiError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(parse_error(status.as_u16(), &body));
        }

        serde_json::from_str(&body).map_err(|e| GraphApiError::InvalidResponse(e.to_string()))
    }
}

/// Map a failed Graph response to an error
fn parse_error(status: u16, body: &str) -> GraphApiError {
    match serde_json::from_str::<GraphErrorEnvelope>(body) {
        Ok(envelope) => GraphApiError::Api {
            code: envelope.error.code,
            message: envelope.error.message,
        },
        Err(_) => GraphApiError::Status {
            status,
            body: body.chars().take(200).collect(),
        },
    }
}

#[async_trait]
impl WhatsAppApi for GraphApiClient {
    async fn send_message(
        &self,
        phone_number_id: &str,
        access_token: &str,
        to: &str,
        message: &OutboundMessage,
    ) -> Result<String, GraphApiError> {
        let url = format!("{}/{}/messages", self.base_url, phone_number_id);
        let payload = message.to_payload(to);

        debug!("Sending {} message to {}", payload["type"], to);

        let request = self
            .http_client
            .post(&url)
            .bearer_auth(access_token)
            .json(&payload);
        let response: SendMessageResponse = Self::execute(request).await?;

        let wamid = response
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| GraphApiError::InvalidResponse("missing messages[0].id".into()))?;

        info!("Message sent to {}, wamid: {}", to, wamid);
        Ok(wamid)
    }

    async fn list_templates(
        &self,
        business_account_id: &str,
        access_token: &str,
    ) -> Result<Vec<MetaTemplate>, GraphApiError> {
        let mut url = format!(
            "{}/{}/message_templates?limit=100",
            self.base_url, business_account_id
        );
        let mut templates = Vec::new();

        for _ in 0..MAX_TEMPLATE_PAGES {
            let request = self.http_client.get(&url).bearer_auth(access_token);
            let page: TemplatePage = Self::execute(request).await?;
            templates.extend(page.data);

            match page.paging.and_then(|p| p.next) {
                Some(next) => url = next,
                None => return Ok(templates),
            }
        }

        warn!(
            "Template listing for {} stopped after {} pages",
            business_account_id, MAX_TEMPLATE_PAGES
        );
        Ok(templates)
    }

    async fn download_media(
        &self,
        media_id: &str,
        access_token: &str,
    ) -> Result<DownloadedMedia, GraphApiError> {
        let url = format!("{}/{}", self.base_url, media_id);
        let request = self.http_client.get(&url).bearer_auth(access_token);
        let info: MediaInfo = Self::execute(request).await?;

        let response = self
            .http_client
            .get(&info.url)
            .bearer_auth(access_token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(parse_error(status.as_u16(), &body));
        }
        let bytes = response.bytes().await?.to_vec();

        debug!("Downloaded media {} ({} bytes)", media_id, bytes.len());
        Ok(DownloadedMedia {
            bytes,
            mime_type: info.mime_type,
        })
    }
}
