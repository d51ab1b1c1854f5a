//! Background message pipeline
//!
//! Task handlers behind the queue: webhook fan-out, incoming message
//! persistence, delivery status updates, AI replies and outbound sends.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::ai::{AiBotService, AiOutcome};
use crate::config::CrmConfig;
use crate::media::MediaStore;
use crate::queue::{Task, TaskError, TaskHandler, TaskQueue};
use crate::realtime::InboxHub;
use crate::storage::{
    Account, ContactPatch, ConversationStatus, CrmStore, DeliveryStatus, Direction, Message,
    MessageType, NewMessage, StorageResult,
};
use crate::types::{InboundMessage, StatusNotification, WebhookPayload};
use crate::whatsapp_api::{OutboundMessage, WhatsAppApi};

/// Result of an AI reply attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AiResponseOutcome {
    Skipped {
        reason: String,
    },
    Replied {
        message_id: String,
        response_length: usize,
    },
    Failed {
        reason: String,
    },
}

/// Task handler with every dependency the pipeline touches
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<CrmConfig>,
    store: Arc<CrmStore>,
    whatsapp: Arc<dyn WhatsAppApi>,
    ai: AiBotService,
    media: MediaStore,
    hub: InboxHub,
    queue: TaskQueue,
}

#[async_trait]
impl TaskHandler for Pipeline {
    async fn handle(&self, task: Task) -> Result<(), TaskError> {
        match task {
            Task::ProcessWebhookPayload {
                payload,
                phone_number_id,
            } => {
                self.process_webhook_payload(&payload, &phone_number_id)?;
            }
            Task::ProcessIncomingMessage {
                message,
                phone_number_id,
                profile_name,
            } => {
                self.process_incoming_message(&message, &phone_number_id, profile_name.as_deref())
                    .await?;
            }
            Task::ProcessStatusUpdate { status } => {
                self.process_status_update(&status)?;
            }
            Task::ProcessAiResponse { conversation_id } => {
                match self.process_ai_response(&conversation_id).await {
                    AiResponseOutcome::Failed { reason } => {
                        warn!("AI response for {} failed: {}", conversation_id, reason)
                    }
                    outcome => debug!("AI response for {}: {:?}", conversation_id, outcome),
                }
            }
            Task::SendMessage { message_id } => {
                self.send_message(&message_id).await?;
            }
            Task::SendTemplate {
                message_id,
                name,
                language,
                components,
            } => {
                self.send_template(&message_id, &name, &language, components)
                    .await?;
            }
        }
        Ok(())
    }
}

impl Pipeline {
    pub fn new(
        config: Arc<CrmConfig>,
        store: Arc<CrmStore>,
        whatsapp: Arc<dyn WhatsAppApi>,
        ai: AiBotService,
        media: MediaStore,
        hub: InboxHub,
        queue: TaskQueue,
    ) -> Self {
        Self {
            config,
            store,
            whatsapp,
            ai,
            media,
            hub,
            queue,
        }
    }

    // =========================================================================
    // Webhook fan-out
    // =========================================================================

    /// Enqueue one task per message and per status; returns how many were queued
    pub fn process_webhook_payload(
        &self,
        payload: &Value,
        phone_number_id: &str,
    ) -> Result<usize, TaskError> {
        let notification: WebhookPayload = serde_json::from_value(payload.clone())
            .map_err(|e| TaskError::InvalidPayload(e.to_string()))?;

        info!(
            "Processing webhook payload for {}: {}",
            phone_number_id,
            notification.object.as_deref().unwrap_or("unknown")
        );

        let mut queued = 0;
        for change in notification.entry.iter().flat_map(|e| &e.changes) {
            let value = &change.value;

            for message in &value.messages {
                let profile_name = message["from"]
                    .as_str()
                    .and_then(|from| value.profile_name(from));
                self.queue.enqueue(Task::ProcessIncomingMessage {
                    message: message.clone(),
                    phone_number_id: phone_number_id.to_string(),
                    profile_name,
                })?;
                queued += 1;
            }

            for status in &value.statuses {
                self.queue.enqueue(Task::ProcessStatusUpdate {
                    status: status.clone(),
                })?;
                queued += 1;
            }
        }

        debug!("Webhook payload fanned out into {} tasks", queued);
        Ok(queued)
    }

    // =========================================================================
    // Incoming messages
    // =========================================================================

    /// Persist an incoming message; `None` when the account is unknown or the
    /// message was already stored
    pub async fn process_incoming_message(
        &self,
        raw: &Value,
        phone_number_id: &str,
        profile_name: Option<&str>,
    ) -> Result<Option<Message>, TaskError> {
        let Some(account) = self.store.get_account_by_phone_number_id(phone_number_id)? else {
            warn!("Account not found for phone_number_id: {}", phone_number_id);
            return Ok(None);
        };

        let inbound: InboundMessage = serde_json::from_value(raw.clone())
            .map_err(|e| TaskError::InvalidPayload(e.to_string()))?;

        if self.store.get_message_by_whatsapp_id(&inbound.id)?.is_some() {
            debug!("Duplicate incoming message {}", inbound.id);
            return Ok(None);
        }

        let profile_name = profile_name.filter(|n| !n.trim().is_empty());
        let (contact, created) = self.store.get_or_create_contact(
            &account.id,
            &inbound.from,
            profile_name.unwrap_or(&inbound.from),
        )?;
        if created {
            info!("New contact created: {}", inbound.from);
        } else if let Some(name) = profile_name
            && contact.name == contact.phone_number
        {
            self.store.update_contact(
                &contact.id,
                ContactPatch {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
            )?;
        }

        let (conversation, _) = self
            .store
            .get_or_create_conversation(&account.id, &contact.id)?;
        if conversation.status == ConversationStatus::Resolved {
            self.store
                .set_conversation_status(&conversation.id, ConversationStatus::Open)?;
        }

        let media_url = self.download_media(&account, &inbound).await;

        let Some(message) = self.store.insert_message(NewMessage {
            conversation_id: conversation.id.clone(),
            whatsapp_id: inbound.id.clone(),
            direction: Direction::Incoming,
            message_type: message_type_for(&inbound.kind),
            body: Some(incoming_body(&inbound)),
            media_url,
            metadata: raw.clone(),
            delivery_status: DeliveryStatus::Delivered,
        })?
        else {
            debug!("Duplicate incoming message {}", inbound.id);
            return Ok(None);
        };

        self.store.touch_conversation(&conversation.id, Utc::now())?;
        info!("Message saved: {}", message.whatsapp_id);

        self.push_new_message(&message);

        if inbound.kind == "text" {
            self.queue.enqueue(Task::ProcessAiResponse {
                conversation_id: conversation.id.clone(),
            })?;
        }

        Ok(Some(message))
    }

    /// Fetch an attachment into the media store; failures are logged only
    async fn download_media(&self, account: &Account, inbound: &InboundMessage) -> Option<String> {
        let content = inbound.media()?;
        let media_id = content.id.as_deref()?;

        let downloaded = match self
            .whatsapp
            .download_media(media_id, &account.access_token)
            .await
        {
            Ok(downloaded) => downloaded,
            Err(e) => {
                warn!("Failed to download media {}: {}", media_id, e);
                return None;
            }
        };

        let mime_type = downloaded
            .mime_type
            .as_deref()
            .or(content.mime_type.as_deref());
        match self
            .media
            .save_incoming(media_id, mime_type, &downloaded.bytes)
            .await
        {
            Ok(url) => Some(url),
            Err(e) => {
                error!("Failed to store media {}: {}", media_id, e);
                None
            }
        }
    }

    // =========================================================================
    // Status updates
    // =========================================================================

    /// Apply a delivery status notification; `None` when nothing changed
    pub fn process_status_update(&self, raw: &Value) -> Result<Option<Message>, TaskError> {
        let notification: StatusNotification = serde_json::from_value(raw.clone())
            .map_err(|e| TaskError::InvalidPayload(e.to_string()))?;

        let Some(message) = self.store.get_message_by_whatsapp_id(&notification.id)? else {
            warn!("Message not found for status update: {}", notification.id);
            return Ok(None);
        };

        let Ok(status) = DeliveryStatus::from_str(&notification.status) else {
            warn!(
                "Ignoring unknown status {:?} for {}",
                notification.status, notification.id
            );
            return Ok(None);
        };

        let extra = (status == DeliveryStatus::Failed && !notification.errors.is_empty())
            .then(|| json!({ "errors": notification.errors }));

        let Some(change) = self.store.update_delivery_status(&message.id, status, extra)? else {
            return Ok(None);
        };
        if !change.applied {
            debug!(
                "Ignoring {} for {}: already {}",
                status, notification.id, change.message.delivery_status
            );
            return Ok(None);
        }

        info!("Message {} status updated to: {}", notification.id, status);
        self.push_status(&change.message);
        Ok(Some(change.message))
    }

    // =========================================================================
    // AI replies
    // =========================================================================

    /// Generate and queue an AI reply for a conversation
    pub async fn process_ai_response(&self, conversation_id: &str) -> AiResponseOutcome {
        let conversation = match self.store.get_conversation(conversation_id) {
            Ok(Some(conversation)) => conversation,
            Ok(None) => {
                return AiResponseOutcome::Failed {
                    reason: "Conversation not found".to_string(),
                };
            }
            Err(e) => {
                return AiResponseOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let (text, provider) = match self.ai.generate_reply(&conversation).await {
            Ok(AiOutcome::Reply { text, provider }) => (text, provider),
            Ok(AiOutcome::Disabled) => {
                return AiResponseOutcome::Skipped {
                    reason: "AI not enabled".to_string(),
                };
            }
            Ok(AiOutcome::NoHistory) => {
                return AiResponseOutcome::Skipped {
                    reason: "No conversation history".to_string(),
                };
            }
            Err(e) => {
                return AiResponseOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let response_length = text.chars().count();
        let mut new = NewMessage::outgoing(&conversation.id, "ai_", MessageType::Text, Some(text));
        new.metadata = json!({ "ai_generated": true, "provider": provider.as_str() });

        let queued = self.store_and_queue(new).map_err(|e| e.to_string());
        match queued {
            Ok(message) => AiResponseOutcome::Replied {
                message_id: message.id,
                response_length,
            },
            Err(reason) => AiResponseOutcome::Failed { reason },
        }
    }

    fn store_and_queue(&self, new: NewMessage) -> Result<Message, TaskError> {
        let message = self
            .store
            .insert_message(new)?
            .ok_or_else(|| TaskError::InvalidPayload("duplicate message id".to_string()))?;
        self.store
            .touch_conversation(&message.conversation_id, Utc::now())?;
        self.push_new_message(&message);
        self.queue.enqueue(Task::SendMessage {
            message_id: message.id.clone(),
        })?;
        Ok(message)
    }

    // =========================================================================
    // Outbound sends
    // =========================================================================

    /// Deliver a stored outgoing message through the Graph API
    pub async fn send_message(&self, message_id: &str) -> Result<Option<Message>, TaskError> {
        let Some(message) = self.store.get_message(message_id)? else {
            warn!("Message {} not found for sending", message_id);
            return Ok(None);
        };

        let outbound = match message.message_type {
            MessageType::Text => OutboundMessage::Text {
                body: message.body.clone().unwrap_or_default(),
            },
            MessageType::Template => OutboundMessage::Template {
                name: message.metadata["template_name"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                language: message.metadata["template_language"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                components: message.metadata["components"].clone(),
            },
            kind if kind.is_media() => match self.prepare_media(&message).await? {
                Some(outbound) => outbound,
                None => {
                    return self
                        .record_failure(&message, "Message has no media_url")
                        .map_err(TaskError::from);
                }
            },
            other => {
                return self
                    .record_failure(&message, &format!("Cannot send {} messages", other))
                    .map_err(TaskError::from);
            }
        };

        self.deliver(&message, &outbound).await
    }

    /// Deliver a stored template message
    pub async fn send_template(
        &self,
        message_id: &str,
        name: &str,
        language: &str,
        components: Value,
    ) -> Result<Option<Message>, TaskError> {
        let Some(message) = self.store.get_message(message_id)? else {
            warn!("Template message {} not found for sending", message_id);
            return Ok(None);
        };

        let outbound = OutboundMessage::Template {
            name: name.to_string(),
            language: language.to_string(),
            components,
        };
        self.deliver(&message, &outbound).await
    }

    /// Media payload for a message, converting browser voice notes first
    async fn prepare_media(&self, message: &Message) -> StorageResult<Option<OutboundMessage>> {
        let Some(mut media_url) = message.media_url.clone().filter(|u| !u.is_empty()) else {
            return Ok(None);
        };

        if message.message_type == MessageType::Audio && media_url.to_lowercase().ends_with(".webm")
        {
            let converted = self.media.convert_for_whatsapp(&media_url).await;
            if converted != media_url {
                self.store.set_message_media_url(&message.id, &converted)?;
                media_url = converted;
            }
        }

        let caption = message.metadata["caption"]
            .as_str()
            .map(str::to_string)
            .or_else(|| message.body.clone())
            .filter(|c| !c.is_empty());

        Ok(Some(OutboundMessage::Media {
            kind: message.message_type,
            link: self.config.absolute_media_url(&media_url),
            caption,
        }))
    }

    async fn deliver(
        &self,
        message: &Message,
        outbound: &OutboundMessage,
    ) -> Result<Option<Message>, TaskError> {
        let Some(conversation) = self.store.get_conversation(&message.conversation_id)? else {
            return Ok(self.record_failure(message, "Conversation not found")?);
        };
        let contact = self.store.get_contact(&conversation.contact_id)?;
        let account = self.store.get_account(&conversation.account_id)?;
        let (Some(contact), Some(account)) = (contact, account) else {
            return Ok(self.record_failure(message, "Contact or account not found")?);
        };

        let sent = self
            .whatsapp
            .send_message(
                &account.phone_number_id,
                &account.access_token,
                &contact.phone_number,
                outbound,
            )
            .await;

        match sent {
            Ok(wamid) => {
                let Some(updated) = self.store.mark_sent(&message.id, &wamid)? else {
                    return Ok(None);
                };
                info!("Message {} sent as {}", message.id, wamid);
                self.push_status(&updated);
                Ok(Some(updated))
            }
            Err(e) => {
                error!("Failed to send message {}: {}", message.id, e);
                Ok(self.record_failure(message, &e.to_string())?)
            }
        }
    }

    /// Mark a message `failed` with the reason in its metadata
    fn record_failure(&self, message: &Message, reason: &str) -> StorageResult<Option<Message>> {
        let change = self.store.update_delivery_status(
            &message.id,
            DeliveryStatus::Failed,
            Some(json!({ "error": reason })),
        )?;
        let Some(change) = change else {
            return Ok(None);
        };
        if change.applied {
            self.push_status(&change.message);
        }
        Ok(Some(change.message))
    }

    // =========================================================================
    // Inbox pushes
    // =========================================================================

    fn push_new_message(&self, message: &Message) {
        self.hub.notify_message_activity(&self.store, message);
    }

    fn push_status(&self, message: &Message) {
        if let Err(e) = self.hub.notify_status(&self.store, message) {
            warn!("Failed to push status of {}: {}", message.id, e);
        }
    }
}

/// Stored type for a WhatsApp message type; quick-reply buttons count as
/// interactive, unknown types are kept as text with a marker body
fn message_type_for(kind: &str) -> MessageType {
    match kind {
        "button" => MessageType::Interactive,
        other => MessageType::from_str(other).unwrap_or(MessageType::Text),
    }
}

fn marker(kind: &str) -> String {
    format!("[{}]", kind.to_uppercase())
}

/// Display body of an incoming message
fn incoming_body(inbound: &InboundMessage) -> String {
    let non_empty = |s: &Option<String>| s.clone().filter(|s| !s.trim().is_empty());

    match inbound.kind.as_str() {
        "text" => inbound
            .text
            .as_ref()
            .map(|t| t.body.clone())
            .unwrap_or_default(),
        "image" | "video" | "audio" | "document" | "sticker" => inbound
            .media()
            .and_then(|m| non_empty(&m.caption))
            .unwrap_or_else(|| marker(&inbound.kind)),
        "interactive" => inbound
            .interactive
            .as_ref()
            .and_then(|i| {
                i.button_reply
                    .as_ref()
                    .or(i.list_reply.as_ref())
                    .and_then(|reply| non_empty(&reply.title))
            })
            .unwrap_or_else(|| marker(&inbound.kind)),
        "button" => inbound
            .button
            .as_ref()
            .and_then(|b| non_empty(&b.text))
            .unwrap_or_else(|| marker(&inbound.kind)),
        "location" => {
            let parts: Vec<String> = inbound
                .location
                .as_ref()
                .map(|l| [non_empty(&l.name), non_empty(&l.address)])
                .into_iter()
                .flatten()
                .flatten()
                .collect();
            if parts.is_empty() {
                marker(&inbound.kind)
            } else {
                parts.join(" - ")
            }
        }
        other => marker(other),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::ai::test_support::ScriptedFactory;
    use crate::queue::TaskReceiver;
    use crate::whatsapp_api::test_support::FakeWhatsApp;

    /// Pipeline over an in-memory store and fakes, with the queue receiver
    /// kept for inspecting enqueued tasks
    pub struct Harness {
        pub pipeline: Pipeline,
        pub store: Arc<CrmStore>,
        pub whatsapp: FakeWhatsApp,
        pub hub: InboxHub,
        pub receiver: TaskReceiver,
        pub media_dir: tempfile::TempDir,
    }

    pub fn harness(whatsapp: FakeWhatsApp, ai: ScriptedFactory) -> Harness {
        let store = Arc::new(crate::storage::test_support::store());
        let media_dir = tempfile::tempdir().unwrap();
        let media = MediaStore::new(media_dir.path(), "/media/");
        let mut config = CrmConfig::with_encryption_key("unused");
        config.public_base_url = Some("https://crm.example.com".to_string());

        let (queue, receiver) = TaskQueue::new();
        let hub = InboxHub::new();
        let pipeline = Pipeline::new(
            Arc::new(config),
            store.clone(),
            Arc::new(whatsapp.clone()),
            AiBotService::new(store.clone(), Arc::new(ai)),
            media,
            hub.clone(),
            queue,
        );

        Harness {
            pipeline,
            store,
            whatsapp,
            hub,
            receiver,
            media_dir,
        }
    }
}
