//! Template messages: body rendering and the send-to-contact service

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::queue::{Task, TaskError, TaskQueue};
use crate::realtime::InboxHub;
use crate::storage::{Contact, CrmStore, Message, MessageType, NewMessage, StorageError, Template};

const MAX_NAME_LEN: usize = 255;
const MAX_LANGUAGE_LEN: usize = 10;

/// Template to send: name, language code and the parameter components
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TemplateData {
    #[serde(rename = "template_name")]
    pub name: String,
    #[serde(rename = "template_language")]
    pub language: String,
    #[serde(default)]
    pub components: Vec<Value>,
}

impl TemplateData {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() || self.name.chars().count() > MAX_NAME_LEN {
            return Err(format!(
                "template_name must be between 1 and {} characters",
                MAX_NAME_LEN
            ));
        }
        if self.language.trim().is_empty() || self.language.chars().count() > MAX_LANGUAGE_LEN {
            return Err(format!(
                "template_language must be between 1 and {} characters",
                MAX_LANGUAGE_LEN
            ));
        }
        if self.components.iter().any(|c| !c.is_object()) {
            return Err("components must be a list of objects".to_string());
        }
        Ok(())
    }

    fn components_value(&self) -> Value {
        Value::Array(self.components.clone())
    }
}

// =============================================================================
// Rendering
// =============================================================================

/// Human-readable body of a sent template.
///
/// Falls back to `[Template: <name>]` when the approved template is unknown
/// or has no usable `BODY` text.
pub fn render_template_body(template: Option<&Template>, name: &str, components: &[Value]) -> String {
    let fallback = || format!("[Template: {}]", name);

    let Some(template) = template else {
        return fallback();
    };
    let body_text = template
        .components
        .as_array()
        .and_then(|parts| parts.iter().find(|c| c["type"] == "BODY"))
        .and_then(|body| body["text"].as_str())
        .filter(|text| !text.is_empty());

    match body_text {
        Some(text) => apply_parameters(text, components),
        None => fallback(),
    }
}

/// Substitute text parameters of the sent `body` component
fn apply_parameters(text: &str, components: &[Value]) -> String {
    let Some(params) = components
        .iter()
        .find(|c| c["type"] == "body")
        .and_then(|c| c["parameters"].as_array())
        .filter(|p| !p.is_empty())
    else {
        return text.to_string();
    };

    let mut named: HashMap<&str, &str> = HashMap::new();
    let mut positional: Vec<&str> = Vec::new();

    for param in params.iter().filter(|p| p["type"] == "text") {
        let value = param["text"].as_str().unwrap_or_default();
        match param["parameter_name"].as_str().filter(|n| !n.is_empty()) {
            Some(name) => {
                named.insert(name, value);
            }
            None => positional.push(value),
        }
    }

    let mut rendered = text.to_string();
    for (key, value) in &named {
        rendered = rendered.replace(&format!("{{{{{}}}}}", key), value);
    }
    for (index, value) in positional.iter().enumerate() {
        rendered = rendered.replace(&format!("{{{{{}}}}}", index + 1), value);
    }
    rendered
}

// =============================================================================
// Notification service
// =============================================================================

#[derive(Debug, thiserror::Error)]
enum NotificationError {
    #[error("Failed to create message: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to enqueue send: {0}")]
    Queue(#[from] TaskError),

    #[error("Failed to create message: duplicate message id")]
    Duplicate,
}

/// Outcome of a template send request
#[derive(Debug, Clone)]
pub struct SendTemplateResult {
    pub success: bool,
    pub message: Option<Message>,
    pub error: Option<String>,
}

/// Creates template messages and hands them to the send worker
#[derive(Clone)]
pub struct NotificationService {
    store: Arc<CrmStore>,
    queue: TaskQueue,
    hub: InboxHub,
}

impl NotificationService {
    pub fn new(store: Arc<CrmStore>, queue: TaskQueue, hub: InboxHub) -> Self {
        Self { store, queue, hub }
    }

    /// Queue a template message to a contact on the contact's account
    pub fn send_template_to_contact(&self, contact: &Contact, data: &TemplateData) -> SendTemplateResult {
        match self.try_send(contact, data) {
            Ok(message) => SendTemplateResult {
                success: true,
                message: Some(message),
                error: None,
            },
            Err(e) => {
                warn!("Template send to contact {} failed: {}", contact.id, e);
                SendTemplateResult {
                    success: false,
                    message: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn try_send(&self, contact: &Contact, data: &TemplateData) -> Result<Message, NotificationError> {
        let (conversation, _) = self
            .store
            .get_or_create_conversation(&contact.account, &contact.id)?;

        let template = match self
            .store
            .find_approved_template(&contact.account, &data.name, &data.language)
        {
            Ok(template) => template,
            Err(e) => {
                warn!("Template lookup failed, using fallback body: {}", e);
                None
            }
        };
        let body = render_template_body(template.as_ref(), &data.name, &data.components);

        let mut new = NewMessage::outgoing(&conversation.id, "", MessageType::Template, Some(body));
        new.whatsapp_id = format!("temp-{}", uuid::Uuid::new_v4());
        new.metadata = json!({
            "template_name": data.name,
            "template_language": data.language,
            "components": data.components,
        });

        let message = self
            .store
            .insert_message(new)?
            .ok_or(NotificationError::Duplicate)?;

        self.store.touch_conversation(&conversation.id, Utc::now())?;

        self.hub.notify_message_activity(&self.store, &message);

        self.queue.enqueue(Task::SendTemplate {
            message_id: message.id.clone(),
            name: data.name.clone(),
            language: data.language.clone(),
            components: data.components_value(),
        })?;

        debug!(
            "Template {} queued for contact {} as message {}",
            data.name, contact.id, message.id
        );
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::*;
    use crate::storage::{DeliveryStatus, Direction, NewTemplate, TemplateCategory, TemplateStatus};
    use crate::types::WsEvent;

    fn template(body: Option<&str>) -> Template {
        let components = match body {
            Some(text) => json!([{"type": "HEADER", "text": "Hi"}, {"type": "BODY", "text": text}]),
            None => json!([{"type": "HEADER", "text": "Hi"}]),
        };
        Template {
            id: "t1".into(),
            account: "a1".into(),
            name: "welcome".into(),
            language: "es".into(),
            category: TemplateCategory::Utility,
            status: TemplateStatus::Approved,
            components,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn data(name: &str) -> TemplateData {
        TemplateData {
            name: name.into(),
            language: "es".into(),
            components: vec![json!({
                "type": "body",
                "parameters": [{"type": "text", "text": "Ana"}]
            })],
        }
    }

    #[test]
    fn test_fallbacks() {
        assert_eq!(render_template_body(None, "welcome", &[]), "[Template: welcome]");
        assert_eq!(
            render_template_body(Some(&template(None)), "welcome", &[]),
            "[Template: welcome]"
        );
        assert_eq!(
            render_template_body(Some(&template(Some(""))), "welcome", &[]),
            "[Template: welcome]"
        );
    }

    #[test]
    fn test_positional_parameters() {
        let t = template(Some("Hola {{1}}, tu pedido {{2}} está listo"));
        let components = vec![json!({
            "type": "body",
            "parameters": [
                {"type": "text", "text": "Ana"},
                {"type": "currency", "currency": {"code": "MXN"}},
                {"type": "text", "text": "#42"}
            ]
        })];
        assert_eq!(
            render_template_body(Some(&t), "welcome", &components),
            "Hola Ana, tu pedido #42 está listo"
        );
    }

    #[test]
    fn test_named_parameters() {
        let t = template(Some("Hola {{first_name}}, código {{1}}"));
        let components = vec![json!({
            "type": "body",
            "parameters": [
                {"type": "text", "text": "Luis", "parameter_name": "first_name"},
                {"type": "text", "text": "XY12"}
            ]
        })];
        assert_eq!(
            render_template_body(Some(&t), "welcome", &components),
            "Hola Luis, código XY12"
        );
    }

    #[test]
    fn test_uppercase_body_component_ignored_for_parameters() {
        let t = template(Some("Hola {{1}}"));
        let components = vec![json!({"type": "BODY", "parameters": [{"type": "text", "text": "x"}]})];
        assert_eq!(render_template_body(Some(&t), "welcome", &components), "Hola {{1}}");
    }

    #[test]
    fn test_validate() {
        assert!(data("welcome").validate().is_ok());
        assert!(data("").validate().is_err());

        let mut long_language = data("welcome");
        long_language.language = "es_MX_extra_long".into();
        assert!(long_language.validate().is_err());

        let mut bad_components = data("welcome");
        bad_components.components = vec![json!("body")];
        assert!(bad_components.validate().is_err());
    }

    #[test]
    fn test_deserialize_request_body() {
        let parsed: TemplateData = serde_json::from_value(json!({
            "template_name": "welcome",
            "template_language": "es"
        }))
        .unwrap();
        assert_eq!(parsed.name, "welcome");
        assert!(parsed.components.is_empty());
    }

    #[test]
    fn test_send_template_to_contact() {
        let store = Arc::new(store());
        let account = account(&store, None, "1001");
        store
            .insert_template(NewTemplate {
                account_id: account.id.clone(),
                name: "welcome".into(),
                language: "es".into(),
                category: TemplateCategory::Marketing,
                status: TemplateStatus::Approved,
                components: json!([{"type": "BODY", "text": "Hola {{1}}"}]),
            })
            .unwrap();
        let (contact, _) = store
            .get_or_create_contact(&account.id, "5215550001", "Ana")
            .unwrap();

        let (queue, mut receiver) = TaskQueue::new();
        let hub = InboxHub::new();
        let mut events = hub.subscribe();
        let service = NotificationService::new(store.clone(), queue, hub);

        let result = service.send_template_to_contact(&contact, &data("welcome"));
        assert!(result.success, "{:?}", result.error);

        let message = result.message.unwrap();
        assert!(message.whatsapp_id.starts_with("temp-"));
        assert_eq!(message.body.as_deref(), Some("Hola Ana"));
        assert_eq!(message.message_type, MessageType::Template);
        assert_eq!(message.direction, Direction::Outgoing);
        assert_eq!(message.delivery_status, DeliveryStatus::Sent);
        assert_eq!(message.metadata["template_name"], "welcome");

        let conversation = store.get_conversation(&message.conversation_id).unwrap().unwrap();
        assert!(conversation.last_message_at.is_some());

        match receiver.try_next() {
            Some(Task::SendTemplate {
                message_id, name, ..
            }) => {
                assert_eq!(message_id, message.id);
                assert_eq!(name, "welcome");
            }
            other => panic!("unexpected task {:?}", other),
        }
        assert!(matches!(
            events.try_recv().map(|e| e.event),
            Ok(WsEvent::NewMessage { .. })
        ));
        assert!(matches!(
            events.try_recv().map(|e| e.event),
            Ok(WsEvent::ConversationUpdate { .. })
        ));
    }

    #[test]
    fn test_send_reports_queue_failure() {
        let store = Arc::new(store());
        let account = account(&store, None, "1001");
        let (contact, _) = store
            .get_or_create_contact(&account.id, "5215550001", "Ana")
            .unwrap();

        let (queue, receiver) = TaskQueue::new();
        drop(receiver);
        let service = NotificationService::new(store.clone(), queue, InboxHub::new());

        let result = service.send_template_to_contact(&contact, &data("missing"));
        assert!(!result.success);
        assert!(result.error.unwrap().contains("enqueue"));
    }
}
