//! Google Gemini provider (REST `generateContent`, v1beta)

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use super::{AiProvider, AiProviderError, ChatMessage, ChatRole};

const API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const MODEL: &str = "gemini-2.5-flash";
const TIMEOUT: Duration = Duration::from_secs(60);
const PROVIDER: &str = "gemini";
const API_KEY_HEADER: &str = "x-goog-api-key";

const SYSTEM_ACK: &str = "Entendido. Seguiré estas instrucciones.";

const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

pub struct GeminiProvider {
    api_key: String,
    system_prompt: String,
    base_url: String,
    http_client: Client,
}

impl GeminiProvider {
    pub fn new(api_key: &str, system_prompt: &str) -> Self {
        Self::with_base_url(api_key, system_prompt, API_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, system_prompt: &str, base_url: &str) -> Self {
        let http_client = Client::builder()
            .timeout(TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            api_key: api_key.to_string(),
            system_prompt: system_prompt.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        }
    }

    fn build_payload(&self, history: &[ChatMessage]) -> Value {
        let mut contents = Vec::new();

        if !self.system_prompt.is_empty() {
            contents.push(json!({
                "role": "user",
                "parts": [{"text": format!("[System Instructions]: {}", self.system_prompt)}]
            }));
            contents.push(json!({
                "role": "model",
                "parts": [{"text": SYSTEM_ACK}]
            }));
        }

        for msg in history {
            if msg.content.trim().is_empty() {
                continue;
            }
            let role = match msg.role {
                ChatRole::User => "user",
                ChatRole::Model => "model",
            };
            contents.push(json!({"role": role, "parts": [{"text": msg.content}]}));
        }

        let safety_settings: Vec<Value> = SAFETY_CATEGORIES
            .iter()
            .map(|category| json!({"category": category, "threshold": "BLOCK_MEDIUM_AND_ABOVE"}))
            .collect();

        json!({
            "contents": contents,
            "generationConfig": {
                "temperature": 0.7,
                "topP": 0.95,
                "topK": 40,
                "maxOutputTokens": 1024
            },
            "safetySettings": safety_settings
        })
    }
}

/// Concatenated text parts of the first candidate, trimmed
fn extract_response_text(data: &Value) -> String {
    data["candidates"][0]["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part["text"].as_str())
                .collect::<String>()
        })
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// `error.message` of an error body, else its first 200 characters
fn parse_error(body: &str) -> String {
    let fallback = || {
        if body.is_empty() {
            "Unknown error".to_string()
        } else {
            body.chars().take(200).collect()
        }
    };

    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(fallback)
}

#[async_trait]
impl AiProvider for GeminiProvider {
    async fn generate_response(&self, history: &[ChatMessage]) -> Result<String, AiProviderError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, MODEL);
        let payload = self.build_payload(history);

        debug!("Requesting Gemini completion ({} turns)", history.len());

        let response = self
            .http_client
            .post(&url)
            .header(API_KEY_HEADER, self.api_key.as_str())
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AiProviderError::Timeout { provider: PROVIDER }
                } else {
                    AiProviderError::Request {
                        provider: PROVIDER,
                        message: e.without_url().to_string(),
                    }
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| AiProviderError::Request {
            provider: PROVIDER,
            message: e.without_url().to_string(),
        })?;

        if status.as_u16() != 200 {
            return Err(AiProviderError::Api {
                provider: PROVIDER,
                status: status.as_u16(),
                detail: parse_error(&body),
            });
        }

        let data: Value = serde_json::from_str(&body).map_err(|e| AiProviderError::Request {
            provider: PROVIDER,
            message: format!("invalid JSON: {}", e),
        })?;

        let text = extract_response_text(&data);
        if text.is_empty() {
            return Err(AiProviderError::EmptyResponse { provider: PROVIDER });
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        http::{HeaderMap, StatusCode, Uri},
        routing::post,
    };

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base
    }

    #[test]
    fn test_payload_with_system_prompt() {
        let provider = GeminiProvider::new("key", "Sé breve");
        let history = vec![
            ChatMessage::new(ChatRole::User, "Hola"),
            ChatMessage::new(ChatRole::Model, "   "),
            ChatMessage::new(ChatRole::Model, "¿En qué te ayudo?"),
        ];

        let payload = provider.build_payload(&history);
        let contents = payload["contents"].as_array().unwrap();

        assert_eq!(contents.len(), 4);
        assert_eq!(
            contents[0]["parts"][0]["text"],
            "[System Instructions]: Sé breve"
        );
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["role"], "user");
        assert_eq!(contents[3]["parts"][0]["text"], "¿En qué te ayudo?");
        assert_eq!(payload["generationConfig"]["maxOutputTokens"], 1024);
        assert_eq!(payload["safetySettings"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_payload_without_system_prompt() {
        let provider = GeminiProvider::new("key", "");
        let payload = provider.build_payload(&[ChatMessage::new(ChatRole::User, "Hola")]);
        assert_eq!(payload["contents"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_extract_response_text() {
        let data = json!({
            "candidates": [{"content": {"parts": [{"text": " Hola, "}, {"inline": 1}, {"text": "Ana "}]}}]
        });
        assert_eq!(extract_response_text(&data), "Hola, Ana");
        assert_eq!(extract_response_text(&json!({"candidates": []})), "");
    }

    #[test]
    fn test_parse_error() {
        assert_eq!(
            parse_error(r#"{"error": {"message": "API key not valid"}}"#),
            "API key not valid"
        );
        assert_eq!(parse_error("oops"), "oops");
        assert_eq!(parse_error(""), "Unknown error");
    }

    #[tokio::test]
    async fn test_generate_response_against_fake_api() {
        let app = Router::new().route(
            "/models/{model}",
            post(
                |uri: Uri, headers: HeaderMap, Json(body): Json<Value>| async move {
                    assert_eq!(
                        headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()),
                        Some("secret")
                    );
                    assert!(uri.query().is_none());
                    assert_eq!(body["contents"][0]["parts"][0]["text"], "Hola");
                    Json(json!({"candidates": [{"content": {"parts": [{"text": "¡Hola!"}]}}]}))
                },
            ),
        );
        let provider = GeminiProvider::with_base_url("secret", "", &serve(app).await);

        let reply = provider
            .generate_response(&[ChatMessage::new(ChatRole::User, "Hola")])
            .await
            .unwrap();
        assert_eq!(reply, "¡Hola!");
    }

    #[tokio::test]
    async fn test_generate_response_api_error() {
        let app = Router::new().route(
            "/models/{model}",
            post(|| async {
                (
                    StatusCode::FORBIDDEN,
                    Json(json!({"error": {"message": "API key not valid"}})),
                )
            }),
        );
        let provider = GeminiProvider::with_base_url("bad", "", &serve(app).await);

        let err = provider
            .generate_response(&[ChatMessage::new(ChatRole::User, "Hola")])
            .await
            .unwrap_err();
        assert!(matches!(err, AiProviderError::Api { status: 403, .. }));
        assert!(err.to_string().contains("API key not valid"));
    }

    #[tokio::test]
    async fn test_connection_error_does_not_expose_api_key() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let provider = GeminiProvider::with_base_url("SECRET-API-KEY-123", "", &base);

        let err = provider
            .generate_response(&[ChatMessage::new(ChatRole::User, "Hola")])
            .await
            .unwrap_err();
        assert!(matches!(err, AiProviderError::Request { .. }), "{}", err);
        assert!(!err.to_string().contains("SECRET-API-KEY-123"), "{}", err);
    }
}
