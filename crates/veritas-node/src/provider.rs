//! Inference provider seam and the OpenAI-compatible chat client.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use veritas_core::{Result, VeritasError};

/// Fixed instruction sent ahead of every prompt.
pub const SYSTEM_INSTRUCTION: &str = "You are a helpful and concise AI assistant. Every response you give will be cryptographically committed on-chain for permanent auditability. Be accurate and precise.";

const MAX_TOKENS: u32 = 1024;
const TEMPERATURE: f32 = 0.7;

/// Something that turns a prompt into text.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Run `prompt` on `model` and return the raw output.
    async fn complete(&self, model: &str, prompt: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatReply>,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Groq (or any OpenAI-compatible) chat completions client.
pub struct GroqProvider {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl GroqProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VeritasError::ConnectionError(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http,
        })
    }
}

#[async_trait]
impl InferenceProvider for GroqProvider {
    async fn complete(&self, model: &str, prompt: &str) -> Result<String> {
        let provider_error = |message: String| VeritasError::Provider {
            model: model.to_string(),
            message,
        };

        let body = ChatRequest {
            model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_INSTRUCTION,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| provider_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(provider_error(format!("HTTP {status}: {detail}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| provider_error(format!("unreadable response: {e}")))?;

        let output = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .unwrap_or_default();

        debug!("Provider returned {} chars from {}", output.len(), model);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::{json, Value};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_chat_request_shape_and_output() {
        let router = Router::new().route(
            "/chat/completions",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["model"], "llama3-8b-8192");
                assert_eq!(body["messages"][0]["role"], "system");
                assert_eq!(body["messages"][0]["content"], SYSTEM_INSTRUCTION);
                assert_eq!(body["messages"][1]["content"], "What is 6 x 7?");
                assert_eq!(body["max_tokens"], 1024);
                Json(json!({
                    "choices": [{ "message": { "role": "assistant", "content": "The answer is 42." } }]
                }))
            }),
        );
        let base = serve(router).await;

        let provider = GroqProvider::new(base, "gsk_test", Duration::from_secs(5)).unwrap();
        let output = provider.complete("llama3-8b-8192", "What is 6 x 7?").await.unwrap();
        assert_eq!(output, "The answer is 42.");
    }

    #[tokio::test]
    async fn test_missing_content_is_empty_output() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async { Json(json!({ "choices": [] })) }),
        );
        let base = serve(router).await;

        let provider = GroqProvider::new(base, "gsk_test", Duration::from_secs(5)).unwrap();
        assert_eq!(provider.complete("m", "p").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_http_error_is_provider_error() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async { (axum::http::StatusCode::TOO_MANY_REQUESTS, "rate limited") }),
        );
        let base = serve(router).await;

        let provider = GroqProvider::new(base, "gsk_test", Duration::from_secs(5)).unwrap();
        let err = provider.complete("m", "p").await.unwrap_err();
        assert!(matches!(err, VeritasError::Provider { .. }));
        assert_eq!(err.class(), veritas_core::ErrorClass::Transient);
    }
}
