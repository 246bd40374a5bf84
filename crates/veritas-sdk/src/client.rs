//! Worker bridge client.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use veritas_core::envelope::encrypt;
use veritas_core::identity::parse_public_key;
use veritas_core::{commit_prompt, Address, PromptPayload, RequestId, Result, VeritasError, B256};

/// Identity reported by `GET /health`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealth {
    pub status: String,
    pub node: Address,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Client for a worker's prompt registry bridge.
#[derive(Clone)]
pub struct WorkerClient {
    base_url: String,
    http_client: reqwest::Client,
    health: NodeHealth,
}

impl WorkerClient {
    /// Connect to a worker and read its identity.
    pub async fn connect(url: &str) -> Result<Self> {
        let base_url = url.trim_end_matches('/').to_string();
        let http_client = reqwest::Client::new();
        let health = fetch_health(&http_client, &base_url).await?;
        debug!("Connected to worker {} at {}", health.node, base_url);

        Ok(Self {
            base_url,
            http_client,
            health,
        })
    }

    /// Identity read at connect time.
    pub fn node(&self) -> &NodeHealth {
        &self.health
    }

    /// True if the worker advertises an encryption key.
    pub fn encrypts(&self) -> bool {
        self.health.public_key.is_some()
    }

    /// Re-query the worker's health.
    pub async fn health(&self) -> Result<NodeHealth> {
        fetch_health(&self.http_client, &self.base_url).await
    }

    /// Register `prompt` for `request_id`, encrypted to the worker when it
    /// publishes a key. Returns the prompt commitment to put on the ledger.
    pub async fn register_prompt(&self, request_id: RequestId, prompt: &str) -> Result<B256> {
        if prompt.is_empty() {
            return Err(VeritasError::InvalidRegistration("prompt is empty".to_string()));
        }

        let prompt_hash = commit_prompt(prompt);
        let payload = match &self.health.public_key {
            Some(key) => PromptPayload::Encrypted(encrypt(&parse_public_key(key)?, prompt)?),
            None => PromptPayload::Plain(prompt.to_string()),
        };

        let url = format!("{}/register-prompt", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&json!({
                "requestId": request_id.to_string(),
                "prompt": payload,
                "promptHash": prompt_hash,
            }))
            .send()
            .await
            .map_err(|e| VeritasError::ConnectionError(e.to_string()))?;

        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let message = body["error"].as_str().unwrap_or("rejected").to_string();
            return Err(VeritasError::InvalidRegistration(message));
        }
        response
            .error_for_status()
            .map_err(|e| VeritasError::ConnectionError(e.to_string()))?;

        Ok(prompt_hash)
    }

    /// Ask the worker to re-queue a request it has not fulfilled.
    pub async fn retry(&self, request_id: RequestId) -> Result<()> {
        let url = format!("{}/requests/{}/retry", self.base_url, request_id);
        let response = self
            .http_client
            .post(&url)
            .send()
            .await
            .map_err(|e| VeritasError::ConnectionError(e.to_string()))?;

        match response.status().as_u16() {
            404 => Err(VeritasError::NotFound {
                resource_type: "request".to_string(),
                id: request_id.to_string(),
            }),
            409 => Err(VeritasError::InvalidRegistration(format!(
                "request {request_id} is already fulfilled"
            ))),
            _ => {
                response
                    .error_for_status()
                    .map_err(|e| VeritasError::ConnectionError(e.to_string()))?;
                Ok(())
            }
        }
    }
}

async fn fetch_health(http_client: &reqwest::Client, base_url: &str) -> Result<NodeHealth> {
    http_client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .map_err(|e| VeritasError::ConnectionError(e.to_string()))?
        .error_for_status()
        .map_err(|e| VeritasError::ConnectionError(e.to_string()))?
        .json()
        .await
        .map_err(|e| VeritasError::SerializationError(e.to_string()))
}
