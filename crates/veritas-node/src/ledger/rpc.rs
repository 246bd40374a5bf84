//! Minimal JSON-RPC 2.0 client over HTTP.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use veritas_core::{Result, VeritasError};

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC client bound to one endpoint.
pub struct RpcClient {
    url: String,
    http: reqwest::Client,
    timeout: Duration,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VeritasError::ConnectionError(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            http,
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    /// Call `method` and deserialize a non-null result.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.call_raw(method, params).await?;
        if value.is_null() {
            return Err(VeritasError::Ledger(format!("{method} returned null")));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Call `method` where a null result is meaningful.
    pub async fn call_optional<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>> {
        let value = self.call_raw(method, params).await?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    async fn call_raw(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!("rpc → {} #{}", method, id);

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VeritasError::Timeout {
                        duration_ms: self.timeout.as_millis() as u64,
                        message: format!("{method}: {e}"),
                    }
                } else {
                    VeritasError::ConnectionError(format!("{method}: {e}"))
                }
            })?
            .error_for_status()
            .map_err(|e| VeritasError::ConnectionError(format!("{method}: {e}")))?;

        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|e| VeritasError::SerializationError(format!("{method}: {e}")))?;

        if let Some(err) = parsed.error {
            return Err(VeritasError::Ledger(format!(
                "{method} failed ({}): {}",
                err.code, err.message
            )));
        }

        Ok(parsed.result.unwrap_or(Value::Null))
    }
}

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_quantity(raw: &str) -> Result<u128> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| VeritasError::SerializationError(format!("bad quantity {raw}: {e}")))
}

/// Format a hex quantity without leading zeros.
pub fn quantity(value: u128) -> String {
    format!("0x{:x}", value)
}

/// `0x`-prefixed hex of arbitrary bytes.
pub fn hex_data(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}
