//! Content-addressed storage seam and the indexer-backed client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Value};
use tracing::{debug, info};
use veritas_core::content::{chunk_count, CHUNK_SIZE};
use veritas_core::{Address, Result, VeritasError, B256};

use crate::ledger::abi::{encode_call, Token};
use crate::ledger::{RpcClient, TxSigner};

/// Chunks per uploaded segment.
const SEGMENT_CHUNKS: usize = 1024;

const FLOW_SUBMIT: &str = "submit((uint256,bytes,(bytes32,uint256)[]))";

/// A store addressed by the hash of what it holds.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Address `bytes` would be stored under. Computed locally.
    fn content_address(&self, bytes: &[u8]) -> B256 {
        veritas_core::content_address(bytes)
    }

    /// True if content with this address is already stored.
    async fn exists(&self, root: &B256) -> Result<bool>;

    /// Store `bytes` under `root`.
    async fn upload(&self, root: &B256, bytes: &[u8]) -> Result<()>;

    /// Fetch the content stored under `root`.
    async fn download(&self, root: &B256) -> Result<Vec<u8>>;
}

/// Storage network client: indexer JSON-RPC for reads and segment upload,
/// flow contract transaction to register each new file.
pub struct IndexerStore {
    base_url: String,
    rpc: RpcClient,
    http: reqwest::Client,
    signer: Arc<TxSigner>,
    flow_contract: Address,
    sync_attempts: u32,
    sync_interval: Duration,
}

impl IndexerStore {
    pub fn new(
        base_url: impl Into<String>,
        flow_contract: Address,
        signer: Arc<TxSigner>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VeritasError::Storage(e.to_string()))?;

        Ok(Self {
            rpc: RpcClient::new(base_url.clone(), timeout)?,
            base_url,
            http,
            signer,
            flow_contract,
            sync_attempts: 10,
            sync_interval: Duration::from_millis(1_000),
        })
    }

    async fn file_info(&self, root: &B256) -> Result<Option<Value>> {
        self.rpc
            .call_optional("zgs_getFileInfo", json!([root.to_hex()]))
            .await
            .map_err(|e| VeritasError::Storage(e.to_string()))
    }

    /// Register the file with the flow contract so storage nodes accept its segments.
    async fn submit_to_flow(&self, root: &B256, len: usize) -> Result<()> {
        let chunks = chunk_count(len).max(1);
        let height = chunks.next_power_of_two().trailing_zeros() as u128;

        let calldata = encode_call(
            FLOW_SUBMIT,
            &[Token::Tuple(vec![
                Token::Uint(len as u128),
                Token::Bytes(Vec::new()),
                Token::Array(vec![Token::Tuple(vec![
                    Token::FixedBytes(*root),
                    Token::Uint(height),
                ])]),
            ])],
        );

        let receipt = self
            .signer
            .send(self.flow_contract, calldata, 0)
            .await
            .map_err(|e| VeritasError::Storage(format!("flow submission failed: {e}")))?;
        debug!("Flow submission for {} mined in block {}", root, receipt.block_number);
        Ok(())
    }

    async fn wait_for_sync(&self, root: &B256) -> Result<()> {
        for _ in 0..self.sync_attempts {
            if self.file_info(root).await?.is_some() {
                return Ok(());
            }
            tokio::time::sleep(self.sync_interval).await;
        }
        Err(VeritasError::Storage(format!("storage nodes never saw {root}")))
    }
}

#[async_trait]
impl ContentStore for IndexerStore {
    async fn exists(&self, root: &B256) -> Result<bool> {
        let info = self.file_info(root).await?;
        Ok(info.is_some_and(|i| i.get("finalized").and_then(Value::as_bool).unwrap_or(true)))
    }

    async fn upload(&self, root: &B256, bytes: &[u8]) -> Result<()> {
        self.submit_to_flow(root, bytes.len()).await?;
        self.wait_for_sync(root).await?;

        let segments: Vec<Value> = bytes
            .chunks(SEGMENT_CHUNKS * CHUNK_SIZE)
            .enumerate()
            .map(|(index, segment)| {
                json!({
                    "root": root.to_hex(),
                    "index": index,
                    "data": base64::engine::general_purpose::STANDARD.encode(segment),
                    "fileSize": bytes.len(),
                })
            })
            .collect();
        let count = segments.len();

        self.rpc
            .call_optional::<Value>("zgs_uploadSegments", json!([segments]))
            .await
            .map_err(|e| VeritasError::Storage(format!("segment upload failed: {e}")))?;

        info!("📦 Uploaded {} bytes in {} segment(s) as {}", bytes.len(), count, root);
        Ok(())
    }

    async fn download(&self, root: &B256) -> Result<Vec<u8>> {
        let url = format!("{}/download/{}", self.base_url, root.to_hex());
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| VeritasError::Storage(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(VeritasError::NotFound {
                resource_type: "content".to_string(),
                id: root.to_hex(),
            });
        }
        let response = response
            .error_for_status()
            .map_err(|e| VeritasError::Storage(e.to_string()))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| VeritasError::Storage(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use veritas_core::NodeKey;

    const STORED: &str = "stored package";

    async fn rpc_handler(Json(body): Json<Value>) -> Json<Value> {
        let id = body["id"].clone();
        let result = match body["method"].as_str() {
            Some("eth_chainId") => json!("0x4115"),
            Some("zgs_getFileInfo") => {
                let root = body["params"][0].as_str().unwrap_or_default();
                if root == veritas_core::content_address(STORED.as_bytes()).to_hex() {
                    json!({ "finalized": true })
                } else {
                    Value::Null
                }
            }
            _ => Value::Null,
        };
        Json(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
    }

    async fn download_handler(Path(root): Path<String>) -> impl IntoResponse {
        if root == veritas_core::content_address(STORED.as_bytes()).to_hex() {
            (StatusCode::OK, STORED.as_bytes().to_vec())
        } else {
            (StatusCode::NOT_FOUND, Vec::new())
        }
    }

    async fn store() -> IndexerStore {
        let router = Router::new()
            .route("/", post(rpc_handler))
            .route("/download/:root", get(download_handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let rpc = Arc::new(RpcClient::new(base.clone(), Duration::from_secs(5)).unwrap());
        let signer = TxSigner::connect(rpc, NodeKey::random(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(signer.chain_id(), 16661);

        IndexerStore::new(base, Address::default(), Arc::new(signer), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_exists_and_download() {
        let store = store().await;
        let root = store.content_address(STORED.as_bytes());

        assert!(store.exists(&root).await.unwrap());
        assert!(!store.exists(&B256([9; 32])).await.unwrap());
        assert_eq!(store.download(&root).await.unwrap(), STORED.as_bytes());
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let store = store().await;
        let err = store.download(&B256([9; 32])).await.unwrap_err();
        assert!(matches!(err, VeritasError::NotFound { .. }));
    }
}
