//! Ledger access: the request contract seen through JSON-RPC.

pub mod abi;
pub mod contract;
pub mod rpc;
pub mod tx;

use async_trait::async_trait;
use veritas_core::{InferenceRequest, InferenceResult, LedgerRequest, RequestId, Result, StoragePointer, B256};

pub use contract::JsonRpcLedger;
pub use rpc::RpcClient;
pub use tx::{TxReceipt, TxSigner};

/// Operations the worker needs from the request ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Number of requests ever created. Identifiers are `0..total`.
    async fn total_requests(&self) -> Result<u64>;

    /// Request record and its fulfillment flag.
    async fn get_request(&self, id: RequestId) -> Result<LedgerRequest>;

    /// Submitted result, or `None` while the request is unfulfilled.
    async fn get_result(&self, id: RequestId) -> Result<Option<InferenceResult>>;

    /// Write the result and wait for confirmation.
    async fn submit_result(
        &self,
        id: RequestId,
        result_hash: &B256,
        pointer: &StoragePointer,
    ) -> Result<TxReceipt>;

    /// Current head block number.
    async fn latest_block(&self) -> Result<u64>;

    /// Request-created events in the inclusive block range.
    async fn requested_events(&self, from_block: u64, to_block: u64) -> Result<Vec<InferenceRequest>>;
}
