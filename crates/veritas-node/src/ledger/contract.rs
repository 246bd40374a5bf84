//! [`Ledger`] implementation for the inference request contract.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use veritas_core::{
    Address, InferenceRequest, InferenceResult, LedgerRequest, RequestId, Result, StoragePointer,
    VeritasError, B256,
};

use super::abi::{encode_call, event_topic, offset_add, AbiReader, Token};
use super::rpc::{hex_data, parse_quantity, quantity, RpcClient};
use super::tx::{TxReceipt, TxSigner};
use super::Ledger;

pub const INFERENCE_REQUESTED: &str = "InferenceRequested(uint256,address,bytes32,string,uint256)";
const GET_REQUEST: &str = "getRequest(uint256)";
const GET_RESULT: &str = "getResult(uint256)";
const SUBMIT_RESULT: &str = "submitResult(uint256,bytes32,string)";
const TOTAL_REQUESTS: &str = "totalRequests()";

#[derive(Debug, Deserialize)]
struct RawLog {
    topics: Vec<B256>,
    data: String,
    #[serde(default)]
    removed: bool,
}

/// The request contract, reached over JSON-RPC and written with the node key.
pub struct JsonRpcLedger {
    contract: Address,
    rpc: Arc<RpcClient>,
    signer: Arc<TxSigner>,
}

impl JsonRpcLedger {
    pub fn new(contract: Address, signer: Arc<TxSigner>) -> Self {
        Self {
            contract,
            rpc: signer.rpc().clone(),
            signer,
        }
    }

    async fn eth_call(&self, calldata: Vec<u8>) -> Result<Vec<u8>> {
        let raw: String = self
            .rpc
            .call(
                "eth_call",
                json!([{ "to": self.contract.to_string(), "data": hex_data(&calldata) }, "latest"]),
            )
            .await?;
        Ok(hex::decode(raw.trim_start_matches("0x"))?)
    }
}

#[async_trait]
impl Ledger for JsonRpcLedger {
    async fn total_requests(&self) -> Result<u64> {
        let data = self.eth_call(encode_call(TOTAL_REQUESTS, &[])).await?;
        AbiReader::new(&data).uint(0)
    }

    async fn get_request(&self, id: RequestId) -> Result<LedgerRequest> {
        let data = self
            .eth_call(encode_call(GET_REQUEST, &[Token::Uint(id as u128)]))
            .await?;
        decode_request(id, &data)
    }

    async fn get_result(&self, id: RequestId) -> Result<Option<InferenceResult>> {
        let data = self
            .eth_call(encode_call(GET_RESULT, &[Token::Uint(id as u128)]))
            .await?;
        decode_result(&data)
    }

    async fn submit_result(
        &self,
        id: RequestId,
        result_hash: &B256,
        pointer: &StoragePointer,
    ) -> Result<TxReceipt> {
        let calldata = encode_call(
            SUBMIT_RESULT,
            &[
                Token::Uint(id as u128),
                Token::FixedBytes(*result_hash),
                Token::String(pointer.to_string()),
            ],
        );

        let receipt = self
            .signer
            .send(self.contract, calldata, 0)
            .await
            .map_err(|e| VeritasError::Submission {
                request_id: id,
                message: e.to_string(),
            })?;

        info!(
            "⛓️  submitResult mined for request {} in block {} ({})",
            id, receipt.block_number, receipt.tx_hash
        );
        Ok(receipt)
    }

    async fn latest_block(&self) -> Result<u64> {
        let raw: String = self.rpc.call("eth_blockNumber", json!([])).await?;
        Ok(parse_quantity(&raw)? as u64)
    }

    async fn requested_events(&self, from_block: u64, to_block: u64) -> Result<Vec<InferenceRequest>> {
        let logs: Vec<RawLog> = self
            .rpc
            .call(
                "eth_getLogs",
                json!([{
                    "address": self.contract.to_string(),
                    "fromBlock": quantity(from_block as u128),
                    "toBlock": quantity(to_block as u128),
                    "topics": [event_topic(INFERENCE_REQUESTED).to_hex()],
                }]),
            )
            .await?;

        let mut requests = Vec::with_capacity(logs.len());
        for log in logs.into_iter().filter(|l| !l.removed) {
            match decode_event(&log.topics, &hex::decode(log.data.trim_start_matches("0x"))?) {
                Ok(request) => requests.push(request),
                Err(e) => debug!("Skipping undecodable log: {}", e),
            }
        }
        Ok(requests)
    }
}

fn decode_request(id: RequestId, data: &[u8]) -> Result<LedgerRequest> {
    let reader = AbiReader::new(data);
    let base = reader.offset(0, 0)?;
    let field = |n: usize| offset_add(base, n);

    let requester = reader.address(base)?;
    if requester == Address::default() {
        return Err(VeritasError::NotFound {
            resource_type: "request".to_string(),
            id: id.to_string(),
        });
    }

    Ok(LedgerRequest {
        request: InferenceRequest {
            id,
            requester,
            prompt_hash: reader.fixed_bytes(field(32)?)?,
            model_id: reader.string(base, field(64)?)?,
            timestamp: reader.uint(field(96)?)?,
        },
        fulfilled: reader.boolean(field(128)?)?,
    })
}

fn decode_result(data: &[u8]) -> Result<Option<InferenceResult>> {
    let reader = AbiReader::new(data);
    let base = reader.offset(0, 0)?;
    let field = |n: usize| offset_add(base, n);

    let node = reader.address(field(64)?)?;
    if node == Address::default() {
        return Ok(None);
    }

    let pointer = reader.string(base, field(32)?)?;
    Ok(Some(InferenceResult {
        result_hash: reader.fixed_bytes(base)?,
        storage_pointer: pointer.parse()?,
        node,
        timestamp: reader.uint(field(96)?)?,
    }))
}

fn decode_event(topics: &[B256], data: &[u8]) -> Result<InferenceRequest> {
    if topics.len() < 3 || topics[0] != event_topic(INFERENCE_REQUESTED) {
        return Err(VeritasError::Ledger("not an InferenceRequested log".to_string()));
    }

    let id_reader = AbiReader::new(topics[1].as_bytes());
    let requester_reader = AbiReader::new(topics[2].as_bytes());
    let reader = AbiReader::new(data);

    Ok(InferenceRequest {
        id: id_reader.uint(0)?,
        requester: requester_reader.address(0)?,
        prompt_hash: reader.fixed_bytes(0)?,
        model_id: reader.string(0, 32)?,
        timestamp: reader.uint(64)?,
    })
}
