//! Legacy (EIP-155) transaction encoding, signing and submission.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};
use veritas_core::{keccak256, Address, NodeKey, Result, VeritasError, B256};

use super::rpc::{hex_data, parse_quantity, quantity, RpcClient};

/// Item of a recursive-length-prefix encoding.
#[derive(Debug, Clone)]
pub enum Rlp {
    Bytes(Vec<u8>),
    List(Vec<Rlp>),
}

impl Rlp {
    /// Unsigned integer in minimal big-endian form.
    pub fn uint(value: u128) -> Self {
        let bytes = value.to_be_bytes();
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        Rlp::Bytes(bytes[first..].to_vec())
    }

    /// 32-byte scalar with leading zeros stripped.
    pub fn scalar(bytes: &[u8; 32]) -> Self {
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        Rlp::Bytes(bytes[first..].to_vec())
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Rlp::Bytes(bytes) if bytes.len() == 1 && bytes[0] < 0x80 => bytes.clone(),
            Rlp::Bytes(bytes) => {
                let mut out = length_prefix(0x80, bytes.len());
                out.extend_from_slice(bytes);
                out
            }
            Rlp::List(items) => {
                let payload: Vec<u8> = items.iter().flat_map(Rlp::encode).collect();
                let mut out = length_prefix(0xc0, payload.len());
                out.extend(payload);
                out
            }
        }
    }
}

fn length_prefix(offset: u8, len: usize) -> Vec<u8> {
    if len < 56 {
        return vec![offset + len as u8];
    }
    let len_bytes = len.to_be_bytes();
    let first = len_bytes.iter().position(|b| *b != 0).unwrap_or(len_bytes.len());
    let len_bytes = &len_bytes[first..];
    let mut out = vec![offset + 55 + len_bytes.len() as u8];
    out.extend_from_slice(len_bytes);
    out
}

/// Unsigned legacy transaction.
#[derive(Debug, Clone)]
pub struct LegacyTx {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: Address,
    pub value: u128,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

impl LegacyTx {
    fn fields(&self) -> Vec<Rlp> {
        vec![
            Rlp::uint(self.nonce as u128),
            Rlp::uint(self.gas_price),
            Rlp::uint(self.gas_limit as u128),
            Rlp::Bytes(self.to.as_bytes().to_vec()),
            Rlp::uint(self.value),
            Rlp::Bytes(self.data.clone()),
        ]
    }

    /// Digest signed under EIP-155 replay protection.
    pub fn signing_hash(&self) -> B256 {
        let mut fields = self.fields();
        fields.push(Rlp::uint(self.chain_id as u128));
        fields.push(Rlp::uint(0));
        fields.push(Rlp::uint(0));
        keccak256(&Rlp::List(fields).encode())
    }

    /// Raw signed transaction bytes, ready for `eth_sendRawTransaction`.
    pub fn sign(&self, key: &NodeKey) -> Result<Vec<u8>> {
        let (r, s, recovery_id) = key.sign_digest(&self.signing_hash())?;
        let v = recovery_id as u128 + self.chain_id as u128 * 2 + 35;

        let mut fields = self.fields();
        fields.push(Rlp::uint(v));
        fields.push(Rlp::scalar(&r));
        fields.push(Rlp::scalar(&s));
        Ok(Rlp::List(fields).encode())
    }
}

/// Mined transaction summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    block_number: Option<String>,
}

/// Signs and sends transactions from the node account. Nonces are assigned
/// under a lock so concurrent senders do not collide.
pub struct TxSigner {
    rpc: Arc<RpcClient>,
    key: NodeKey,
    chain_id: u64,
    nonce_lock: Mutex<()>,
    confirm_timeout: Duration,
    poll_interval: Duration,
}

impl TxSigner {
    /// Query the chain id and build a signer.
    pub async fn connect(rpc: Arc<RpcClient>, key: NodeKey, confirm_timeout: Duration) -> Result<Self> {
        let raw: String = rpc.call("eth_chainId", json!([])).await?;
        let chain_id = parse_quantity(&raw)? as u64;
        info!("🔗 Connected to chain {} as {}", chain_id, key.address());

        Ok(Self {
            rpc,
            key,
            chain_id,
            nonce_lock: Mutex::new(()),
            confirm_timeout,
            poll_interval: Duration::from_millis(1_000),
        })
    }

    pub fn address(&self) -> Address {
        self.key.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    /// Sign, send and wait for `data` to be mined against `to`.
    pub async fn send(&self, to: Address, data: Vec<u8>, value: u128) -> Result<TxReceipt> {
        let tx_hash = {
            let _nonce = self.nonce_lock.lock().await;
            let from = self.address().to_string();

            let nonce: String = self
                .rpc
                .call("eth_getTransactionCount", json!([from, "pending"]))
                .await?;
            let gas_price: String = self.rpc.call("eth_gasPrice", json!([])).await?;
            let estimate: String = self
                .rpc
                .call(
                    "eth_estimateGas",
                    json!([{
                        "from": from,
                        "to": to.to_string(),
                        "data": hex_data(&data),
                        "value": quantity(value),
                    }]),
                )
                .await?;

            let tx = LegacyTx {
                nonce: parse_quantity(&nonce)? as u64,
                gas_price: parse_quantity(&gas_price)?,
                // 20% headroom over the estimate
                gas_limit: (parse_quantity(&estimate)? as u64).saturating_mul(12) / 10,
                to,
                value,
                data,
                chain_id: self.chain_id,
            };

            let raw = tx.sign(&self.key)?;
            let hash: String = self
                .rpc
                .call("eth_sendRawTransaction", json!([hex_data(&raw)]))
                .await?;
            debug!("Sent tx {} (nonce {})", hash, tx.nonce);
            hash.parse::<B256>()?
        };

        self.wait_for_receipt(tx_hash).await
    }

    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<TxReceipt> {
        let deadline = tokio::time::Instant::now() + self.confirm_timeout;

        loop {
            let receipt: Option<RawReceipt> = self
                .rpc
                .call_optional("eth_getTransactionReceipt", json!([tx_hash.to_hex()]))
                .await?;

            if let Some(receipt) = receipt {
                if receipt.status.as_deref() == Some("0x0") {
                    return Err(VeritasError::Ledger(format!("transaction {tx_hash} reverted")));
                }
                let block_number = match receipt.block_number {
                    Some(raw) => parse_quantity(&raw)? as u64,
                    None => 0,
                };
                return Ok(TxReceipt {
                    tx_hash,
                    block_number,
                });
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(VeritasError::Timeout {
                    duration_ms: self.confirm_timeout.as_millis() as u64,
                    message: format!("transaction {tx_hash} not mined"),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rlp_vectors() {
        assert_eq!(Rlp::Bytes(b"dog".to_vec()).encode(), hex::decode("83646f67").unwrap());
        assert_eq!(
            Rlp::List(vec![Rlp::Bytes(b"cat".to_vec()), Rlp::Bytes(b"dog".to_vec())]).encode(),
            hex::decode("c88363617483646f67").unwrap()
        );
        assert_eq!(Rlp::uint(0).encode(), vec![0x80]);
        assert_eq!(Rlp::uint(15).encode(), vec![0x0f]);
        assert_eq!(Rlp::uint(1024).encode(), vec![0x82, 0x04, 0x00]);
        assert_eq!(Rlp::List(vec![]).encode(), vec![0xc0]);
    }

    #[test]
    fn test_rlp_long_string() {
        let long = vec![b'a'; 60];
        let encoded = Rlp::Bytes(long.clone()).encode();
        assert_eq!(&encoded[..2], &[0xb8, 60]);
        assert_eq!(&encoded[2..], long.as_slice());
    }

    fn eip155_example() -> LegacyTx {
        LegacyTx {
            nonce: 9,
            gas_price: 20_000_000_000,
            gas_limit: 21_000,
            to: "0x3535353535353535353535353535353535353535".parse().unwrap(),
            value: 1_000_000_000_000_000_000,
            data: vec![],
            chain_id: 1,
        }
    }

    #[test]
    fn test_eip155_signing_hash() {
        assert_eq!(
            eip155_example().signing_hash().to_hex(),
            "0xdaf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53"
        );
    }

    #[test]
    fn test_eip155_signed_transaction() {
        let key = NodeKey::from_hex(
            "0x4646464646464646464646464646464646464646464646464646464646464646",
        )
        .unwrap();
        let raw = eip155_example().sign(&key).unwrap();
        assert_eq!(
            hex::encode(raw),
            "f86c098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a7640000\
             8025a028ef61340bd939bc2195fe537567866003e1a15d3c71ff63e1590620aa636276a067cbe9d8997f76\
             1aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83"
        );
    }
}
