//! Common types used across the Veritas worker.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::audit::StoragePointer;
use crate::commitment::keccak256;
use crate::envelope::PromptPayload;
use crate::error::{Result, VeritasError};

/// Ledger-assigned request identifier. Monotonically increasing from zero.
pub type RequestId = u64;

/// A fixed-width 32-byte hash (prompt commitment, result commitment, content address).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct B256(pub [u8; 32]);

impl B256 {
    /// The all-zero hash.
    pub const ZERO: B256 = B256([0u8; 32]);

    /// Build from a slice, which must be exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            VeritasError::SerializationError(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// `0x`-prefixed lowercase hex.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for B256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for B256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B256({})", self.to_hex())
    }
}

impl FromStr for B256 {
    type Err = VeritasError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        if raw.len() != 64 {
            return Err(VeritasError::SerializationError(format!(
                "expected 64 hex characters, got {}",
                raw.len()
            )));
        }
        B256::from_slice(&hex::decode(raw)?)
    }
}

impl Serialize for B256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for B256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A 20-byte ledger account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 20] = bytes.try_into().map_err(|_| {
            VeritasError::SerializationError(format!("expected 20 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// EIP-55 mixed-case checksum encoding.
    pub fn to_checksum(&self) -> String {
        let lower = hex::encode(self.0);
        let digest = keccak256(lower.as_bytes());
        let mut out = String::with_capacity(42);
        out.push_str("0x");
        for (i, c) in lower.chars().enumerate() {
            let nibble = (digest.0[i / 2] >> if i % 2 == 0 { 4 } else { 0 }) & 0x0f;
            if c.is_ascii_alphabetic() && nibble >= 8 {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_checksum())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_checksum())
    }
}

impl FromStr for Address {
    type Err = VeritasError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        if raw.len() != 40 {
            return Err(VeritasError::SerializationError(format!(
                "expected 40 hex characters, got {}",
                raw.len()
            )));
        }
        Address::from_slice(&hex::decode(raw)?)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_checksum())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An inference request as recorded on the ledger. Read-only for the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    /// Ledger-assigned identifier.
    pub id: RequestId,

    /// Account that paid for the request.
    pub requester: Address,

    /// Commitment to the prompt text.
    pub prompt_hash: B256,

    /// Requested model. Empty means "use the worker default".
    pub model_id: String,

    /// Ledger timestamp (unix seconds).
    pub timestamp: u64,
}

/// A request together with its fulfillment flag, as returned by `getRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRequest {
    pub request: InferenceRequest,
    pub fulfilled: bool,
}

/// The result written back to the ledger. Written once per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResult {
    pub result_hash: B256,
    pub storage_pointer: StoragePointer,
    pub node: Address,
    pub timestamp: u64,
}

/// A prompt delivered out-of-band, keyed by the request it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    /// Plaintext or encrypted prompt.
    pub prompt: PromptPayload,

    /// Commitment the client claims for this prompt.
    pub prompt_hash: Option<B256>,

    /// When the bridge accepted the registration.
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

/// Where a request identifier is in the fulfillment pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    /// Guard acquired, no work started.
    Guarded,
    /// Opening the registered prompt envelope.
    Decrypting,
    /// Waiting on the inference provider.
    Inferring,
    /// Computing the result commitment.
    Hashing,
    /// Publishing the audit package.
    Publishing,
    /// Writing the result to the ledger.
    Submitting,
    /// Result confirmed on the ledger.
    Fulfilled,
}

impl ProcessingStage {
    /// Returns true if this is the terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStage::Fulfilled)
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessingStage::Guarded => "guarded",
            ProcessingStage::Decrypting => "decrypting",
            ProcessingStage::Inferring => "inferring",
            ProcessingStage::Hashing => "hashing",
            ProcessingStage::Publishing => "publishing",
            ProcessingStage::Submitting => "submitting",
            ProcessingStage::Fulfilled => "fulfilled",
        };
        f.write_str(name)
    }
}
