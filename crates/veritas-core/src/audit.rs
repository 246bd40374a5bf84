//! Audit packages and storage pointers.
//!
//! An AuditPackage is the full record of one fulfillment. It is serialized
//! once, content-addressed, and published so anyone can recompute the
//! result commitment from the recorded output.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::commitment::commit_output;
use crate::error::{Result, VeritasError};
use crate::types::{Address, RequestId, B256};

/// Wire prefix of a degraded pointer.
pub const FALLBACK_PREFIX: &str = "FALLBACK:";

/// Number of characters of the result hash string kept in a degraded pointer.
const FALLBACK_HASH_CHARS: usize = 32;

/// The full record bundled before publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditPackage {
    /// Request identifier, decimal string.
    pub request_id: String,

    /// On-chain prompt commitment.
    pub prompt_hash: B256,

    /// The prompt the model actually saw.
    pub prompt: String,

    /// The model that produced the output.
    pub model: String,

    /// Raw provider output.
    pub output: String,

    /// Commitment over `output`.
    pub result_hash: B256,

    /// Wall-clock time of packaging, unix milliseconds.
    pub timestamp: i64,

    /// Fulfilling node.
    pub node: Address,
}

impl AuditPackage {
    /// Package a fulfillment, computing the result commitment from `output`.
    pub fn new(
        request_id: RequestId,
        prompt_hash: B256,
        prompt: impl Into<String>,
        model: impl Into<String>,
        output: impl Into<String>,
        node: Address,
    ) -> Self {
        let output = output.into();
        Self {
            request_id: request_id.to_string(),
            prompt_hash,
            prompt: prompt.into(),
            model: model.into(),
            result_hash: commit_output(&output),
            output,
            timestamp: Utc::now().timestamp_millis(),
            node,
        }
    }

    /// Canonical byte form: compact JSON, keys in declaration order.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a published package.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Check that the recorded output reproduces the recorded commitment.
    pub fn verify(&self) -> bool {
        commit_output(&self.output) == self.result_hash
    }

    /// Check the recorded output against an externally supplied commitment.
    pub fn verify_against(&self, on_chain: &B256) -> bool {
        self.verify() && self.result_hash == *on_chain
    }
}

/// Where the audit package for a result can be found.
///
/// A degraded pointer means publication failed: the request was still
/// fulfilled, but the record cannot be fetched and checked by third parties.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoragePointer {
    /// Content address of a published package.
    ContentAddress(B256),
    /// Locally built marker derived from the result commitment.
    Degraded(String),
}

impl StoragePointer {
    /// Build the degraded pointer for a result commitment.
    pub fn degraded(result_hash: &B256) -> Self {
        let hex = result_hash.to_hex();
        StoragePointer::Degraded(hex[..FALLBACK_HASH_CHARS].to_string())
    }

    /// Returns true if the package can be fetched and verified.
    pub fn is_verifiable(&self) -> bool {
        matches!(self, StoragePointer::ContentAddress(_))
    }

    /// The content address, if published.
    pub fn content_address(&self) -> Option<&B256> {
        match self {
            StoragePointer::ContentAddress(root) => Some(root),
            StoragePointer::Degraded(_) => None,
        }
    }
}

impl fmt::Display for StoragePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoragePointer::ContentAddress(root) => write!(f, "{}", root),
            StoragePointer::Degraded(marker) => write!(f, "{}{}", FALLBACK_PREFIX, marker),
        }
    }
}

impl FromStr for StoragePointer {
    type Err = VeritasError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(marker) = s.strip_prefix(FALLBACK_PREFIX) {
            return Ok(StoragePointer::Degraded(marker.to_string()));
        }
        s.parse::<B256>()
            .map(StoragePointer::ContentAddress)
            .map_err(|_| {
                VeritasError::SerializationError(format!("unrecognized storage pointer: {s}"))
            })
    }
}

impl Serialize for StoragePointer {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for StoragePointer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
