//! Result commitments.
//!
//! The on-chain commitment is Keccak-256 over the exact UTF-8 bytes of the
//! provider output. Nothing is trimmed, normalized or wrapped: a third party
//! holding the published output must reproduce the hash bit-for-bit.

use sha3::{Digest, Keccak256};

use crate::types::B256;

/// Keccak-256 of arbitrary bytes.
pub fn keccak256(input: &[u8]) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(input);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    B256(out)
}

/// Commitment for a provider output.
pub fn commit_output(output: &str) -> B256 {
    keccak256(output.as_bytes())
}

/// Commitment for a plaintext prompt, matching what clients put on the ledger.
pub fn commit_prompt(prompt: &str) -> B256 {
    keccak256(prompt.as_bytes())
}

/// Check an output against a published commitment.
pub fn verify_output(output: &str, expected: &B256) -> bool {
    commit_output(output) == *expected
}
