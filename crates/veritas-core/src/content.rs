//! Content-address derivation.
//!
//! Data is split into fixed 256-byte chunks (the last one zero-padded), each
//! chunk is hashed, and the leaves are folded pairwise into a Keccak merkle
//! root. The root identifies the content independent of where it is stored.

use sha3::{Digest, Keccak256};

use crate::types::B256;

/// Chunk size of the storage layer's merkle leaves.
pub const CHUNK_SIZE: usize = 256;

/// Derive the content address of `data`.
pub fn content_address(data: &[u8]) -> B256 {
    let mut hashes: Vec<[u8; 32]> = if data.is_empty() {
        vec![hash_chunk(&[])]
    } else {
        data.chunks(CHUNK_SIZE).map(hash_chunk).collect()
    };

    while hashes.len() > 1 {
        let mut next_level = Vec::with_capacity(hashes.len().div_ceil(2));

        for chunk in hashes.chunks(2) {
            let mut hasher = Keccak256::new();
            hasher.update(chunk[0]);
            // Odd node out is paired with itself
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next_level.push(hasher.finalize().into());
        }

        hashes = next_level;
    }

    B256(hashes[0])
}

/// Number of chunks `len` bytes occupy.
pub fn chunk_count(len: usize) -> usize {
    len.div_ceil(CHUNK_SIZE).max(1)
}

fn hash_chunk(chunk: &[u8]) -> [u8; 32] {
    let mut padded = [0u8; CHUNK_SIZE];
    padded[..chunk.len()].copy_from_slice(chunk);
    Keccak256::digest(padded).into()
}
