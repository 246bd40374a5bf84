//! Node identity: the secp256k1 key that signs ledger transactions and
//! opens encrypted prompt envelopes.

use std::fmt;

use k256::ecdsa::{RecoveryId, Signature, SigningKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};

use crate::commitment::keccak256;
use crate::error::{Result, VeritasError};
use crate::types::{Address, B256};

/// The worker's signing identity.
#[derive(Clone)]
pub struct NodeKey {
    secret: SecretKey,
    address: Address,
}

impl NodeKey {
    /// Parse a hex private key, with or without `0x`.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let raw = hex::decode(hex_key.trim().trim_start_matches("0x"))?;
        let secret = SecretKey::from_slice(&raw)
            .map_err(|e| VeritasError::CryptoError(format!("invalid private key: {e}")))?;
        Ok(Self::from_secret(secret))
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        let address = address_of(&secret.public_key());
        Self { secret, address }
    }

    /// Generate a fresh random key.
    pub fn random() -> Self {
        Self::from_secret(SecretKey::random(&mut rand::rngs::OsRng))
    }

    /// Ledger address derived from the public key.
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    /// Uncompressed public key without the `04` tag, hex encoded.
    /// This is the form browser clients encrypt to.
    pub fn public_key_hex(&self) -> String {
        let point = self.public_key().to_encoded_point(false);
        hex::encode(&point.as_bytes()[1..])
    }

    /// Sign a 32-byte digest, returning `(r, s, recovery_id)`.
    pub fn sign_digest(&self, digest: &B256) -> Result<([u8; 32], [u8; 32], u8)> {
        let signing_key = SigningKey::from(&self.secret);
        let (signature, recovery_id): (Signature, RecoveryId) = signing_key
            .sign_prehash_recoverable(digest.as_bytes())
            .map_err(|e| VeritasError::CryptoError(format!("signing failed: {e}")))?;
        let r: [u8; 32] = signature.r().to_bytes().into();
        let s: [u8; 32] = signature.s().to_bytes().into();
        Ok((r, s, recovery_id.to_byte()))
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKey").field("address", &self.address).finish_non_exhaustive()
    }
}

/// Ledger address of a public key: last 20 bytes of Keccak over the raw point.
pub fn address_of(public_key: &PublicKey) -> Address {
    let point = public_key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest.0[12..]);
    Address(out)
}

/// Parse a public key in any of the encodings clients send: compressed,
/// uncompressed, or uncompressed without the `04` tag.
pub fn parse_public_key(hex_key: &str) -> Result<PublicKey> {
    let mut raw = hex::decode(hex_key.trim().trim_start_matches("0x"))?;
    if raw.len() == 64 {
        raw.insert(0, 0x04);
    }
    PublicKey::from_sec1_bytes(&raw)
        .map_err(|e| VeritasError::CryptoError(format!("invalid public key: {e}")))
}
