//! Prompt payloads and the ECIES envelope used to encrypt them.
//!
//! The envelope is wire-compatible with the `eth-crypto` browser library:
//! ECDH on secp256k1, SHA-512 of the shared x-coordinate split into an
//! AES-256-CBC key and an HMAC-SHA256 key, MAC over `iv || ephemPublicKey || ciphertext`.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use k256::ecdh::diffie_hellman;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Result, VeritasError};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// An encrypted prompt. All fields are hex without `0x`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    pub iv: String,
    pub ephem_public_key: String,
    pub ciphertext: String,
    pub mac: String,
}

/// A registered prompt: plaintext, or an envelope addressed to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptPayload {
    Plain(String),
    Encrypted(EncryptedPayload),
}

impl PromptPayload {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, PromptPayload::Encrypted(_))
    }

    /// True for an empty plaintext prompt.
    pub fn is_empty(&self) -> bool {
        matches!(self, PromptPayload::Plain(p) if p.is_empty())
    }
}

/// Encrypt `plaintext` to `recipient`.
pub fn encrypt(recipient: &PublicKey, plaintext: &str) -> Result<EncryptedPayload> {
    let mut rng = rand::rngs::OsRng;
    let ephemeral = SecretKey::random(&mut rng);
    let mut iv = [0u8; 16];
    rng.fill_bytes(&mut iv);

    let ephem_public = ephemeral.public_key().to_encoded_point(false);
    let (enc_key, mac_key) = derive_keys(&ephemeral, recipient);

    let ciphertext = Aes256CbcEnc::new_from_slices(&enc_key, &iv)
        .map_err(|e| VeritasError::CryptoError(e.to_string()))?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    let mac = compute_mac(&mac_key, &iv, ephem_public.as_bytes(), &ciphertext)?;

    Ok(EncryptedPayload {
        iv: hex::encode(iv),
        ephem_public_key: hex::encode(ephem_public.as_bytes()),
        ciphertext: hex::encode(ciphertext),
        mac: hex::encode(mac),
    })
}

/// Open an envelope with the recipient's secret key.
pub fn decrypt(secret: &SecretKey, payload: &EncryptedPayload) -> Result<String> {
    let iv = decode_field("iv", &payload.iv)?;
    let ephem_raw = decode_field("ephemPublicKey", &payload.ephem_public_key)?;
    let ciphertext = decode_field("ciphertext", &payload.ciphertext)?;
    let mac = decode_field("mac", &payload.mac)?;

    let ephem_public = PublicKey::from_sec1_bytes(&ephem_raw)
        .map_err(|e| VeritasError::Decryption(format!("bad ephemeral key: {e}")))?;
    // The MAC is computed over the uncompressed form even if a compressed key was sent
    let ephem_uncompressed = ephem_public.to_encoded_point(false);

    let (enc_key, mac_key) = derive_keys(secret, &ephem_public);

    let mut verifier = <HmacSha256 as Mac>::new_from_slice(&mac_key)
        .map_err(|e| VeritasError::Decryption(e.to_string()))?;
    verifier.update(&iv);
    verifier.update(ephem_uncompressed.as_bytes());
    verifier.update(&ciphertext);
    verifier
        .verify_slice(&mac)
        .map_err(|_| VeritasError::Decryption("bad MAC".to_string()))?;

    let plaintext = Aes256CbcDec::new_from_slices(&enc_key, &iv)
        .map_err(|e| VeritasError::Decryption(e.to_string()))?
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| VeritasError::Decryption("bad padding".to_string()))?;

    String::from_utf8(plaintext)
        .map_err(|_| VeritasError::Decryption("plaintext is not UTF-8".to_string()))
}

fn derive_keys(secret: &SecretKey, public: &PublicKey) -> ([u8; 32], [u8; 32]) {
    let shared = diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
    let digest = Sha512::digest(shared.raw_secret_bytes());
    let mut enc_key = [0u8; 32];
    let mut mac_key = [0u8; 32];
    enc_key.copy_from_slice(&digest[..32]);
    mac_key.copy_from_slice(&digest[32..]);
    (enc_key, mac_key)
}

fn compute_mac(mac_key: &[u8], iv: &[u8], ephem: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
        .map_err(|e| VeritasError::CryptoError(e.to_string()))?;
    mac.update(iv);
    mac.update(ephem);
    mac.update(ciphertext);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| VeritasError::Decryption(format!("{name} is not hex: {e}")))
}
