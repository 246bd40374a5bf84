//! # Veritas Core
//!
//! Core primitives for the Veritas verifiable inference worker.
//!
//! This crate provides the fundamental building blocks:
//! - [`InferenceRequest`] / [`InferenceResult`] - what the ledger records
//! - [`commit_output`] - the result commitment third parties recompute
//! - [`AuditPackage`] / [`StoragePointer`] - the published record and where it lives
//! - [`PromptPayload`] - plaintext or ECIES-encrypted prompts
//! - [`VeritasError`] - error taxonomy

pub mod audit;
pub mod commitment;
pub mod content;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod types;

// Re-exports for convenience
pub use audit::{AuditPackage, StoragePointer, FALLBACK_PREFIX};
pub use commitment::{commit_output, commit_prompt, keccak256, verify_output};
pub use content::content_address;
pub use envelope::{EncryptedPayload, PromptPayload};
pub use error::{ErrorClass, Result, VeritasError};
pub use identity::NodeKey;
pub use types::*;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::audit::{AuditPackage, StoragePointer};
    pub use crate::commitment::{commit_output, verify_output};
    pub use crate::envelope::{EncryptedPayload, PromptPayload};
    pub use crate::error::{Result, VeritasError};
    pub use crate::types::{Address, InferenceRequest, InferenceResult, RequestId, B256};
}
