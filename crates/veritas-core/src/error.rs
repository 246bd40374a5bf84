//! Error types for the Veritas worker.

use thiserror::Error;

use crate::types::RequestId;

/// How the fulfillment pipeline reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed input from a client. Rejected immediately, never retried.
    ClientInput,
    /// Recoverable failure. The guard is released and a later trigger retries.
    Transient,
    /// Progress continues with reduced guarantees (fallback storage pointer).
    Degraded,
    /// Unusable configuration or internal invariant broken.
    Fatal,
}

/// Main error type for Veritas operations.
#[derive(Error, Debug, Clone)]
pub enum VeritasError {
    /// Prompt registration was malformed.
    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    /// The encrypted prompt envelope could not be opened.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// The inference provider returned an error or an unusable response.
    #[error("Provider error for model {model}: {message}")]
    Provider { model: String, message: String },

    /// The content store could not be reached or rejected the upload.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Writing the result back to the ledger failed.
    #[error("Submission failed for request {request_id}: {message}")]
    Submission { request_id: RequestId, message: String },

    /// A ledger read failed.
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Operation timed out.
    #[error("Operation timed out after {duration_ms}ms: {message}")]
    Timeout { duration_ms: u64, message: String },

    /// State store error.
    #[error("State store error: {message}")]
    StateError { message: String },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    /// Resource not found.
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound { resource_type: String, id: String },

    /// Connection error.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl VeritasError {
    /// Classify this error for the pipeline's recovery policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            VeritasError::InvalidRegistration(_) => ErrorClass::ClientInput,
            VeritasError::Decryption(_)
            | VeritasError::Provider { .. }
            | VeritasError::Submission { .. }
            | VeritasError::Ledger(_)
            | VeritasError::Timeout { .. }
            | VeritasError::ConnectionError(_)
            | VeritasError::StateError { .. }
            | VeritasError::NotFound { .. } => ErrorClass::Transient,
            VeritasError::Storage(_) => ErrorClass::Degraded,
            VeritasError::SerializationError(_)
            | VeritasError::CryptoError(_) => ErrorClass::Fatal,
        }
    }
}

/// Convenience Result type for Veritas operations.
pub type Result<T> = std::result::Result<T, VeritasError>;

impl From<serde_json::Error> for VeritasError {
    fn from(err: serde_json::Error) -> Self {
        VeritasError::SerializationError(err.to_string())
    }
}

impl From<hex::FromHexError> for VeritasError {
    fn from(err: hex::FromHexError) -> Self {
        VeritasError::SerializationError(format!("invalid hex: {err}"))
    }
}
