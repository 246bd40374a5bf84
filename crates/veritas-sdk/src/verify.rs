//! Offline verification of published audit packages.

use veritas_core::{content_address, keccak256, AuditPackage, StoragePointer, B256};

/// Result of checking an audit package against a ledger commitment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// The recorded output hashes to the on-chain commitment.
    Verified(AuditPackage),
    /// The pointer is a fallback marker; there is nothing to fetch.
    Unpublished,
    /// The bytes do not hash to the address they were fetched from.
    AddressMismatch { expected: B256, actual: B256 },
    /// The recorded output does not reproduce the commitment.
    CommitmentMismatch { recomputed: B256, on_chain: B256 },
    /// The bytes are not an audit package.
    Unreadable(String),
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Verification::Verified(_))
    }
}

/// Check `bytes` against the commitment read from the ledger.
pub fn verify_package(bytes: &[u8], on_chain: &B256) -> Verification {
    let package = match AuditPackage::from_slice(bytes) {
        Ok(package) => package,
        Err(e) => return Verification::Unreadable(e.to_string()),
    };

    let recomputed = keccak256(package.output.as_bytes());
    if recomputed != *on_chain {
        return Verification::CommitmentMismatch {
            recomputed,
            on_chain: *on_chain,
        };
    }

    Verification::Verified(package)
}

/// Check bytes fetched for `pointer`, including that they match its address.
pub fn verify_published(pointer: &StoragePointer, bytes: &[u8], on_chain: &B256) -> Verification {
    let Some(expected) = pointer.content_address() else {
        return Verification::Unpublished;
    };

    let actual = content_address(bytes);
    if actual != *expected {
        return Verification::AddressMismatch {
            expected: *expected,
            actual,
        };
    }

    verify_package(bytes, on_chain)
}
