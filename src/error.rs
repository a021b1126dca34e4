//! Error types for lockbox.
//!
//! Every variant is a distinct failure mode of the key lifecycle. Messages
//! name the failed operation and, for native calls, the OS error code. They
//! never carry key material or plaintext.

use thiserror::Error;

/// Shorthand for results produced by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The single error type for all lockbox operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A native call failed while a protected region was being created.
    /// Whatever was partially allocated has already been released.
    #[error("protected memory allocation failed in {operation}: {reason}")]
    AllocationFailure {
        operation: &'static str,
        reason: String,
    },

    /// A native memory call (mprotect, munlock, setrlimit, ...) returned a
    /// non-zero result.
    #[error("{operation} failed with OS error code {code}")]
    OperationFailed { operation: &'static str, code: i32 },

    /// The object was used after it was closed.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Authentication failed: wrong key, tampered ciphertext, truncated
    /// input, or a broken length invariant after decryption.
    #[error("cipher authentication failed")]
    CipherAuthFailure,

    /// The plaintext exceeds the cipher's maximum input size.
    #[error("data too large for cipher")]
    DataTooLarge,

    /// Key bytes were rejected by the cipher (wrong length, malformed).
    #[error("invalid key")]
    InvalidKey,

    /// The system's random number generator failed to produce bytes.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// The AEAD seal operation failed.
    #[error("encryption failed")]
    EncryptionFailure,

    /// The canary guarding a region was overwritten.
    #[error("canary mismatch detected while releasing a guarded region")]
    CanaryMismatch,

    /// A secret was read as text but does not hold valid UTF-8.
    #[error("secret is not valid UTF-8")]
    InvalidUtf8,

    /// A key record, or the metadata pointing at one, is absent or unusable.
    #[error("key metadata missing: {0}")]
    MetadataMissing(String),

    /// The key management service failed.
    #[error("kms: {0}")]
    Kms(String),

    /// The metastore failed.
    #[error("metastore: {0}")]
    Metastore(String),

    /// A record could not be serialized or deserialized.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Build an `OperationFailed` from the calling thread's last OS error.
    pub(crate) fn last_os_error(operation: &'static str) -> Self {
        let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Self::OperationFailed { operation, code }
    }

    /// Build an `AllocationFailure` from the calling thread's last OS error.
    pub(crate) fn allocation(operation: &'static str) -> Self {
        Self::AllocationFailure {
            operation,
            reason: std::io::Error::last_os_error().to_string(),
        }
    }
}
