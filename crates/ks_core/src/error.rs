//! The error taxonomy at the core boundary.
//!
//! Three categories, with different recovery contracts:
//! - programmer/integration errors (`NotInitialized`, `NoSession`,
//!   contact errors): no retry, fix the call order;
//! - cryptographic verification failures (`BadSignature`, `BadMac`,
//!   `Duplicate`, `UntrustedIdentity`, ...): state is untouched, the caller
//!   decides whether to wipe and re-invite;
//! - storage failures (`StorageUnavailable`): memory stays authoritative,
//!   persistence retries at the next checkpoint.

use thiserror::Error;

use ks_store::StoreError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Core is not initialized — call initialize_or_reload first")]
    NotInitialized,

    #[error("Invalid contact: {0}")]
    InvalidContact(String),

    #[error("Contact already exists")]
    DuplicateContact,

    #[error("Unknown contact")]
    UnknownContact,

    #[error("No session with {0}")]
    NoSession(String),

    #[error("Identity for {0} does not match the trusted identity")]
    UntrustedIdentity(String),

    #[error("Unsupported message version {0}")]
    InvalidVersion(u8),

    #[error("Unknown pre-key id {0}")]
    InvalidKeyId(u32),

    #[error("Message failed authentication")]
    BadMac,

    #[error("Message was already decrypted")]
    Duplicate,

    #[error("Message is too far out of order")]
    OutOfOrderTooFar,

    #[error("Invalid pre-key bundle: {0}")]
    BadBundle(String),

    #[error("Pre-key signature verification failed")]
    BadSignature,

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => CoreError::StorageUnavailable(msg),
            other => CoreError::Internal(other.to_string()),
        }
    }
}
