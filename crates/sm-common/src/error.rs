//! Unified error type with stable kind tokens.
//!
//! Every error message contains its kind token (e.g. `ChecksumMismatch`) so
//! operators can grep logs and receipts for a class of failure without
//! parsing structure. Kinds map to the stable CLI exit codes:
//!
//! - 0: success
//! - 1: generic failure
//! - 2: policy denial (command or path)
//! - 3: signature required or invalid
//! - 4: checksum mismatch
//! - 111: network egress attempted in offline mode

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for SecuraMem operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InputInvalid,
    NotFound,
    PolicyDenied,
    SignatureRequired,
    SignatureInvalid,
    ChecksumMismatch,
    StorageCorrupt,
    DecryptionFailed,
    BackendUnavailable,
    Cancelled,
    Timeout,
    NetworkEgressBlocked,
    Internal,
}

impl ErrorKind {
    /// The grep-stable token that appears in every message of this kind.
    pub fn token(&self) -> &'static str {
        match self {
            ErrorKind::InputInvalid => "InputInvalid",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::PolicyDenied => "PolicyDenied",
            ErrorKind::SignatureRequired => "SignatureRequired",
            ErrorKind::SignatureInvalid => "SignatureInvalid",
            ErrorKind::ChecksumMismatch => "ChecksumMismatch",
            ErrorKind::StorageCorrupt => "StorageCorrupt",
            ErrorKind::DecryptionFailed => "DecryptionFailed",
            ErrorKind::BackendUnavailable => "BackendUnavailable",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::NetworkEgressBlocked => "NetworkEgressBlocked",
            ErrorKind::Internal => "Internal",
        }
    }

    /// Process exit code for this kind.
    ///
    /// These codes are a stable contract for automation. Changes require
    /// a major version bump.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::PolicyDenied => 2,
            ErrorKind::SignatureRequired | ErrorKind::SignatureInvalid => 3,
            ErrorKind::ChecksumMismatch => 4,
            ErrorKind::NetworkEgressBlocked => 111,
            _ => 1,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.token())
    }
}

/// Unified error type for SecuraMem.
#[derive(Error, Debug)]
pub enum Error {
    #[error("InputInvalid: {0}")]
    InputInvalid(String),

    #[error("NotFound: {0}")]
    NotFound(String),

    #[error("PolicyDenied: {0}")]
    PolicyDenied(String),

    #[error("SignatureRequired: signature required but missing: {0}")]
    SignatureRequired(String),

    #[error("SignatureInvalid: signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("ChecksumMismatch: checksum mismatch for '{path}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("StorageCorrupt: {0}")]
    StorageCorrupt(String),

    #[error("DecryptionFailed: {0}")]
    DecryptionFailed(String),

    #[error("BackendUnavailable: {0}")]
    BackendUnavailable(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("NetworkEgressBlocked: network egress attempted in offline mode: {0}")]
    NetworkEgressBlocked(String),

    #[error("Internal: {0}")]
    Internal(String),

    #[error("Internal: I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal: JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Classify this error for exit-code mapping and receipts.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InputInvalid(_) => ErrorKind::InputInvalid,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::PolicyDenied(_) => ErrorKind::PolicyDenied,
            Error::SignatureRequired(_) => ErrorKind::SignatureRequired,
            Error::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
            Error::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Error::StorageCorrupt(_) => ErrorKind::StorageCorrupt,
            Error::DecryptionFailed(_) => ErrorKind::DecryptionFailed,
            Error::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::NetworkEgressBlocked(_) => ErrorKind::NetworkEgressBlocked,
            Error::Internal(_) | Error::Io(_) | Error::Json(_) => ErrorKind::Internal,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    /// Convenience constructor for internal errors from any displayable.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Error::Internal(msg.to_string())
    }
}
