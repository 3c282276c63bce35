//! Error types for bundle operations.

use thiserror::Error;

/// Errors that can occur during bundle operations.
#[derive(Error, Debug)]
pub enum BundleError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// ZIP archive error
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error in map.csv
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Checksum verification failed
    #[error("checksum mismatch for '{path}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Missing required file in bundle
    #[error("missing required file: {0}")]
    MissingFile(String),

    /// Unknown or unsupported bundle schema version
    #[error("unsupported bundle schemaVersion: {version} (supported: {supported})")]
    UnsupportedVersion { version: u32, supported: u32 },

    /// Corrupted manifest
    #[error("corrupted manifest: {0}")]
    CorruptedManifest(String),

    /// A signature is required but the bundle carries none
    #[error("bundle is unsigned: {0}")]
    SignatureMissing(String),

    /// Signature verification failed
    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    /// Vector payload does not match the manifest shape
    #[error("vector payload mismatch: {0}")]
    VectorShape(String),

    /// Bundle is empty
    #[error("bundle has no content to write")]
    EmptyBundle,
}

/// Result type alias for bundle operations.
pub type Result<T> = std::result::Result<T, BundleError>;

impl From<BundleError> for sm_common::Error {
    fn from(e: BundleError) -> Self {
        match e {
            BundleError::ChecksumMismatch {
                path,
                expected,
                actual,
            } => sm_common::Error::ChecksumMismatch {
                path,
                expected,
                actual,
            },
            BundleError::SignatureMissing(msg) => sm_common::Error::SignatureRequired(msg),
            BundleError::SignatureInvalid(msg) => sm_common::Error::SignatureInvalid(msg),
            BundleError::MissingFile(f) => {
                sm_common::Error::NotFound(format!("bundle file '{f}' missing"))
            }
            BundleError::UnsupportedVersion { version, supported } => sm_common::Error::InputInvalid(
                format!("bundle schemaVersion {version} unsupported (max {supported})"),
            ),
            BundleError::CorruptedManifest(msg) | BundleError::VectorShape(msg) => {
                sm_common::Error::InputInvalid(format!("malformed bundle: {msg}"))
            }
            other => sm_common::Error::Internal(other.to_string()),
        }
    }
}
