use thiserror::Error;

use super::change::ChangeCodecError;
use super::manifest::ManifestError;
use super::paths::PathPolicyError;

/// Daemon-wide error type. Policy violations (forbidden paths, occupied
/// move destinations) surface through the nested manifest and path
/// variants.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("api error: {0}")]
    Api(#[from] gdrive_core::DriveError),
    #[error("transfer failed: {0}")]
    Transfer(#[from] reqwest::Error),
    #[error("{0}")]
    Manifest(#[from] ManifestError),
    #[error("{0}")]
    Codec(#[from] ChangeCodecError),
    #[error("{0}")]
    Path(#[from] PathPolicyError),
    #[error("download integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl SyncError {
    /// Transient errors are retried by the processor while it is not
    /// stopping; everything else is logged and dropped for the next
    /// reconciliation to pick up.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Io(_) | SyncError::Transfer(_) | SyncError::Integrity { .. } => true,
            SyncError::Api(err) => err.is_retryable(),
            SyncError::Manifest(ManifestError::Api(err)) => err.is_retryable(),
            SyncError::Manifest(ManifestError::Io(_)) => true,
            _ => false,
        }
    }

    /// Fatal errors crash the processor task; the supervisor writes the
    /// crash file and restarts it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Invariant(_))
    }
}
