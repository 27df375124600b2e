use thiserror::Error;

use statestore::StoreError;

/// Errors from tunnel lifecycle operations
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Requested file does not exist under the library root
    #[error("file not found in library: {path}")]
    FileNotFound { path: String },

    /// Resolved path escapes the library root
    #[error("path escapes the library root: {path}")]
    PathEscape { path: String },

    /// Path resolves to something other than a regular file
    #[error("not a regular file: {path}")]
    NotRegularFile { path: String },

    /// Could not allocate a unique tunnel ID
    #[error("tunnel id allocation exhausted after {attempts} attempts")]
    IdAllocation { attempts: usize },

    /// No record for the given tunnel ID
    #[error("tunnel {tunnel_id} not found")]
    NotFound { tunnel_id: String },

    /// Edge provider failed to publish after retries
    #[error("edge publish failed: {reason}")]
    EdgeProvision { reason: String },

    /// Edge provider failed to unpublish after retries
    #[error("edge unpublish failed: {reason}")]
    EdgeUnpublish { reason: String },

    /// A stored record could not be decoded
    #[error("corrupt record at {key}")]
    CorruptRecord { key: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("staging io error: {0}")]
    Io(#[from] std::io::Error),
}
