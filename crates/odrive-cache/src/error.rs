use std::sync::Arc;

use odrive_core::{Classify, ErrorKind, ObjectId};
use odrive_storage::BlobError;
use thiserror::Error;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Not in the partition, the blob backend, or any peer.
    #[error("ciphertext {0} not found locally, in blob storage, or on any peer")]
    NotFound(ObjectId),

    #[error("cache full: {used} of {capacity} bytes used and nothing evictable")]
    CacheFull { used: u64, capacity: u64 },

    /// Readers hold the file; the operation must wait for them.
    #[error("ciphertext {0} is in use")]
    Busy(ObjectId),

    #[error("ciphertext {id} is {state}, expected {expected}")]
    WrongState {
        id: ObjectId,
        state: &'static str,
        expected: &'static str,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{op} timed out")]
    Timeout { op: &'static str },

    /// Upload reported success but the backend does not show the blob.
    #[error("upload of {0} not visible in blob backend")]
    Unverified(ObjectId),

    #[error("peer fetch failed: {0}")]
    Peer(String),

    #[error("blob backend: {0}")]
    Blob(#[from] BlobError),

    #[error("partition I/O: {0}")]
    Io(#[from] std::io::Error),

    /// A failure observed by a caller that joined someone else's materialization.
    #[error(transparent)]
    Shared(Arc<CacheError>),
}

impl CacheError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            CacheError::Cancelled => true,
            CacheError::Shared(inner) => inner.is_cancelled(),
            _ => false,
        }
    }

    /// Whether the drain should try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            CacheError::Blob(e) => e.is_retryable(),
            // The staged file vanished (expunged); nothing left to upload.
            CacheError::Io(e) => e.kind() != std::io::ErrorKind::NotFound,
            CacheError::Timeout { .. } | CacheError::Unverified(_) | CacheError::Peer(_) => true,
            CacheError::Shared(inner) => inner.is_retryable(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            CacheError::NotFound(_) => true,
            CacheError::Blob(e) => e.is_not_found(),
            CacheError::Shared(inner) => inner.is_not_found(),
            _ => false,
        }
    }
}

impl Classify for CacheError {
    fn kind(&self) -> ErrorKind {
        match self {
            CacheError::NotFound(_) => ErrorKind::NotFound,
            CacheError::CacheFull { .. } => ErrorKind::CacheFull,
            CacheError::WrongState { .. } => ErrorKind::Conflict,
            CacheError::Busy(_)
            | CacheError::Cancelled
            | CacheError::Timeout { .. }
            | CacheError::Unverified(_)
            | CacheError::Peer(_) => ErrorKind::Transient,
            CacheError::Blob(e) => e.kind(),
            // An unwritable partition cannot recover on retry.
            CacheError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorKind::Fatal
            }
            CacheError::Io(_) => ErrorKind::Transient,
            CacheError::Shared(inner) => inner.kind(),
        }
    }
}
