use odrive_core::{Classify, ErrorKind};
use thiserror::Error;

pub type BlobResult<T> = Result<T, BlobError>;

#[derive(Debug, Error)]
pub enum BlobError {
    /// The id has no blob under this partition.
    #[error("blob not found: {0}")]
    NotFound(String),

    /// The backend echoed an ETag that does not match the MD5s we computed.
    #[error("integrity mismatch for {id}: expected etag {expected}, backend returned {actual}")]
    IntegrityMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("{op} timed out after {secs}s")]
    Timeout { op: &'static str, secs: u64 },

    #[error("requested range {start}-{stop:?} outside blob of {size} bytes")]
    RangeOutOfBounds {
        start: u64,
        stop: Option<u64>,
        size: u64,
    },

    #[error("backend configuration: {0}")]
    Config(String),

    #[error("object store error: {0}")]
    Store(#[from] opendal::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BlobError {
    pub fn is_not_found(&self) -> bool {
        match self {
            BlobError::NotFound(_) => true,
            BlobError::Store(e) => e.kind() == opendal::ErrorKind::NotFound,
            BlobError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Whether a caller-level retry (drain, peer fetch) may help.
    pub fn is_retryable(&self) -> bool {
        match self {
            BlobError::NotFound(_)
            | BlobError::RangeOutOfBounds { .. }
            | BlobError::Config(_) => false,
            BlobError::Store(e) => !matches!(
                e.kind(),
                opendal::ErrorKind::NotFound
                    | opendal::ErrorKind::PermissionDenied
                    | opendal::ErrorKind::ConfigInvalid
                    | opendal::ErrorKind::Unsupported
            ),
            _ => true,
        }
    }
}

impl Classify for BlobError {
    fn kind(&self) -> ErrorKind {
        if self.is_not_found() {
            return ErrorKind::NotFound;
        }
        match self {
            BlobError::RangeOutOfBounds { .. } => ErrorKind::RangeOutOfBounds,
            BlobError::Config(_) => ErrorKind::Fatal,
            _ => ErrorKind::Transient,
        }
    }
}
