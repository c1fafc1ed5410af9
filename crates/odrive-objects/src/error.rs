use odrive_cache::CacheError;
use odrive_core::{Classify, CoreError, ErrorKind, ObjectId};
use odrive_crypto::CryptoError;
use odrive_perms::PermError;
use odrive_storage::BlobError;
use thiserror::Error;

use crate::model::ObjectState;

pub type ObjectResult<T> = Result<T, ObjectError>;

#[derive(Debug, Error)]
pub enum ObjectError {
    /// Unknown or expunged.
    #[error("object {0} not found")]
    NotFound(ObjectId),

    /// The caller holds no valid row covering the operation, or the ACM
    /// policy refused. Never says which.
    #[error("access denied")]
    Denied,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("change token for {0} is stale")]
    StaleToken(ObjectId),

    #[error("object {id} is {state}; cannot {op}")]
    WrongState {
        id: ObjectId,
        state: ObjectState,
        op: &'static str,
    },

    #[error("range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Perm(#[from] PermError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl Classify for ObjectError {
    fn kind(&self) -> ErrorKind {
        match self {
            ObjectError::NotFound(_) => ErrorKind::NotFound,
            ObjectError::Denied => ErrorKind::Auth,
            ObjectError::Invalid(_) | ObjectError::Core(_) => ErrorKind::Input,
            ObjectError::StaleToken(_) | ObjectError::WrongState { .. } => ErrorKind::Conflict,
            ObjectError::RangeNotSatisfiable(_) => ErrorKind::RangeNotSatisfiable,
            ObjectError::Cancelled => ErrorKind::Transient,
            ObjectError::Store(e) => e.kind(),
            ObjectError::Perm(e) => e.kind(),
            ObjectError::Crypto(e) => e.kind(),
            ObjectError::Cache(e) if e.is_cancelled() => ErrorKind::Transient,
            ObjectError::Cache(e) => e.kind(),
            ObjectError::Blob(e) => e.kind(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The compare-and-swap guard failed.
    #[error("change token mismatch for {0}")]
    Conflict(ObjectId),

    #[error("object {0} already exists")]
    Exists(ObjectId),

    #[error("metadata store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata store encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Conflict(_) | StoreError::Exists(_) => ErrorKind::Conflict,
            StoreError::Io(_) => ErrorKind::Transient,
            StoreError::Encoding(_) => ErrorKind::Fatal,
        }
    }
}
