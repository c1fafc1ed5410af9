use odrive_core::{Classify, ErrorKind, ObjectId};
use odrive_crypto::CryptoError;
use thiserror::Error;

pub type PermResult<T> = Result<T, PermError>;

#[derive(Debug, Error)]
pub enum PermError {
    /// No row for the caller validates and covers the requested flags.
    ///
    /// Deliberately carries no detail: tampered, missing and insufficient
    /// rows look the same from outside.
    #[error("access denied")]
    Denied,

    #[error("invalid grantee {0:?}")]
    InvalidGrantee(String),

    /// Valid rows for one object unwrap to different keys.
    #[error("permission rows for {0} disagree on the object key")]
    Inconsistent(ObjectId),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl Classify for PermError {
    fn kind(&self) -> ErrorKind {
        match self {
            PermError::Denied => ErrorKind::Auth,
            PermError::InvalidGrantee(_) => ErrorKind::Input,
            PermError::Inconsistent(_) => ErrorKind::Fatal,
            PermError::Crypto(e) => e.kind(),
        }
    }
}
