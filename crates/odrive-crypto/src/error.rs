use odrive_core::{Classify, ErrorKind};
use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key too long: {len} bytes (maximum 32)")]
    KeyTooLong { len: usize },

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("range {start}-{stop:?} outside object of {size} bytes")]
    RangeOutOfBounds {
        start: u64,
        stop: Option<u64>,
        size: u64,
    },

    #[error("short read: expected {expected} bytes, source ended after {got}")]
    ShortRead { expected: u64, got: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for CryptoError {
    fn kind(&self) -> ErrorKind {
        match self {
            CryptoError::RangeOutOfBounds { .. } => ErrorKind::RangeOutOfBounds,
            CryptoError::ShortRead { .. } => ErrorKind::Input,
            CryptoError::KeyTooLong { .. } | CryptoError::InvalidKey(_) => ErrorKind::Fatal,
            CryptoError::Io(_) => ErrorKind::Transient,
        }
    }
}
