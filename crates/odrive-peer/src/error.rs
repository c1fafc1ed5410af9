use odrive_core::{Classify, ErrorKind};
use thiserror::Error;

pub type PeerResult<T> = Result<T, PeerError>;

#[derive(Debug, Error)]
pub enum PeerError {
    /// Certificates, keys or CA bundle could not be loaded or used.
    #[error("TLS setup: {0}")]
    Tls(String),

    #[error("discovery: {0}")]
    Discovery(String),

    #[error("invalid peer address {0:?}")]
    Address(String),

    #[error("peer {peer} answered {status}")]
    Status { peer: String, status: u16 },

    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for PeerError {
    fn kind(&self) -> ErrorKind {
        match self {
            PeerError::Tls(_) | PeerError::Address(_) => ErrorKind::Fatal,
            PeerError::Status { status: 404, .. } => ErrorKind::NotFound,
            PeerError::Discovery(_)
            | PeerError::Status { .. }
            | PeerError::Http(_)
            | PeerError::Io(_) => ErrorKind::Transient,
        }
    }
}
