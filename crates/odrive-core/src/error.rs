use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

pub type CoreResult<T> = Result<T, CoreError>;

/// Coarse failure categories every odrive error maps onto.
///
/// Callers decide retry and reporting behavior from the kind alone; the
/// concrete error stays internal and is only logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request, bad JSON, missing field, bad change token.
    Input,
    /// Identity unavailable, or no permission row that validates.
    Auth,
    /// Object or ciphertext absent from cache, blob store, and peers.
    NotFound,
    /// Optimistic concurrency failure on a change token.
    Conflict,
    /// Backend timeout or contention; already retried at the lowest layer.
    Transient,
    /// Startup-level failure: missing master key, unwritable partition.
    Fatal,
    /// Partition above the high watermark with nothing evictable.
    CacheFull,
    /// Multi-range or unparseable `Range` header.
    RangeNotSatisfiable,
    /// Range outside `[0, size)`.
    RangeOutOfBounds,
}

impl ErrorKind {
    /// Short, stable message safe to return to a client.
    pub fn public_message(self) -> &'static str {
        match self {
            ErrorKind::Input => "invalid request",
            // Same text whether or not the object exists.
            ErrorKind::Auth => "forbidden",
            ErrorKind::NotFound => "not found",
            ErrorKind::Conflict => "change token is stale; re-read and retry",
            ErrorKind::Transient => "temporarily unavailable",
            ErrorKind::Fatal => "internal error",
            ErrorKind::CacheFull => "insufficient storage",
            ErrorKind::RangeNotSatisfiable => "range not satisfiable",
            ErrorKind::RangeOutOfBounds => "range out of bounds",
        }
    }

    /// The HTTP status a front end should map this kind to.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Input => 400,
            ErrorKind::Auth => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Transient => 503,
            ErrorKind::Fatal => 500,
            ErrorKind::CacheFull => 507,
            ErrorKind::RangeNotSatisfiable | ErrorKind::RangeOutOfBounds => 416,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Input => "input",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
            ErrorKind::CacheFull => "cache_full",
            ErrorKind::RangeNotSatisfiable => "range_not_satisfiable",
            ErrorKind::RangeOutOfBounds => "range_out_of_bounds",
        };
        f.write_str(s)
    }
}

/// Implemented by every crate-level error enum.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// The user-visible shape of an error: a stable message and a request id.
///
/// The internal cause is logged under the same request id and never
/// returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: &'static str,
    pub request_id: String,
}

impl Failure {
    /// Log `err` with a fresh request id and return the public failure.
    pub fn report<E>(err: &E) -> Self
    where
        E: Classify + fmt::Display,
    {
        let request_id = uuid::Uuid::new_v4().to_string();
        Self::report_with_id(err, request_id)
    }

    pub fn report_with_id<E>(err: &E, request_id: String) -> Self
    where
        E: Classify + fmt::Display,
    {
        let kind = err.kind();
        match kind {
            ErrorKind::Fatal | ErrorKind::Transient => {
                error!(request_id = %request_id, kind = %kind, error = %err, "request failed")
            }
            _ => warn!(request_id = %request_id, kind = %kind, error = %err, "request failed"),
        }
        Failure {
            kind,
            message: kind.public_message(),
            request_id,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (request {})", self.message, self.request_id)
    }
}

impl std::error::Error for Failure {}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid object id: {0}")]
    InvalidId(String),

    #[error("invalid ACM: {0}")]
    InvalidAcm(String),

    #[error("invalid permission flags: {0}")]
    InvalidFlags(String),

    #[error("parsing config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for CoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Config(_) | CoreError::Toml(_) | CoreError::Io(_) => ErrorKind::Fatal,
            CoreError::InvalidId(_) | CoreError::InvalidAcm(_) | CoreError::InvalidFlags(_) => {
                ErrorKind::Input
            }
        }
    }
}
