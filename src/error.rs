//! Error types for linefetch.

use thiserror::Error;

use crate::protocol::ErrorKind;

/// Errors produced while serving or requesting a file.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Transport failure: connect, accept, read or write.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Empty path, traversal attempt, oversized or malformed request line.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// File does not exist or is not a regular file.
    #[error("not found: {0}")]
    NotFound(String),

    /// File exists but may not be read.
    #[error("access denied: {0}")]
    Access(String),

    /// Peer closed the connection before the advertised length arrived.
    #[error("truncated response: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },

    /// Response exceeds the client's configured limit.
    #[error("response exceeds limit of {limit} bytes")]
    ResponseTooLarge { limit: u64 },

    /// An operation did not complete within its deadline.
    #[error("timed out while {0}")]
    Timeout(&'static str),

    /// Status line from the server could not be understood.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Writing the received body to its local destination failed.
    #[error("output error: {0}")]
    Output(#[source] std::io::Error),
}

impl TransferError {
    /// Wire error kind for failures the server reports to the client.
    ///
    /// Transport-level failures have no wire representation.
    pub fn wire_kind(&self) -> Option<ErrorKind> {
        match self {
            TransferError::InvalidRequest(_) => Some(ErrorKind::InvalidRequest),
            TransferError::NotFound(_) => Some(ErrorKind::NotFound),
            TransferError::Access(_) => Some(ErrorKind::AccessDenied),
            _ => None,
        }
    }

    /// Rebuild a local error from a status line sent by the server.
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::InvalidRequest => TransferError::InvalidRequest(message),
            ErrorKind::NotFound => TransferError::NotFound(message),
            ErrorKind::AccessDenied => TransferError::Access(message),
        }
    }

    /// Short reason that is safe to send to the peer.
    pub fn public_message(&self) -> &str {
        match self {
            TransferError::InvalidRequest(msg)
            | TransferError::NotFound(msg)
            | TransferError::Access(msg) => msg,
            _ => "internal error",
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
