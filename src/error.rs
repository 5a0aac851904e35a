//! Error types for the envelope log and its services.

use crate::types::{NodeId, SequenceId};
use std::io::ErrorKind;
use thiserror::Error;

/// Main error type for courier operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("no partition of originator {originator} covers sequence {sequence}")]
    MissingPartition {
        originator: NodeId,
        sequence: SequenceId,
    },

    #[error("sequence overflow computing band for originator {originator} at sequence {sequence}")]
    SequenceOverflow {
        originator: NodeId,
        sequence: SequenceId,
    },

    #[error("empty input")]
    EmptyBatch,

    #[error(
        "sequence IDs must be strictly ascending for originator {originator}: {sequence} follows {previous}"
    )]
    NonAscendingBatch {
        originator: NodeId,
        previous: SequenceId,
        sequence: SequenceId,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("system invariant broken: {0}")]
    InvariantViolation(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("stream closed by receiver")]
    StreamClosed,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("signer error: {0}")]
    Signer(String),

    #[error("fee calculation error: {0}")]
    Fees(String),

    #[error("node registry error: {0}")]
    Registry(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether a retry of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transient(_) | Error::Locked => true,
            Error::Io(e) => matches!(
                e.kind(),
                ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Whether the error means the log can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvariantViolation(_)
                | Error::SequenceOverflow { .. }
                | Error::Corruption(_)
                | Error::ChecksumMismatch { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Deserialization(e.to_string())
    }
}

/// Result type for courier operations.
pub type Result<T> = std::result::Result<T, Error>;
