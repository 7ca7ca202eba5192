//! Error types for seam operations.

use thiserror::Error;

/// Error type for codec and configuration plumbing.
#[derive(Debug, Error)]
pub enum TraitError {
    /// Parse/deserialization error
    #[error("parse error: {0}")]
    ParseError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Invalid input
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<std::io::Error> for TraitError {
    fn from(e: std::io::Error) -> Self {
        TraitError::IoError(e.to_string())
    }
}

/// Why a worker refused to accept a job.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Every slot or queue position is taken; the dispatch may be retried.
    #[error("no calculation node available")]
    NoWorkerAvailable,

    /// The calculation node has gone away; retrying is pointless.
    #[error("calculation node disconnected: {0}")]
    Disconnected(String),

    /// The job could not be marshalled for the wire.
    #[error("could not encode job: {0}")]
    Encoding(String),
}

impl DispatchError {
    /// Returns true if the same job may be offered again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::NoWorkerAvailable)
    }
}
