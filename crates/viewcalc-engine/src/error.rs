//! Engine error types.

use thiserror::Error;

use viewcalc_traits::{DispatchError, TraitError};

/// Engine error type.
///
/// Only graph-consistency and configuration errors abort an execution.
/// Per-node failures are reported through the execution result instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The graph is not a closed DAG (cycle, dangling input, duplicate output)
    #[error("graph consistency error: {0}")]
    GraphConsistency(String),

    /// Configuration error
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Node not found
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// A job could not be handed to a calculation node
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TraitError> for EngineError {
    fn from(e: TraitError) -> Self {
        match e {
            TraitError::InvalidInput(msg) | TraitError::ParseError(msg) => {
                EngineError::InvalidConfig(msg)
            }
            other => EngineError::Internal(other.to_string()),
        }
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
