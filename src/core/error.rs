//! Error types for the blackboard core.
//!
//! Mirrors the transport's JSON-RPC error codes (spec.md §6) one-to-one so
//! the transport layer can map a `BlackboardError` to a response without
//! re-deriving the classification.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlackboardError {
    #[error("invalid pheromone input: {0}")]
    InvalidInput(String),

    #[error("trail not found: {0}")]
    TrailNotFound(String),

    #[error("scent not found: {0}")]
    ScentNotFound(String),

    #[error("payload validation failed: {0}")]
    PayloadValidation(String),

    #[error("invalid condition: {0}")]
    InvalidCondition(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl BlackboardError {
    /// JSON-RPC error code per spec.md §6.
    pub fn rpc_code(&self) -> i64 {
        match self {
            BlackboardError::InvalidInput(_) => -32602,
            BlackboardError::TrailNotFound(_) => -32001,
            BlackboardError::ScentNotFound(_) => -32002,
            BlackboardError::PayloadValidation(_) => -32003,
            BlackboardError::InvalidCondition(_) => -32006,
            BlackboardError::Internal(_) => -32603,
        }
    }
}
