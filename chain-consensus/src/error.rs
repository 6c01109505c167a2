//! Consensus error types

use thiserror::Error;

/// Consensus error type
#[derive(Error, Debug, Clone)]
pub enum ConsensusError {
    /// Invalid block
    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    /// Invalid validator
    #[error("Invalid validator: {0}")]
    InvalidValidator(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Signing or key handling failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Other error
    #[error("Consensus error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for ConsensusError {
    fn from(err: serde_json::Error) -> Self {
        ConsensusError::Serialization(err.to_string())
    }
}

impl From<chain_core::CoreError> for ConsensusError {
    fn from(err: chain_core::CoreError) -> Self {
        match err {
            chain_core::CoreError::Encode(e) => ConsensusError::Serialization(e.to_string()),
            chain_core::CoreError::Decode(e) => ConsensusError::Serialization(e.to_string()),
            other => ConsensusError::Crypto(other.to_string()),
        }
    }
}

impl From<prometheus::Error> for ConsensusError {
    fn from(err: prometheus::Error) -> Self {
        ConsensusError::Other(format!("metrics: {}", err))
    }
}

impl From<anyhow::Error> for ConsensusError {
    fn from(err: anyhow::Error) -> Self {
        ConsensusError::Other(err.to_string())
    }
}

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;
