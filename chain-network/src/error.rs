//! Network error types

use thiserror::Error;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Peer connection error: {0}")]
    Connection(String),

    #[error("Message encoding error: {0}")]
    Encoding(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Peer closed the connection before replying")]
    NoReply,

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Network timeout")]
    Timeout,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<chain_consensus::ConsensusError> for NetworkError {
    fn from(err: chain_consensus::ConsensusError) -> Self {
        NetworkError::Encoding(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for NetworkError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        NetworkError::Timeout
    }
}
