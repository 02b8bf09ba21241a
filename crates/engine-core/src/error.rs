use thiserror::Error;

/// Errors raised by the coordination service and the repository built on it.
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Failed to encode node: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Failed to (de)serialize value at {path}: {source}")]
    Serialization {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Wait cancelled")]
    Cancelled,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Unknown rate limit algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("Invalid rate limit properties: {0}")]
    InvalidProps(String),

    #[error("Acquire cancelled")]
    Cancelled,
}
