use connectors::error::ConnectorError;
use engine_config::settings::error::SettingsError;
use engine_core::error::CoordinationError;
use thiserror::Error;

/// Errors that halt an inventory or incremental task, or a shard's prepare.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Prepare failed: {0}")]
    Prepare(String),

    #[error("Failed to read from {table}: {source}")]
    Read {
        table: String,
        #[source]
        source: ConnectorError,
    },

    #[error("Failed to write to {table}: {source}")]
    Write {
        table: String,
        #[source]
        source: ConnectorError,
    },

    #[error("Retry attempts exhausted on {table}: {source}")]
    RetriesExhausted {
        table: String,
        #[source]
        source: ConnectorError,
    },

    #[error("Circuit breaker opened for change stream of '{table}': {last_error}")]
    CircuitBreakerOpen { table: String, last_error: String },

    #[error("Incremental task has no start position")]
    MissingLogPosition,

    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Failed to persist progress: {0}")]
    Progress(#[from] CoordinationError),

    #[error("Invalid settings: {0}")]
    Settings(#[from] SettingsError),
}

/// Errors raised by a consistency check.
#[derive(Error, Debug)]
pub enum CheckError {
    #[error("Unknown consistency check algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Algorithm {algorithm} does not support database kind {kind}")]
    UnsupportedDatabaseKind { algorithm: String, kind: String },

    #[error("Invalid algorithm properties: {0}")]
    InvalidProps(String),

    #[error("Check on {table} failed: {source}")]
    Connector {
        table: String,
        #[source]
        source: ConnectorError,
    },

    #[error("Failed to open data source: {0}")]
    Open(#[from] ConnectorError),

    #[error("Check cancelled")]
    Cancelled,
}
