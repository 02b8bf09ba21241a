use thiserror::Error;

/// Errors raised by connections, change streams and the data-source factory.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The connection URL could not be parsed.
    #[error("Invalid connection URL: {0}")]
    InvalidUrl(String),

    /// TLS negotiation failed.
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// Any PostgreSQL driver error.
    #[error("Postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// The data source is unreachable or refused the connection.
    #[error("Data source unavailable: {0}")]
    Unavailable(String),

    /// The requested table does not exist.
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// A mis-configured or unsupported database driver was requested.
    #[error("Unsupported driver: {0}")]
    UnsupportedDriver(String),

    /// Metadata returned by the data source could not be interpreted.
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    /// A change event could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Writing rows was rejected by the data source.
    #[error("Write error: {0}")]
    Write(String),

    /// Reading rows failed.
    #[error("Read error: {0}")]
    Read(String),
}

impl ConnectorError {
    /// Failures that may clear up on their own, such as dropped connections.
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectorError::Unavailable(_) | ConnectorError::Read(_) => true,
            ConnectorError::Postgres(err) => err.is_closed(),
            _ => false,
        }
    }
}
