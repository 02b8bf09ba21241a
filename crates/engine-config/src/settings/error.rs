use engine_core::error::RateLimitError;
use thiserror::Error;

/// Errors raised when validating job specs or process settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// One or more settings failed validation.
    #[error("Settings validation failed: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),

    /// The data source kind has no pipeline support.
    #[error("Unsupported database kind: {0}")]
    UnsupportedDatabaseKind(String),

    /// Source nodes of one job must share a database kind.
    #[error("Source nodes have different database kinds: {0}")]
    MixedSourceKinds(String),

    /// No usable single-column unique key was found or given.
    #[error("Table '{0}' has no usable unique key")]
    MissingUniqueKey(String),

    #[error("Duplicate source resource name(s): {}", .0.join(", "))]
    DuplicateResource(Vec<String>),

    #[error("Unknown source resource name(s): {}", .0.join(", "))]
    MissingResource(Vec<String>),

    /// A source table reference is not `resource.table` or `resource.schema.table`.
    #[error("Invalid table reference: {0}")]
    InvalidTableReference(String),

    #[error("Unknown setting: {0}")]
    UnknownSetting(String),

    #[error("Invalid rate limiter: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("Failed to read settings file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
}
