use engine_config::settings::error::SettingsError;
use engine_core::error::CoordinationError;
use engine_runtime::error::JobError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize data to JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Job(#[from] JobError),

    #[error("Invalid settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("Failed to open state store at {path}: {source}")]
    StateStore {
        path: String,
        #[source]
        source: CoordinationError,
    },

    /// A source given on the command line is not `name=url` with a known scheme.
    #[error("Invalid source definition '{0}': expected name=url with a known scheme")]
    InvalidSource(String),

    #[error("Invalid algorithm property '{0}': expected key=value")]
    InvalidProp(String),

    #[error("Environment error: {0}")]
    Config(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}
