use connectors::error::ConnectorError;
use engine_config::settings::error::SettingsError;
use engine_core::error::CoordinationError;
use engine_processing::error::{CheckError, TaskError};
use thiserror::Error;

/// Top-level errors of the migration job and check job APIs.
#[derive(Debug, Error)]
pub enum JobError {
    /// Invalid job spec or process settings.
    #[error("Configuration error: {0}")]
    Config(#[from] SettingsError),

    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Consistency check error: {0}")]
    Check(#[from] CheckError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The previous check of the job has not finished yet.
    #[error("Consistency check job {0} is still running")]
    CheckJobRunning(String),

    /// Source resources referenced by an existing job cannot be dropped.
    #[error("Source resource(s) {} are used by job {job}", .names.join(", "))]
    ResourceInUse { job: String, names: Vec<String> },

    /// An error occurred while joining a task.
    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}
