pub mod cb;
pub mod check;
pub mod error;
pub mod importer;
pub mod incremental;
pub mod inventory;
pub mod progress;
pub mod retry;

/// How a task's `run` ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// All assigned work is done.
    Completed,
    /// A stop was requested; progress up to here is checkpointed.
    Stopped,
}
