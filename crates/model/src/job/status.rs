use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of one job shard, or of a consistency check job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Preparing,
    PreparingFailure,
    RunningInventory,
    RunningIncremental,
    ExecuteInventoryTaskFailure,
    ExecuteIncrementalTaskFailure,
    /// A consistency check is running.
    Checking,
    /// A consistency check completed.
    Finished,
    CheckFailure,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "CREATED",
            JobStatus::Preparing => "PREPARING",
            JobStatus::PreparingFailure => "PREPARING_FAILURE",
            JobStatus::RunningInventory => "RUNNING_INVENTORY",
            JobStatus::RunningIncremental => "RUNNING_INCREMENTAL",
            JobStatus::ExecuteInventoryTaskFailure => "EXECUTE_INVENTORY_TASK_FAILURE",
            JobStatus::ExecuteIncrementalTaskFailure => "EXECUTE_INCREMENTAL_TASK_FAILURE",
            JobStatus::Checking => "CHECKING",
            JobStatus::Finished => "FINISHED",
            JobStatus::CheckFailure => "CHECK_FAILURE",
            JobStatus::Stopped => "STOPPED",
        }
    }

    /// Active states during which processed counts only grow.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            JobStatus::Preparing
                | JobStatus::RunningInventory
                | JobStatus::RunningIncremental
                | JobStatus::Checking
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            JobStatus::PreparingFailure
                | JobStatus::ExecuteInventoryTaskFailure
                | JobStatus::ExecuteIncrementalTaskFailure
                | JobStatus::CheckFailure
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_in_screaming_snake_case() {
        let json = serde_json::to_string(&JobStatus::RunningIncremental).unwrap();
        assert_eq!(json, "\"RUNNING_INCREMENTAL\"");
        assert_eq!(
            JobStatus::ExecuteInventoryTaskFailure.to_string(),
            "EXECUTE_INVENTORY_TASK_FAILURE"
        );
        assert!(JobStatus::PreparingFailure.is_failure());
        assert!(!JobStatus::Stopped.is_running());
    }
}
