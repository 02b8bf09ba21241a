use crate::{
    core::identifiers::SchemaTableName,
    job::{datasource::DatabaseKind, status::JobStatus},
    pagination::position::Position,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A key-range partition of one shard's source table, copied by one
/// inventory task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryUnit {
    pub id: String,
    pub table: SchemaTableName,
    pub unique_key: String,
    pub position: Position,
}

impl InventoryUnit {
    pub fn unit_id(shard: usize, index: usize) -> String {
        format!("{shard}.{index}")
    }
}

/// Persisted checkpoint of one job shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobItemProgress {
    pub status: JobStatus,
    pub source_kind: Option<DatabaseKind>,
    pub processed_records: u64,
    /// Position of every inventory unit, keyed by unit id.
    #[serde(default)]
    pub inventory: BTreeMap<String, Position>,
    /// Where the incremental task resumes; captured before inventory starts.
    #[serde(default)]
    pub incremental: Option<Position>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub check_begin_millis: Option<i64>,
    #[serde(default)]
    pub check_end_millis: Option<i64>,
    pub updated_at_millis: i64,
}

impl JobItemProgress {
    pub fn new(source_kind: Option<DatabaseKind>) -> Self {
        Self {
            status: JobStatus::Created,
            source_kind,
            processed_records: 0,
            inventory: BTreeMap::new(),
            incremental: None,
            error_message: None,
            check_begin_millis: None,
            check_end_millis: None,
            updated_at_millis: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// True once inventory has been split and every unit is drained.
    pub fn is_inventory_finished(&self) -> bool {
        !self.inventory.is_empty() && self.inventory.values().all(Position::is_finished)
    }

    pub fn inventory_finished_percentage(&self) -> u8 {
        if self.inventory.is_empty() {
            return 0;
        }
        let finished = self.inventory.values().filter(|p| p.is_finished()).count();
        ((finished * 100) / self.inventory.len()) as u8
    }

    pub fn touch(&mut self) {
        self.updated_at_millis = chrono::Utc::now().timestamp_millis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::Value;

    #[test]
    fn inventory_finishes_only_when_every_unit_is_drained() {
        let mut progress = JobItemProgress::new(Some(DatabaseKind::Memory));
        assert!(!progress.is_inventory_finished());

        progress.inventory.insert("0.0".into(), Position::Finished);
        progress.inventory.insert(
            "0.1".into(),
            Position::Inventory {
                after: Some(Value::Int(5)),
                upper: None,
            },
        );
        assert!(!progress.is_inventory_finished());
        assert_eq!(progress.inventory_finished_percentage(), 50);

        progress.inventory.insert("0.1".into(), Position::Finished);
        assert!(progress.is_inventory_finished());
    }

    #[test]
    fn progress_round_trips_through_json() {
        let mut progress = JobItemProgress::new(Some(DatabaseKind::Postgres));
        progress.status = JobStatus::RunningInventory;
        progress.inventory.insert(
            InventoryUnit::unit_id(0, 0),
            Position::Inventory {
                after: Some(Value::Int(10)),
                upper: Some(Value::Int(20)),
            },
        );
        let json = serde_json::to_string(&progress).unwrap();
        let back: JobItemProgress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, progress);
    }
}
