use crate::{
    core::{identifiers::SchemaTableName, value::Value},
    pagination::position::LogPosition,
    records::row::RowData,
};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeOp::Insert => "INSERT",
            ChangeOp::Update => "UPDATE",
            ChangeOp::Delete => "DELETE",
        })
    }
}

/// One row change captured from a source's change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub position: LogPosition,
    pub op: ChangeOp,
    pub table: SchemaTableName,
    /// Unique key of the affected row.
    pub key: Value,
    /// Row image after the change; `None` for deletes.
    pub after: Option<RowData>,
}

impl ChangeEvent {
    pub fn insert(position: LogPosition, table: SchemaTableName, key: Value, row: RowData) -> Self {
        Self {
            position,
            op: ChangeOp::Insert,
            table,
            key,
            after: Some(row),
        }
    }

    pub fn update(position: LogPosition, table: SchemaTableName, key: Value, row: RowData) -> Self {
        Self {
            position,
            op: ChangeOp::Update,
            table,
            key,
            after: Some(row),
        }
    }

    pub fn delete(position: LogPosition, table: SchemaTableName, key: Value) -> Self {
        Self {
            position,
            op: ChangeOp::Delete,
            table,
            key,
            after: None,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.op == ChangeOp::Delete
    }
}
