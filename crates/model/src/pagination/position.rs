use crate::core::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic offset into a source's change log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogPosition(pub u64);

impl LogPosition {
    pub fn offset(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resumable position of a task.
///
/// Inventory units move through `Inventory` cursors until they reach their
/// upper bound and become `Finished`. Incremental tasks carry a `Log`
/// position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    /// Rows with key `> after` (or all rows when `None`) and `<= upper`
    /// (or unbounded when `None`) remain to be copied.
    Inventory {
        after: Option<Value>,
        upper: Option<Value>,
    },
    /// The inventory unit has been drained.
    Finished,
    Log(LogPosition),
}

impl Position {
    pub fn unbounded() -> Self {
        Position::Inventory {
            after: None,
            upper: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Position::Finished)
    }

    /// Advances an inventory cursor past `key`, keeping its upper bound.
    pub fn advance(&self, key: Value) -> Position {
        match self {
            Position::Inventory { upper, .. } => Position::Inventory {
                after: Some(key),
                upper: upper.clone(),
            },
            other => other.clone(),
        }
    }

    pub fn log_position(&self) -> Option<LogPosition> {
        match self {
            Position::Log(p) => Some(*p),
            _ => None,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Inventory { after, upper } => {
                let lower = after.as_ref().map_or("-inf".to_string(), |v| v.to_string());
                let upper = upper.as_ref().map_or("+inf".to_string(), |v| v.to_string());
                write!(f, "inventory({lower}, {upper}]")
            }
            Position::Finished => write!(f, "finished"),
            Position::Log(p) => write!(f, "log@{p}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_keeps_upper_bound() {
        let start = Position::Inventory {
            after: None,
            upper: Some(Value::Int(100)),
        };
        let next = start.advance(Value::Int(42));
        assert_eq!(
            next,
            Position::Inventory {
                after: Some(Value::Int(42)),
                upper: Some(Value::Int(100)),
            }
        );
        assert_eq!(next.to_string(), "inventory(42, 100]");
        assert_eq!(Position::Finished.advance(Value::Int(1)), Position::Finished);
    }

    #[test]
    fn positions_survive_json() {
        let pos = Position::Log(LogPosition(17));
        let json = serde_json::to_string(&pos).unwrap();
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(back.log_position(), Some(LogPosition(17)));
    }
}
