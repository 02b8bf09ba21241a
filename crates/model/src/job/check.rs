use crate::core::value::Value;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountCheckResult {
    pub source_records: u64,
    pub target_records: u64,
}

impl CountCheckResult {
    pub fn is_matched(&self) -> bool {
        self.source_records == self.target_records
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentCheckResult {
    pub matched: bool,
    /// Key of the first row found to differ, if any.
    pub first_mismatch_key: Option<Value>,
    /// Algorithm-specific summary, e.g. differing chunk digests.
    pub detail: Option<String>,
}

/// Outcome of checking one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyCheckResult {
    pub algorithm: String,
    pub count: CountCheckResult,
    pub content: ContentCheckResult,
}

impl ConsistencyCheckResult {
    pub fn is_matched(&self) -> bool {
        self.count.is_matched() && self.content.matched
    }
}
