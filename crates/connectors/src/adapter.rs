use crate::{dialect::DdlStatement, error::ConnectorError};
use async_trait::async_trait;
use model::{
    core::{column::ColumnMeta, identifiers::SchemaTableName, value::Value},
    job::datasource::DatabaseKind,
    pagination::position::LogPosition,
    records::{change::ChangeEvent, row::RowData},
};

/// A key-ordered page request: rows with `after < key <= upper`, at most `limit`.
#[derive(Debug, Clone)]
pub struct RangeQuery {
    pub table: SchemaTableName,
    pub key: String,
    pub after: Option<Value>,
    pub upper: Option<Value>,
    pub limit: usize,
}

impl RangeQuery {
    pub fn new(table: &SchemaTableName, key: &str, limit: usize) -> Self {
        Self {
            table: table.clone(),
            key: key.to_string(),
            after: None,
            upper: None,
            limit,
        }
    }

    pub fn after(mut self, after: Option<Value>) -> Self {
        self.after = after;
        self
    }

    pub fn upper(mut self, upper: Option<Value>) -> Self {
        self.upper = upper;
        self
    }

    /// Whether `key` falls inside this query's range, ignoring the limit.
    pub fn contains(&self, key: &Value) -> bool {
        self.after.as_ref().is_none_or(|after| key > after)
            && self.upper.as_ref().is_none_or(|upper| key <= upper)
    }
}

/// Parameters for tailing a table's changes.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Name of the change-capture slot created by `init_change_capture`.
    pub slot: String,
    pub table: SchemaTableName,
    pub key: String,
    /// Events at or before this position are skipped.
    pub from: LogPosition,
}

/// A connection to one data source, as used by the migration pipeline.
#[async_trait]
pub trait PipelineConnection: Send + Sync {
    fn kind(&self) -> DatabaseKind;

    /// Verifies the data source is reachable.
    async fn ping(&self) -> Result<(), ConnectorError>;

    async fn table_exists(&self, table: &SchemaTableName) -> Result<bool, ConnectorError>;

    async fn load_columns(&self, table: &SchemaTableName)
    -> Result<Vec<ColumnMeta>, ConnectorError>;

    /// The single-column primary or unique key usable as copy order.
    async fn find_unique_key(
        &self,
        table: &SchemaTableName,
    ) -> Result<Option<ColumnMeta>, ConnectorError> {
        let columns = self.load_columns(table).await?;
        Ok(columns.into_iter().find(|c| c.primary_key))
    }

    async fn execute_ddl(&self, ddl: &DdlStatement) -> Result<(), ConnectorError>;

    /// Minimum and maximum key, `None` for an empty table.
    async fn key_bounds(
        &self,
        table: &SchemaTableName,
        key: &str,
    ) -> Result<Option<(Value, Value)>, ConnectorError>;

    async fn count_rows(&self, table: &SchemaTableName) -> Result<u64, ConnectorError>;

    /// Reads one page in ascending key order.
    async fn fetch_range(&self, query: &RangeQuery) -> Result<Vec<RowData>, ConnectorError>;

    /// Inserts rows, replacing any existing row with the same key.
    async fn upsert_rows(
        &self,
        table: &SchemaTableName,
        key: &str,
        rows: &[RowData],
    ) -> Result<u64, ConnectorError>;

    /// Deletes rows by key; absent keys are ignored.
    async fn delete_rows(
        &self,
        table: &SchemaTableName,
        key: &str,
        keys: &[Value],
    ) -> Result<u64, ConnectorError>;

    /// Ensures change capture is set up under `slot` and returns the
    /// position from which changes are retained.
    async fn init_change_capture(&self, slot: &str) -> Result<LogPosition, ConnectorError>;

    /// Releases resources held by `init_change_capture`. Absent slots are ignored.
    async fn release_change_capture(&self, slot: &str) -> Result<(), ConnectorError>;

    async fn open_change_stream(
        &self,
        request: &StreamRequest,
    ) -> Result<Box<dyn ChangeStream>, ConnectorError>;

    async fn close(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

/// Ordered change events of one table.
#[async_trait]
pub trait ChangeStream: Send {
    /// Returns up to `max` events following the last one returned, in source
    /// order. An empty result means the stream is currently idle.
    async fn poll(&mut self, max: usize) -> Result<Vec<ChangeEvent>, ConnectorError>;

    /// Acknowledges that every event up to `position` is durably applied.
    async fn ack(&mut self, position: LogPosition) -> Result<(), ConnectorError>;
}
