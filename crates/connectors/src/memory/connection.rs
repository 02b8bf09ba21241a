use crate::{
    adapter::{ChangeStream, PipelineConnection, RangeQuery, StreamRequest},
    dialect::DdlStatement,
    error::ConnectorError,
    memory::database::MemoryDatabase,
};
use async_trait::async_trait;
use model::{
    core::{column::ColumnMeta, identifiers::SchemaTableName, value::Value},
    job::datasource::DatabaseKind,
    pagination::position::LogPosition,
    records::{change::ChangeEvent, row::RowData},
};
use std::{ops::Bound, sync::Arc};

/// A connection to a [`MemoryDatabase`].
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    db: Arc<MemoryDatabase>,
}

impl MemoryConnection {
    pub fn new(db: Arc<MemoryDatabase>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PipelineConnection for MemoryConnection {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Memory
    }

    async fn ping(&self) -> Result<(), ConnectorError> {
        self.db.state.lock().await.check_available(self.db.name())
    }

    async fn table_exists(&self, table: &SchemaTableName) -> Result<bool, ConnectorError> {
        let state = self.db.state.lock().await;
        state.check_available(self.db.name())?;
        Ok(state.tables.contains_key(table))
    }

    async fn load_columns(
        &self,
        table: &SchemaTableName,
    ) -> Result<Vec<ColumnMeta>, ConnectorError> {
        let state = self.db.state.lock().await;
        state.check_available(self.db.name())?;
        Ok(state.table(table)?.columns.clone())
    }

    async fn find_unique_key(
        &self,
        table: &SchemaTableName,
    ) -> Result<Option<ColumnMeta>, ConnectorError> {
        let state = self.db.state.lock().await;
        state.check_available(self.db.name())?;
        let entry = state.table(table)?;
        Ok(entry
            .columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(&entry.key))
            .cloned())
    }

    async fn execute_ddl(&self, ddl: &DdlStatement) -> Result<(), ConnectorError> {
        let mut state = self.db.state.lock().await;
        state.check_available(self.db.name())?;
        state.apply_ddl(ddl)
    }

    async fn key_bounds(
        &self,
        table: &SchemaTableName,
        _key: &str,
    ) -> Result<Option<(Value, Value)>, ConnectorError> {
        let state = self.db.state.lock().await;
        state.check_available(self.db.name())?;
        let rows = &state.table(table)?.rows;
        Ok(rows
            .first_key_value()
            .zip(rows.last_key_value())
            .map(|((min, _), (max, _))| (min.clone(), max.clone())))
    }

    async fn count_rows(&self, table: &SchemaTableName) -> Result<u64, ConnectorError> {
        let state = self.db.state.lock().await;
        state.check_available(self.db.name())?;
        Ok(state.table(table)?.rows.len() as u64)
    }

    async fn fetch_range(&self, query: &RangeQuery) -> Result<Vec<RowData>, ConnectorError> {
        let mut state = self.db.state.lock().await;
        state.take_read_fault(self.db.name())?;
        let rows = &state.table(&query.table)?.rows;
        if let (Some(after), Some(upper)) = (&query.after, &query.upper) {
            if after >= upper {
                return Ok(Vec::new());
            }
        }
        let lower = match &query.after {
            Some(after) => Bound::Excluded(after.clone()),
            None => Bound::Unbounded,
        };
        let upper = match &query.upper {
            Some(upper) => Bound::Included(upper.clone()),
            None => Bound::Unbounded,
        };
        Ok(rows
            .range((lower, upper))
            .take(query.limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn upsert_rows(
        &self,
        table: &SchemaTableName,
        _key: &str,
        rows: &[RowData],
    ) -> Result<u64, ConnectorError> {
        let mut state = self.db.state.lock().await;
        state.take_write_fault(self.db.name())?;
        for row in rows {
            state.put(table, row.clone())?;
        }
        Ok(rows.len() as u64)
    }

    async fn delete_rows(
        &self,
        table: &SchemaTableName,
        _key: &str,
        keys: &[Value],
    ) -> Result<u64, ConnectorError> {
        let mut state = self.db.state.lock().await;
        state.take_write_fault(self.db.name())?;
        let mut deleted = 0;
        for key in keys {
            if state.remove(table, key)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn init_change_capture(&self, slot: &str) -> Result<LogPosition, ConnectorError> {
        let mut state = self.db.state.lock().await;
        state.check_available(self.db.name())?;
        let head = state.head();
        Ok(*state.slots.entry(slot.to_string()).or_insert(head))
    }

    async fn release_change_capture(&self, slot: &str) -> Result<(), ConnectorError> {
        let mut state = self.db.state.lock().await;
        state.check_available(self.db.name())?;
        state.slots.remove(slot);
        Ok(())
    }

    async fn open_change_stream(
        &self,
        request: &StreamRequest,
    ) -> Result<Box<dyn ChangeStream>, ConnectorError> {
        let state = self.db.state.lock().await;
        state.check_available(self.db.name())?;
        if !state.slots.contains_key(&request.slot) {
            return Err(ConnectorError::InvalidMetadata(format!(
                "change capture slot '{}' does not exist",
                request.slot
            )));
        }
        Ok(Box::new(MemoryChangeStream {
            db: self.db.clone(),
            slot: request.slot.clone(),
            table: request.table.clone(),
            after: request.from,
        }))
    }
}

struct MemoryChangeStream {
    db: Arc<MemoryDatabase>,
    slot: String,
    table: SchemaTableName,
    after: LogPosition,
}

#[async_trait]
impl ChangeStream for MemoryChangeStream {
    async fn poll(&mut self, max: usize) -> Result<Vec<ChangeEvent>, ConnectorError> {
        let mut state = self.db.state.lock().await;
        state.take_read_fault(self.db.name())?;
        let start = self.after.offset() as usize;
        let events: Vec<ChangeEvent> = state
            .log
            .iter()
            .skip(start)
            .filter(|e| e.table == self.table)
            .take(max)
            .cloned()
            .collect();
        if let Some(last) = events.last() {
            self.after = last.position;
        }
        Ok(events)
    }

    async fn ack(&mut self, position: LogPosition) -> Result<(), ConnectorError> {
        let mut state = self.db.state.lock().await;
        if let Some(slot) = state.slots.get_mut(&self.slot) {
            *slot = (*slot).max(position);
        }
        Ok(())
    }
}
