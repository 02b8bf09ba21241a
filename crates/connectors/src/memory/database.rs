use crate::{dialect::DdlStatement, error::ConnectorError};
use model::{
    core::{column::ColumnMeta, identifiers::SchemaTableName, value::Value},
    pagination::position::LogPosition,
    records::{change::ChangeEvent, row::RowData},
};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub(crate) struct MemoryTable {
    pub columns: Vec<ColumnMeta>,
    pub key: String,
    pub rows: BTreeMap<Value, RowData>,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    fail_writes: u32,
    fail_reads: u32,
}

#[derive(Debug, Default)]
pub(crate) struct MemoryState {
    pub tables: BTreeMap<SchemaTableName, MemoryTable>,
    /// Every row change, position `n` at index `n - 1`.
    pub log: Vec<ChangeEvent>,
    pub ddl_log: Vec<DdlStatement>,
    pub slots: BTreeMap<String, LogPosition>,
    faults: Faults,
}

impl MemoryState {
    fn next_position(&self) -> LogPosition {
        LogPosition(self.log.len() as u64 + 1)
    }

    pub fn head(&self) -> LogPosition {
        LogPosition(self.log.len() as u64)
    }

    pub fn table_mut(&mut self, table: &SchemaTableName) -> Result<&mut MemoryTable, ConnectorError> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| ConnectorError::TableNotFound(table.to_string()))
    }

    pub fn table(&self, table: &SchemaTableName) -> Result<&MemoryTable, ConnectorError> {
        self.tables
            .get(table)
            .ok_or_else(|| ConnectorError::TableNotFound(table.to_string()))
    }

    pub fn check_available(&self, name: &str) -> Result<(), ConnectorError> {
        if self.faults.unavailable {
            return Err(ConnectorError::Unavailable(format!(
                "memory database '{name}' is offline"
            )));
        }
        Ok(())
    }

    pub fn take_write_fault(&mut self, name: &str) -> Result<(), ConnectorError> {
        self.check_available(name)?;
        if self.faults.fail_writes > 0 {
            self.faults.fail_writes -= 1;
            return Err(ConnectorError::Unavailable(format!(
                "injected write failure on '{name}'"
            )));
        }
        Ok(())
    }

    pub fn take_read_fault(&mut self, name: &str) -> Result<(), ConnectorError> {
        self.check_available(name)?;
        if self.faults.fail_reads > 0 {
            self.faults.fail_reads -= 1;
            return Err(ConnectorError::Read(format!(
                "injected read failure on '{name}'"
            )));
        }
        Ok(())
    }

    /// Inserts or replaces a row and logs the change.
    pub fn put(&mut self, table: &SchemaTableName, row: RowData) -> Result<(), ConnectorError> {
        let position = self.next_position();
        let entry = self.table_mut(table)?;
        let key = row.get_value(&entry.key);
        if key.is_null() {
            return Err(ConnectorError::Write(format!(
                "row for {table} has no value for key '{}'",
                entry.key
            )));
        }
        let row = row.with_entity(&table.table);
        let event = match entry.rows.insert(key.clone(), row.clone()) {
            Some(_) => ChangeEvent::update(position, table.clone(), key, row),
            None => ChangeEvent::insert(position, table.clone(), key, row),
        };
        self.log.push(event);
        Ok(())
    }

    /// Removes a row if present; returns whether it existed.
    pub fn remove(&mut self, table: &SchemaTableName, key: &Value) -> Result<bool, ConnectorError> {
        let position = self.next_position();
        let entry = self.table_mut(table)?;
        if entry.rows.remove(key).is_none() {
            return Ok(false);
        }
        self.log
            .push(ChangeEvent::delete(position, table.clone(), key.clone()));
        Ok(true)
    }

    pub fn apply_ddl(&mut self, ddl: &DdlStatement) -> Result<(), ConnectorError> {
        self.ddl_log.push(ddl.clone());
        match ddl {
            DdlStatement::CreateTable {
                table,
                columns,
                unique_key,
                if_not_exists,
            } => {
                if self.tables.contains_key(table) {
                    if *if_not_exists {
                        return Ok(());
                    }
                    return Err(ConnectorError::Write(format!("table {table} already exists")));
                }
                self.tables.insert(
                    table.clone(),
                    MemoryTable {
                        columns: columns.clone(),
                        key: unique_key.clone(),
                        rows: BTreeMap::new(),
                    },
                );
            }
            DdlStatement::DropTable { table, if_exists } => {
                if self.tables.remove(table).is_none() && !*if_exists {
                    return Err(ConnectorError::TableNotFound(table.to_string()));
                }
            }
        }
        Ok(())
    }
}

/// An in-process database with keyed tables and an append-only change log.
///
/// Every mutation, whether made directly or through a connection, is
/// appended to the log so that change streams observe it.
#[derive(Debug)]
pub struct MemoryDatabase {
    name: String,
    pub(crate) state: Mutex<MemoryState>,
}

impl MemoryDatabase {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates a table keyed on its primary key column.
    pub async fn create_table(
        &self,
        table: &SchemaTableName,
        columns: Vec<ColumnMeta>,
    ) -> Result<(), ConnectorError> {
        let key = columns
            .iter()
            .find(|c| c.primary_key)
            .map(|c| c.name.clone())
            .ok_or_else(|| {
                ConnectorError::InvalidMetadata(format!("table {table} needs a primary key"))
            })?;
        let mut state = self.state.lock().await;
        state.tables.insert(
            table.clone(),
            MemoryTable {
                columns,
                key,
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub async fn insert(&self, table: &SchemaTableName, row: RowData) -> Result<(), ConnectorError> {
        self.state.lock().await.put(table, row)
    }

    pub async fn update(&self, table: &SchemaTableName, row: RowData) -> Result<(), ConnectorError> {
        self.state.lock().await.put(table, row)
    }

    pub async fn delete(&self, table: &SchemaTableName, key: &Value) -> Result<bool, ConnectorError> {
        self.state.lock().await.remove(table, key)
    }

    /// Rows of `table` in key order; empty if the table does not exist.
    pub async fn rows(&self, table: &SchemaTableName) -> Vec<RowData> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get(&self, table: &SchemaTableName, key: &Value) -> Option<RowData> {
        let state = self.state.lock().await;
        state.tables.get(table).and_then(|t| t.rows.get(key).cloned())
    }

    pub async fn has_table(&self, table: &SchemaTableName) -> bool {
        self.state.lock().await.tables.contains_key(table)
    }

    pub async fn ddl_log(&self) -> Vec<DdlStatement> {
        self.state.lock().await.ddl_log.clone()
    }

    pub async fn change_log_len(&self) -> usize {
        self.state.lock().await.log.len()
    }

    pub async fn slots(&self) -> Vec<String> {
        self.state.lock().await.slots.keys().cloned().collect()
    }

    /// Makes every connection operation fail until reset.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.faults.unavailable = unavailable;
    }

    /// Fails the next `n` upserts or deletes with a transient error.
    pub async fn fail_next_writes(&self, n: u32) {
        self.state.lock().await.faults.fail_writes = n;
    }

    /// Fails the next `n` range reads or change polls with a transient error.
    pub async fn fail_next_reads(&self, n: u32) {
        self.state.lock().await.faults.fail_reads = n;
    }
}
