use crate::{
    adapter::{ChangeStream, StreamRequest},
    error::ConnectorError,
    sql::postgres::{
        connection::TableShape,
        params::PgWire,
        utils::{format_lsn, parse_lsn},
    },
};
use async_trait::async_trait;
use model::{
    core::{identifiers::SchemaTableName, value::Value},
    pagination::position::LogPosition,
    records::{
        change::ChangeEvent,
        row::{FieldValue, RowData},
    },
};
use serde::Deserialize;
use std::{collections::VecDeque, sync::Arc};
use tokio_postgres::Client;
use tracing::debug;

const PEEK_CHANGES_SQL: &str = "SELECT lsn::text, data FROM pg_logical_slot_peek_changes(\
     $1, NULL, $2, 'format-version', '2', 'include-transaction', 'false', 'add-tables', $3)";

const ADVANCE_SLOT_SQL: &str = "SELECT pg_replication_slot_advance($1, $2::text::pg_lsn)";

#[derive(Debug, Deserialize)]
struct Wal2JsonColumn {
    name: String,
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonChange {
    action: String,
    #[serde(default)]
    columns: Vec<Wal2JsonColumn>,
    #[serde(default)]
    identity: Vec<Wal2JsonColumn>,
}

/// Tails one table through a `wal2json` logical replication slot.
///
/// Peeking does not consume changes, so events already returned but not yet
/// acknowledged are fetched again and skipped by position.
pub(crate) struct PgChangeStream {
    client: Arc<Client>,
    slot: String,
    table: SchemaTableName,
    key: String,
    shape: Arc<TableShape>,
    after: LogPosition,
    unacked: VecDeque<LogPosition>,
}

impl PgChangeStream {
    pub fn new(client: Arc<Client>, request: &StreamRequest, shape: Arc<TableShape>) -> Self {
        Self {
            client,
            slot: request.slot.clone(),
            table: request.table.clone(),
            key: request.key.clone(),
            shape,
            after: request.from,
            unacked: VecDeque::new(),
        }
    }

    fn filter_table(&self) -> String {
        format!(
            "{}.{}",
            self.table.schema.as_deref().unwrap_or("public"),
            self.table.table
        )
    }

    fn to_row(&self, columns: Vec<Wal2JsonColumn>) -> RowData {
        let fields = columns
            .into_iter()
            .map(|c| {
                let value = Value::from(c.value);
                // Text-wired columns are compared as text everywhere else.
                let value = match self.shape.column(&c.name) {
                    Ok((_, PgWire::Text)) if !value.is_null() => {
                        Value::String(value.as_text().unwrap_or_default())
                    }
                    _ => value,
                };
                FieldValue { name: c.name, value }
            })
            .collect();
        RowData::new(&self.table.table, fields)
    }

    fn decode(&self, position: LogPosition, data: &str) -> Result<Option<ChangeEvent>, ConnectorError> {
        let change: Wal2JsonChange = serde_json::from_str(data)
            .map_err(|e| ConnectorError::Decode(format!("wal2json payload: {e}")))?;
        let event = match change.action.as_str() {
            "I" | "U" => {
                let row = self.to_row(change.columns);
                let key = row.get_value(&self.key);
                if change.action == "I" {
                    ChangeEvent::insert(position, self.table.clone(), key, row)
                } else {
                    ChangeEvent::update(position, self.table.clone(), key, row)
                }
            }
            "D" => {
                let identity = self.to_row(change.identity);
                ChangeEvent::delete(position, self.table.clone(), identity.get_value(&self.key))
            }
            // Truncate, message and transaction markers carry no row change.
            _ => return Ok(None),
        };
        if event.key.is_null() {
            return Err(ConnectorError::Decode(format!(
                "change on {} carries no value for key '{}'",
                self.table, self.key
            )));
        }
        Ok(Some(event))
    }
}

#[async_trait]
impl ChangeStream for PgChangeStream {
    async fn poll(&mut self, max: usize) -> Result<Vec<ChangeEvent>, ConnectorError> {
        let limit = (max + self.unacked.len()) as i32;
        let rows = self
            .client
            .query(PEEK_CHANGES_SQL, &[&self.slot, &limit, &self.filter_table()])
            .await?;

        let mut events = Vec::new();
        for row in rows {
            let lsn: String = row.try_get(0)?;
            let position = parse_lsn(&lsn)?;
            if position <= self.after {
                continue;
            }
            let data: String = row.try_get(1)?;
            if let Some(event) = self.decode(position, &data)? {
                events.push(event);
            }
            self.after = position;
            self.unacked.push_back(position);
            if events.len() >= max {
                break;
            }
        }
        debug!(slot = %self.slot, events = events.len(), "Polled change stream");
        Ok(events)
    }

    async fn ack(&mut self, position: LogPosition) -> Result<(), ConnectorError> {
        self.client
            .query(ADVANCE_SLOT_SQL, &[&self.slot, &format_lsn(position)])
            .await?;
        while self.unacked.front().is_some_and(|p| *p <= position) {
            self.unacked.pop_front();
        }
        Ok(())
    }
}
