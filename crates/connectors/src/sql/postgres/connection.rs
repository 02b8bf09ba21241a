use crate::{
    adapter::{ChangeStream, PipelineConnection, RangeQuery, StreamRequest},
    dialect::{DdlStatement, PostgresDialect, SqlDialect},
    error::ConnectorError,
    sql::postgres::{
        params::{PgParamStore, PgWire},
        stream::PgChangeStream,
        utils::{connect_client, parse_lsn},
    },
};
use async_trait::async_trait;
use model::{
    core::{column::ColumnMeta, identifiers::SchemaTableName, value::Value},
    job::datasource::DatabaseKind,
    pagination::position::LogPosition,
    records::row::{FieldValue, RowData},
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tokio_postgres::Client;
use tracing::{debug, info};

const QUERY_COLUMNS_SQL: &str = "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod), \
     NOT a.attnotnull, \
     EXISTS (SELECT 1 FROM pg_index i WHERE i.indrelid = a.attrelid AND i.indisprimary \
             AND a.attnum = ANY(i.indkey)) \
     FROM pg_attribute a \
     WHERE a.attrelid = $1::text::regclass AND a.attnum > 0 AND NOT a.attisdropped \
     ORDER BY a.attnum";

const QUERY_UNIQUE_KEY_SQL: &str = "SELECT a.attname::text \
     FROM pg_index i JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = i.indkey[0] \
     WHERE i.indrelid = $1::text::regclass AND (i.indisprimary OR i.indisunique) AND i.indnatts = 1 \
     ORDER BY i.indisprimary DESC LIMIT 1";

const QUERY_SLOT_SQL: &str =
    "SELECT confirmed_flush_lsn::text FROM pg_replication_slots WHERE slot_name = $1";

const CREATE_SLOT_SQL: &str =
    "SELECT lsn::text FROM pg_create_logical_replication_slot($1, 'wal2json')";

const DROP_SLOT_SQL: &str =
    "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots WHERE slot_name = $1";

/// Column layout of a table with the wire type of every column.
#[derive(Debug)]
pub(crate) struct TableShape {
    pub columns: Vec<(ColumnMeta, PgWire)>,
}

impl TableShape {
    pub fn column(&self, name: &str) -> Result<&(ColumnMeta, PgWire), ConnectorError> {
        self.columns
            .iter()
            .find(|(c, _)| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| ConnectorError::InvalidMetadata(format!("unknown column '{name}'")))
    }

    fn select_list(&self, dialect: &PostgresDialect) -> String {
        self.columns
            .iter()
            .map(|(c, wire)| format!("{}::{}", dialect.quote_identifier(&c.name), wire.cast()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn decode(&self, entity: &str, row: &tokio_postgres::Row) -> Result<RowData, ConnectorError> {
        let mut fields = Vec::with_capacity(self.columns.len());
        for (idx, (column, wire)) in self.columns.iter().enumerate() {
            fields.push(FieldValue {
                name: column.name.clone(),
                value: wire.decode(row, idx)?,
            });
        }
        Ok(RowData::new(entity, fields))
    }
}

/// A PostgreSQL connection used for reading, writing and change capture.
#[derive(Clone)]
pub struct PgConnection {
    client: Arc<Client>,
    dialect: PostgresDialect,
    shapes: Arc<RwLock<HashMap<SchemaTableName, Arc<TableShape>>>>,
}

impl PgConnection {
    pub async fn connect(url: &str) -> Result<Self, ConnectorError> {
        let client = connect_client(url).await?;
        Ok(Self {
            client: Arc::new(client),
            dialect: PostgresDialect,
            shapes: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn regclass(table: &SchemaTableName) -> String {
        table.qualified('"')
    }

    pub(crate) async fn shape(
        &self,
        table: &SchemaTableName,
    ) -> Result<Arc<TableShape>, ConnectorError> {
        if let Some(shape) = self.shapes.read().await.get(table) {
            return Ok(shape.clone());
        }
        let columns = self.load_columns(table).await?;
        if columns.is_empty() {
            return Err(ConnectorError::TableNotFound(table.to_string()));
        }
        let shape = Arc::new(TableShape {
            columns: columns
                .into_iter()
                .map(|c| {
                    let wire = PgWire::for_column(&c);
                    (c, wire)
                })
                .collect(),
        });
        self.shapes
            .write()
            .await
            .insert(table.clone(), shape.clone());
        Ok(shape)
    }
}

#[async_trait]
impl PipelineConnection for PgConnection {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Postgres
    }

    async fn ping(&self) -> Result<(), ConnectorError> {
        self.client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn table_exists(&self, table: &SchemaTableName) -> Result<bool, ConnectorError> {
        let row = self
            .client
            .query_one(
                "SELECT to_regclass($1::text) IS NOT NULL",
                &[&Self::regclass(table)],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn load_columns(
        &self,
        table: &SchemaTableName,
    ) -> Result<Vec<ColumnMeta>, ConnectorError> {
        if !self.table_exists(table).await? {
            return Err(ConnectorError::TableNotFound(table.to_string()));
        }
        let rows = self
            .client
            .query(QUERY_COLUMNS_SQL, &[&Self::regclass(table)])
            .await?;
        rows.iter()
            .map(|row| -> Result<ColumnMeta, ConnectorError> {
                Ok(ColumnMeta {
                    name: row.try_get(0)?,
                    data_type: row.try_get(1)?,
                    nullable: row.try_get(2)?,
                    primary_key: row.try_get(3)?,
                })
            })
            .collect()
    }

    async fn find_unique_key(
        &self,
        table: &SchemaTableName,
    ) -> Result<Option<ColumnMeta>, ConnectorError> {
        let columns = self.load_columns(table).await?;
        let row = self
            .client
            .query_opt(QUERY_UNIQUE_KEY_SQL, &[&Self::regclass(table)])
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let name: String = row.try_get(0)?;
        Ok(columns.into_iter().find(|c| c.name == name))
    }

    async fn execute_ddl(&self, ddl: &DdlStatement) -> Result<(), ConnectorError> {
        let sql = self.dialect.render(ddl);
        info!(sql = %sql, "Executing DDL");
        self.client.batch_execute(&sql).await?;
        self.shapes.write().await.remove(ddl.table());
        Ok(())
    }

    async fn key_bounds(
        &self,
        table: &SchemaTableName,
        key: &str,
    ) -> Result<Option<(Value, Value)>, ConnectorError> {
        let shape = self.shape(table).await?;
        let (_, wire) = shape.column(key)?;
        let key_ident = self.dialect.quote_identifier(key);
        let sql = format!(
            "SELECT min({key_ident})::{cast}, max({key_ident})::{cast} FROM {table}",
            cast = wire.cast(),
            table = self.dialect.quote_table(table),
        );
        let row = self.client.query_one(&sql, &[]).await?;
        let min = wire.decode(&row, 0)?;
        let max = wire.decode(&row, 1)?;
        if min.is_null() || max.is_null() {
            return Ok(None);
        }
        Ok(Some((min, max)))
    }

    async fn count_rows(&self, table: &SchemaTableName) -> Result<u64, ConnectorError> {
        let sql = format!("SELECT count(*) FROM {}", self.dialect.quote_table(table));
        let row = self.client.query_one(&sql, &[]).await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    async fn fetch_range(&self, query: &RangeQuery) -> Result<Vec<RowData>, ConnectorError> {
        let shape = self.shape(&query.table).await?;
        let (key_column, key_wire) = shape.column(&query.key)?;
        let key_ident = self.dialect.quote_identifier(&key_column.name);

        let mut params = PgParamStore::default();
        let mut predicates = Vec::new();
        if let Some(after) = &query.after {
            let p = params.push(*key_wire, &key_column.data_type, after);
            predicates.push(format!("{key_ident} > {p}"));
        }
        if let Some(upper) = &query.upper {
            let p = params.push(*key_wire, &key_column.data_type, upper);
            predicates.push(format!("{key_ident} <= {p}"));
        }
        let where_clause = if predicates.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", predicates.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM {}{where_clause} ORDER BY {key_ident} LIMIT {}",
            shape.select_list(&self.dialect),
            self.dialect.quote_table(&query.table),
            query.limit,
        );
        debug!(sql = %sql, "Fetching range");

        let rows = self.client.query(&sql, &params.as_refs()).await?;
        rows.iter()
            .map(|row| shape.decode(&query.table.table, row))
            .collect()
    }

    async fn upsert_rows(
        &self,
        table: &SchemaTableName,
        key: &str,
        rows: &[RowData],
    ) -> Result<u64, ConnectorError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let shape = self.shape(table).await?;
        let mut params = PgParamStore::default();
        let mut tuples = Vec::with_capacity(rows.len());
        for row in rows {
            let placeholders: Vec<String> = shape
                .columns
                .iter()
                .map(|(c, wire)| params.push(*wire, &c.data_type, &row.get_value(&c.name)))
                .collect();
            tuples.push(format!("({})", placeholders.join(", ")));
        }

        let column_list: Vec<String> = shape
            .columns
            .iter()
            .map(|(c, _)| self.dialect.quote_identifier(&c.name))
            .collect();
        let updates: Vec<String> = shape
            .columns
            .iter()
            .filter(|(c, _)| !c.name.eq_ignore_ascii_case(key))
            .map(|(c, _)| {
                let ident = self.dialect.quote_identifier(&c.name);
                format!("{ident} = EXCLUDED.{ident}")
            })
            .collect();
        let conflict = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) {conflict}",
            self.dialect.quote_table(table),
            column_list.join(", "),
            tuples.join(", "),
            self.dialect.quote_identifier(key),
        );

        let affected = self.client.execute(&sql, &params.as_refs()).await?;
        Ok(affected)
    }

    async fn delete_rows(
        &self,
        table: &SchemaTableName,
        key: &str,
        keys: &[Value],
    ) -> Result<u64, ConnectorError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let shape = self.shape(table).await?;
        let (key_column, key_wire) = shape.column(key)?;
        let mut params = PgParamStore::default();
        let placeholders: Vec<String> = keys
            .iter()
            .map(|k| params.push(*key_wire, &key_column.data_type, k))
            .collect();
        let sql = format!(
            "DELETE FROM {} WHERE {} IN ({})",
            self.dialect.quote_table(table),
            self.dialect.quote_identifier(&key_column.name),
            placeholders.join(", "),
        );
        let affected = self.client.execute(&sql, &params.as_refs()).await?;
        Ok(affected)
    }

    async fn init_change_capture(&self, slot: &str) -> Result<LogPosition, ConnectorError> {
        if let Some(row) = self.client.query_opt(QUERY_SLOT_SQL, &[&slot]).await? {
            let lsn: Option<String> = row.try_get(0)?;
            if let Some(lsn) = lsn {
                return parse_lsn(&lsn);
            }
        }
        let row = self.client.query_one(CREATE_SLOT_SQL, &[&slot]).await?;
        let lsn: String = row.try_get(0)?;
        info!(slot, lsn = %lsn, "Created logical replication slot");
        parse_lsn(&lsn)
    }

    async fn release_change_capture(&self, slot: &str) -> Result<(), ConnectorError> {
        self.client.execute(DROP_SLOT_SQL, &[&slot]).await?;
        Ok(())
    }

    async fn open_change_stream(
        &self,
        request: &StreamRequest,
    ) -> Result<Box<dyn ChangeStream>, ConnectorError> {
        let shape = self.shape(&request.table).await?;
        Ok(Box::new(PgChangeStream::new(
            self.client.clone(),
            request,
            shape,
        )))
    }
}
