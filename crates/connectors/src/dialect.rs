use model::core::{column::ColumnMeta, identifiers::SchemaTableName};
use serde::{Deserialize, Serialize};

/// Schema changes the pipeline issues against a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DdlStatement {
    /// Creates `table` with the given columns, keyed on `unique_key`.
    CreateTable {
        table: SchemaTableName,
        columns: Vec<ColumnMeta>,
        unique_key: String,
        if_not_exists: bool,
    },
    DropTable {
        table: SchemaTableName,
        if_exists: bool,
    },
}

impl DdlStatement {
    /// A replica of a source table's layout under the target name.
    pub fn create_table_like(
        columns: &[ColumnMeta],
        unique_key: &str,
        target: &SchemaTableName,
    ) -> Self {
        DdlStatement::CreateTable {
            table: target.clone(),
            columns: columns.to_vec(),
            unique_key: unique_key.to_string(),
            if_not_exists: true,
        }
    }

    pub fn drop_table(table: &SchemaTableName) -> Self {
        DdlStatement::DropTable {
            table: table.clone(),
            if_exists: true,
        }
    }

    pub fn table(&self) -> &SchemaTableName {
        match self {
            DdlStatement::CreateTable { table, .. } | DdlStatement::DropTable { table, .. } => {
                table
            }
        }
    }

    pub fn is_drop(&self) -> bool {
        matches!(self, DdlStatement::DropTable { .. })
    }
}

/// Renders DDL and identifiers for a SQL database.
pub trait SqlDialect: Send + Sync {
    fn quote_identifier(&self, ident: &str) -> String;

    fn quote_table(&self, table: &SchemaTableName) -> String {
        match &table.schema {
            Some(schema) => format!(
                "{}.{}",
                self.quote_identifier(schema),
                self.quote_identifier(&table.table)
            ),
            None => self.quote_identifier(&table.table),
        }
    }

    fn render(&self, ddl: &DdlStatement) -> String {
        match ddl {
            DdlStatement::CreateTable {
                table,
                columns,
                unique_key,
                if_not_exists,
            } => {
                let mut defs: Vec<String> = columns
                    .iter()
                    .map(|c| {
                        let not_null = if c.nullable && !c.name.eq_ignore_ascii_case(unique_key) {
                            ""
                        } else {
                            " NOT NULL"
                        };
                        format!("{} {}{not_null}", self.quote_identifier(&c.name), c.data_type)
                    })
                    .collect();
                defs.push(format!("PRIMARY KEY ({})", self.quote_identifier(unique_key)));
                format!(
                    "CREATE TABLE {}{} ({})",
                    if *if_not_exists { "IF NOT EXISTS " } else { "" },
                    self.quote_table(table),
                    defs.join(", ")
                )
            }
            DdlStatement::DropTable { table, if_exists } => format!(
                "DROP TABLE {}{}",
                if *if_exists { "IF EXISTS " } else { "" },
                self.quote_table(table)
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}
