use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid table name: {0}")]
pub struct InvalidTableName(pub String);

/// A table name with an optional schema qualifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaTableName {
    pub schema: Option<String>,
    pub table: String,
}

impl SchemaTableName {
    pub fn new(schema: Option<&str>, table: &str) -> Self {
        Self {
            schema: schema.map(str::to_string),
            table: table.to_string(),
        }
    }

    pub fn table(table: &str) -> Self {
        Self::new(None, table)
    }

    /// Fully qualified name with identifiers quoted using `quote`.
    pub fn qualified(&self, quote: char) -> String {
        match &self.schema {
            Some(schema) => format!("{quote}{schema}{quote}.{quote}{}{quote}", self.table),
            None => format!("{quote}{}{quote}", self.table),
        }
    }
}

impl fmt::Display for SchemaTableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.table),
            None => write!(f, "{}", self.table),
        }
    }
}

impl FromStr for SchemaTableName {
    type Err = InvalidTableName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [table] if !table.is_empty() => Ok(Self::table(table)),
            [schema, table] if !schema.is_empty() && !table.is_empty() => {
                Ok(Self::new(Some(schema), table))
            }
            _ => Err(InvalidTableName(s.to_string())),
        }
    }
}

/// Identifier of a migration job or a consistency check job.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Arc<str>);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(Arc::from(id.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_schema_qualified_names() {
        let name: SchemaTableName = "public.orders".parse().unwrap();
        assert_eq!(name.schema.as_deref(), Some("public"));
        assert_eq!(name.table, "orders");
        assert_eq!(name.qualified('"'), "\"public\".\"orders\"");

        let bare: SchemaTableName = "orders".parse().unwrap();
        assert_eq!(bare.to_string(), "orders");

        assert!("a.b.c".parse::<SchemaTableName>().is_err());
        assert!("".parse::<SchemaTableName>().is_err());
    }
}
