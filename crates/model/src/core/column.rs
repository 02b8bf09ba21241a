use serde::{Deserialize, Serialize};

/// Column metadata as reported by a connection's metadata loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    /// Native type name of the column, e.g. `bigint` or `varchar(32)`.
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
}

impl ColumnMeta {
    pub fn new(name: &str, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: true,
            primary_key: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Whether values of this column are integers, which allows range splitting.
    pub fn is_integral(&self) -> bool {
        let base = self
            .data_type
            .split('(')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        matches!(
            base.as_str(),
            "int" | "integer" | "bigint" | "smallint" | "int2" | "int4" | "int8" | "serial"
                | "bigserial" | "smallserial" | "tinyint" | "mediumint"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_integral_types() {
        assert!(ColumnMeta::new("id", "BIGINT").is_integral());
        assert!(ColumnMeta::new("id", "int(11)").is_integral());
        assert!(!ColumnMeta::new("code", "varchar(32)").is_integral());
        assert!(!ColumnMeta::new("price", "numeric(10,2)").is_integral());
    }
}
