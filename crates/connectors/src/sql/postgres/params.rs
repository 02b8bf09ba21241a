use model::{core::column::ColumnMeta, core::value::Value};
use tokio_postgres::{Row, types::ToSql};

/// Representation a column travels in between the server and the pipeline.
///
/// Integer, float and boolean columns are decoded natively; everything else
/// is cast to text on read and cast back to the column type on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PgWire {
    Int8,
    Float8,
    Bool,
    Text,
}

impl PgWire {
    pub fn for_column(column: &ColumnMeta) -> Self {
        if column.is_integral() {
            return PgWire::Int8;
        }
        let base = column.data_type.to_ascii_lowercase();
        match base.as_str() {
            "real" | "double precision" | "float4" | "float8" => PgWire::Float8,
            "boolean" | "bool" => PgWire::Bool,
            _ => PgWire::Text,
        }
    }

    pub fn cast(&self) -> &'static str {
        match self {
            PgWire::Int8 => "int8",
            PgWire::Float8 => "float8",
            PgWire::Bool => "bool",
            PgWire::Text => "text",
        }
    }

    pub fn decode(&self, row: &Row, idx: usize) -> Result<Value, tokio_postgres::Error> {
        let value = match self {
            PgWire::Int8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::Int),
            PgWire::Float8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::Float),
            PgWire::Bool => row.try_get::<_, Option<bool>>(idx)?.map(Value::Boolean),
            PgWire::Text => row.try_get::<_, Option<String>>(idx)?.map(Value::String),
        };
        Ok(value.unwrap_or(Value::Null))
    }

    /// Converts `value` into a parameter of this wire type.
    pub fn param(&self, value: &Value) -> PgParam {
        match self {
            PgWire::Int8 => PgParam(Box::new(value.as_i64())),
            PgWire::Float8 => PgParam(Box::new(value.as_f64())),
            PgWire::Bool => PgParam(Box::new(value.as_bool())),
            PgWire::Text => PgParam(Box::new(value.as_text())),
        }
    }
}

pub(crate) struct PgParam(Box<dyn ToSql + Sync + Send>);

impl AsRef<dyn ToSql + Sync> for PgParam {
    fn as_ref(&self) -> &(dyn ToSql + Sync + 'static) {
        &*self.0
    }
}

#[derive(Default)]
pub(crate) struct PgParamStore {
    pub params: Vec<PgParam>,
}

impl PgParamStore {
    /// Pushes a parameter and returns its placeholder, cast to the column type.
    pub fn push(&mut self, wire: PgWire, column_type: &str, value: &Value) -> String {
        self.params.push(wire.param(value));
        format!("${}::{}::{}", self.params.len(), wire.cast(), column_type)
    }

    pub fn as_refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params
            .iter()
            .map(|param| param.as_ref())
            .collect::<Vec<_>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_types_follow_column_types() {
        assert_eq!(PgWire::for_column(&ColumnMeta::new("id", "integer")), PgWire::Int8);
        assert_eq!(PgWire::for_column(&ColumnMeta::new("r", "double precision")), PgWire::Float8);
        assert_eq!(PgWire::for_column(&ColumnMeta::new("b", "boolean")), PgWire::Bool);
        assert_eq!(PgWire::for_column(&ColumnMeta::new("p", "numeric(10,2)")), PgWire::Text);
    }

    #[test]
    fn placeholders_are_numbered_and_cast() {
        let mut store = PgParamStore::default();
        assert_eq!(store.push(PgWire::Int8, "integer", &Value::Int(1)), "$1::int8::integer");
        assert_eq!(
            store.push(PgWire::Text, "numeric(10,2)", &Value::from("9.50")),
            "$2::text::numeric(10,2)"
        );
        assert_eq!(store.as_refs().len(), 2);
    }
}
