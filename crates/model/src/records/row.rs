use crate::core::value::Value;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    pub name: String,
    pub value: Value,
}

impl FieldValue {
    pub fn new(name: &str, value: impl Into<Value>) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
        }
    }
}

/// One row of a table, with fields in column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowData {
    pub entity: String,
    pub field_values: Vec<FieldValue>,
}

impl RowData {
    pub fn new(entity: &str, field_values: Vec<FieldValue>) -> Self {
        RowData {
            entity: entity.to_string(),
            field_values,
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.field_values
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(field))
    }

    pub fn get_value(&self, field: &str) -> Value {
        self.get(field)
            .map(|f| f.value.clone())
            .unwrap_or(Value::Null)
    }

    pub fn set_value(&mut self, field: &str, value: Value) {
        match self
            .field_values
            .iter_mut()
            .find(|f| f.name.eq_ignore_ascii_case(field))
        {
            Some(existing) => existing.value = value,
            None => self.field_values.push(FieldValue {
                name: field.to_string(),
                value,
            }),
        }
    }

    /// Same row addressed at another table.
    pub fn with_entity(mut self, entity: &str) -> Self {
        self.entity = entity.to_string();
        self
    }

    /// Deterministic bytes over field names and values, independent of the
    /// entity so that source and target rows compare equal.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut fields: Vec<&FieldValue> = self.field_values.iter().collect();
        fields.sort_by_key(|f| f.name.to_ascii_lowercase());

        let mut out = Vec::with_capacity(fields.len() * 16);
        for field in fields {
            out.extend_from_slice(field.name.to_ascii_lowercase().as_bytes());
            out.push(0);
            field.value.write_canonical(&mut out);
        }
        out
    }

    /// Field-wise equality that ignores the entity and field order.
    pub fn same_content(&self, other: &RowData) -> bool {
        self.field_values.len() == other.field_values.len()
            && self
                .field_values
                .iter()
                .all(|f| other.get(&f.name).is_some_and(|o| o.value == f.value))
    }

    pub fn size_bytes(&self) -> usize {
        self.field_values
            .iter()
            .map(|f| f.name.len() + f.value.as_text().map_or(0, |s| s.len()))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(id: i64, amount: f64) -> RowData {
        RowData::new(
            "orders",
            vec![FieldValue::new("id", id), FieldValue::new("amount", amount)],
        )
    }

    #[test]
    fn canonical_bytes_ignore_entity_and_field_order() {
        let a = order(1, 9.5);
        let mut b = order(1, 9.5).with_entity("orders_new");
        b.field_values.reverse();
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
        assert!(a.same_content(&b));
        assert_ne!(a.canonical_bytes(), order(1, 9.75).canonical_bytes());
    }

    #[test]
    fn set_value_replaces_or_appends() {
        let mut row = order(1, 1.0);
        row.set_value("AMOUNT", Value::Float(2.0));
        row.set_value("status", Value::from("paid"));
        assert_eq!(row.get_value("amount"), Value::Float(2.0));
        assert_eq!(row.get_value("status"), Value::from("paid"));
        assert_eq!(row.get_value("missing"), Value::Null);
    }
}
