use crate::check::{ConsistencyCheckAlgorithm, first_mismatch};
use async_trait::async_trait;
use model::{
    job::{check::ContentCheckResult, datasource::DatabaseKind},
    records::row::RowData,
};
use xxhash_rust::xxh3::Xxh3;

pub(crate) const NAME: &str = "DIGEST_MATCH";

const SUPPORTED: &[DatabaseKind] = &[DatabaseKind::Postgres, DatabaseKind::Memory];

/// Compares an xxh3 digest of each chunk and only looks at individual
/// records to locate a difference.
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestMatchAlgorithm;

fn digest(rows: &[RowData]) -> u64 {
    let mut hasher = Xxh3::new();
    for row in rows {
        hasher.update(&row.canonical_bytes());
    }
    hasher.digest()
}

#[async_trait]
impl ConsistencyCheckAlgorithm for DigestMatchAlgorithm {
    fn name(&self) -> &'static str {
        NAME
    }

    fn supported_kinds(&self) -> &'static [DatabaseKind] {
        SUPPORTED
    }

    fn compare_chunk(&self, source: &[RowData], target: &[RowData], key: &str) -> ContentCheckResult {
        let (source_digest, target_digest) = (digest(source), digest(target));
        if source.len() == target.len() && source_digest == target_digest {
            return ContentCheckResult {
                matched: true,
                first_mismatch_key: None,
                detail: None,
            };
        }
        ContentCheckResult {
            matched: false,
            first_mismatch_key: first_mismatch(source, target, key),
            detail: Some(format!(
                "source digest {source_digest:016x} ({} records), target digest {target_digest:016x} ({} records)",
                source.len(),
                target.len()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{core::value::Value, records::row::FieldValue};

    fn row(entity: &str, id: i64, note: &str) -> RowData {
        RowData::new(entity, vec![FieldValue::new("id", id), FieldValue::new("note", note)])
    }

    #[test]
    fn digest_ignores_the_entity_name() {
        let source = vec![row("orders_src", 1, "a"), row("orders_src", 2, "b")];
        let target = vec![row("orders", 1, "a"), row("orders", 2, "b")];
        let result = DigestMatchAlgorithm.compare_chunk(&source, &target, "id");
        assert!(result.matched);
    }

    #[test]
    fn differing_chunk_reports_digests_and_key() {
        let source = vec![row("t", 1, "a"), row("t", 2, "b")];
        let target = vec![row("t", 1, "a"), row("t", 2, "B")];
        let result = DigestMatchAlgorithm.compare_chunk(&source, &target, "id");
        assert!(!result.matched);
        assert_eq!(result.first_mismatch_key, Some(Value::Int(2)));
        assert!(result.detail.unwrap().starts_with("source digest"));
    }
}
