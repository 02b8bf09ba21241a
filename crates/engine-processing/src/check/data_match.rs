use crate::check::{ConsistencyCheckAlgorithm, first_mismatch};
use async_trait::async_trait;
use model::{
    job::{check::ContentCheckResult, datasource::DatabaseKind},
    records::row::RowData,
};

pub(crate) const NAME: &str = "DATA_MATCH";

const SUPPORTED: &[DatabaseKind] = &[DatabaseKind::Postgres, DatabaseKind::MySql, DatabaseKind::Memory];

/// Compares every record field by field.
#[derive(Debug, Default, Clone, Copy)]
pub struct DataMatchAlgorithm;

#[async_trait]
impl ConsistencyCheckAlgorithm for DataMatchAlgorithm {
    fn name(&self) -> &'static str {
        NAME
    }

    fn supported_kinds(&self) -> &'static [DatabaseKind] {
        SUPPORTED
    }

    fn compare_chunk(&self, source: &[RowData], target: &[RowData], key: &str) -> ContentCheckResult {
        match first_mismatch(source, target, key) {
            None => ContentCheckResult {
                matched: true,
                first_mismatch_key: None,
                detail: None,
            },
            Some(at) => ContentCheckResult {
                detail: Some(format!("records differ at {key} = {at}")),
                matched: false,
                first_mismatch_key: Some(at),
            },
        }
    }
}
