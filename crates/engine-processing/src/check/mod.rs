pub mod checker;
pub mod data_match;
pub mod digest_match;

use crate::{error::CheckError, retry::classify_connector_error};
use async_trait::async_trait;
use connectors::{
    adapter::{PipelineConnection, RangeQuery},
    error::ConnectorError,
};
use engine_core::{
    rate_limit::{OperationKind, RateLimiter, throttle},
    retry::{RetryError, RetryPolicy},
};
use model::{
    core::{identifiers::SchemaTableName, value::Value},
    job::{
        check::{ConsistencyCheckResult, ContentCheckResult, CountCheckResult},
        datasource::DatabaseKind,
    },
    records::row::RowData,
};
use std::{future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use data_match::DataMatchAlgorithm;
pub use digest_match::DigestMatchAlgorithm;

pub const CHUNK_SIZE_PROP: &str = "chunk-size";

/// One source node's side of a table comparison.
pub struct SourceSide {
    pub connection: Arc<dyn PipelineConnection>,
    pub table: SchemaTableName,
}

/// Everything a single-table comparison reads from.
pub struct TableCheckInput {
    pub sources: Vec<SourceSide>,
    pub target: Arc<dyn PipelineConnection>,
    pub target_table: SchemaTableName,
    pub unique_key: String,
    pub chunk_size: usize,
    pub read_limiter: Option<Arc<RateLimiter>>,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
}

/// A way of comparing source and target contents.
///
/// Implementations only compare one chunk of rows at a time; the default
/// [`ConsistencyCheckAlgorithm::check_table`] walks both sides in unique-key
/// order, chunk by chunk, and stops at the first mismatching chunk.
#[async_trait]
pub trait ConsistencyCheckAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    fn supported_kinds(&self) -> &'static [DatabaseKind];

    fn supports(&self, kind: DatabaseKind) -> bool {
        self.supported_kinds().contains(&kind)
    }

    /// Compares key-sorted rows of the same key range.
    fn compare_chunk(&self, source: &[RowData], target: &[RowData], key: &str) -> ContentCheckResult;

    async fn check_table(
        &self,
        input: &TableCheckInput,
    ) -> Result<ConsistencyCheckResult, CheckError> {
        let mut source_records = 0;
        for side in &input.sources {
            source_records += read(input, &side.table, || side.connection.count_rows(&side.table)).await?;
        }
        let target_records =
            read(input, &input.target_table, || input.target.count_rows(&input.target_table)).await?;

        let chunk_size = input.chunk_size.max(1);
        let mut after: Option<Value> = None;
        let mut chunks = 0usize;
        let content = loop {
            let query = RangeQuery::new(&input.target_table, &input.unique_key, chunk_size)
                .after(after.clone());
            let target_rows =
                read(input, &input.target_table, || input.target.fetch_range(&query)).await?;
            let upper = if target_rows.len() == chunk_size {
                target_rows.last().map(|r| r.get_value(&input.unique_key))
            } else {
                None
            };

            let source_rows =
                source_chunk(input, after.clone(), upper.clone(), target_rows.len() + 1).await?;
            chunks += 1;

            let result = self.compare_chunk(&source_rows, &target_rows, &input.unique_key);
            if !result.matched || upper.is_none() {
                break result;
            }
            after = upper;
        };

        debug!(
            algorithm = self.name(),
            table = %input.target_table,
            chunks,
            matched = content.matched,
            "Table compared"
        );
        Ok(ConsistencyCheckResult {
            algorithm: self.name().to_string(),
            count: CountCheckResult {
                source_records,
                target_records,
            },
            content,
        })
    }
}

/// Looks up an algorithm by its case-insensitive name.
pub fn algorithm_for(name: &str) -> Result<Arc<dyn ConsistencyCheckAlgorithm>, CheckError> {
    match name.trim().to_ascii_uppercase().as_str() {
        data_match::NAME => Ok(Arc::new(DataMatchAlgorithm)),
        digest_match::NAME => Ok(Arc::new(DigestMatchAlgorithm)),
        _ => Err(CheckError::UnsupportedAlgorithm(name.to_string())),
    }
}

pub fn supported_algorithms() -> Vec<Arc<dyn ConsistencyCheckAlgorithm>> {
    vec![Arc::new(DataMatchAlgorithm), Arc::new(DigestMatchAlgorithm)]
}

/// Key of the first position where the two key-sorted chunks disagree.
pub(crate) fn first_mismatch(source: &[RowData], target: &[RowData], key: &str) -> Option<Value> {
    for (s, t) in source.iter().zip(target) {
        let (sk, tk) = (s.get_value(key), t.get_value(key));
        if sk != tk {
            return Some(sk.min(tk));
        }
        if !s.same_content(t) {
            return Some(sk);
        }
    }
    let common = source.len().min(target.len());
    source
        .get(common)
        .or_else(|| target.get(common))
        .map(|r| r.get_value(key))
}

/// Rows in `(after, upper]` from every source node, merged in key order.
/// Stops reading a node once it holds more than `cap` rows, since that alone
/// proves the chunk differs.
async fn source_chunk(
    input: &TableCheckInput,
    after: Option<Value>,
    upper: Option<Value>,
    cap: usize,
) -> Result<Vec<RowData>, CheckError> {
    let page = input.chunk_size.max(1);
    let mut merged = Vec::new();
    for side in &input.sources {
        let mut cursor = after.clone();
        let mut taken = 0usize;
        loop {
            let query = RangeQuery::new(&side.table, &input.unique_key, page)
                .after(cursor.clone())
                .upper(upper.clone());
            let rows = read(input, &side.table, || side.connection.fetch_range(&query)).await?;
            let full = rows.len() == page;
            cursor = rows.last().map(|r| r.get_value(&input.unique_key));
            taken += rows.len();
            merged.extend(rows);
            if !full || taken > cap {
                break;
            }
        }
    }
    merged.sort_by_key(|r| r.get_value(&input.unique_key));
    Ok(merged)
}

/// A throttled, retried read; cancellation aborts the check.
async fn read<F, Fut, T>(
    input: &TableCheckInput,
    table: &SchemaTableName,
    op: F,
) -> Result<T, CheckError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ConnectorError>>,
{
    if input.cancel.is_cancelled()
        || throttle(input.read_limiter.as_ref(), OperationKind::Select, 1, &input.cancel)
            .await
            .is_err()
    {
        return Err(CheckError::Cancelled);
    }
    input
        .retry
        .run_cancellable(&op, classify_connector_error, &input.cancel)
        .await
        .map_err(|err| match err {
            RetryError::Cancelled(_) => CheckError::Cancelled,
            RetryError::Fatal(source) | RetryError::AttemptsExceeded(source) => {
                CheckError::Connector {
                    table: table.to_string(),
                    source,
                }
            }
        })
}
