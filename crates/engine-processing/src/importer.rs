use crate::{error::TaskError, retry::classify_connector_error};
use connectors::{adapter::PipelineConnection, error::ConnectorError};
use engine_config::settings::task::ImporterConfiguration;
use engine_core::{
    metrics::Metrics,
    rate_limit::{OperationKind, RateLimiter, throttle},
    retry::{RetryError, RetryPolicy},
};
use model::{
    core::value::Value,
    records::{change::ChangeEvent, row::RowData},
};
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of an import call that may be interrupted by a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Applied(u64),
    Cancelled,
}

/// Writes rows and change events to the target table.
///
/// Every statement is throttled by the write limiter and retried on
/// transient failures. Writes are keyed upserts and deletes, so applying the
/// same rows twice leaves the target unchanged.
pub struct Importer {
    target: Arc<dyn PipelineConnection>,
    config: ImporterConfiguration,
    limiter: Option<Arc<RateLimiter>>,
    retry: RetryPolicy,
    metrics: Metrics,
}

enum Run {
    Upsert(Vec<RowData>),
    Delete(Vec<Value>),
}

impl Importer {
    pub fn new(
        target: Arc<dyn PipelineConnection>,
        config: ImporterConfiguration,
        limiter: Option<Arc<RateLimiter>>,
        retry: RetryPolicy,
        metrics: Metrics,
    ) -> Self {
        Self {
            target,
            config,
            limiter,
            retry,
            metrics,
        }
    }

    pub fn config(&self) -> &ImporterConfiguration {
        &self.config
    }

    /// Upserts rows in write batches.
    pub async fn write_rows(
        &self,
        rows: Vec<RowData>,
        cancel: &CancellationToken,
    ) -> Result<ImportOutcome, TaskError> {
        let target_entity = self.config.target_table.table.clone();
        let rows: Vec<RowData> = rows
            .into_iter()
            .map(|r| r.with_entity(&target_entity))
            .collect();

        let mut written = 0;
        for chunk in rows.chunks(self.config.batch_size.max(1)) {
            match self.upsert(chunk, OperationKind::Insert, cancel).await? {
                ImportOutcome::Applied(n) => written += n,
                ImportOutcome::Cancelled => return Ok(ImportOutcome::Cancelled),
            }
        }
        Ok(ImportOutcome::Applied(written))
    }

    /// Applies change events in source order.
    ///
    /// Consecutive inserts and updates are merged into one upsert keeping
    /// the last image per key; deletes break runs so ordering across them
    /// is kept.
    pub async fn apply_changes(
        &self,
        events: &[ChangeEvent],
        cancel: &CancellationToken,
    ) -> Result<ImportOutcome, TaskError> {
        for run in self.group_runs(events) {
            let outcome = match run {
                Run::Upsert(rows) => {
                    let mut outcome = ImportOutcome::Applied(0);
                    for chunk in rows.chunks(self.config.batch_size.max(1)) {
                        outcome = self.upsert(chunk, OperationKind::Update, cancel).await?;
                        if outcome == ImportOutcome::Cancelled {
                            break;
                        }
                    }
                    outcome
                }
                Run::Delete(keys) => self.delete(&keys, cancel).await?,
            };
            if outcome == ImportOutcome::Cancelled {
                return Ok(ImportOutcome::Cancelled);
            }
        }
        self.metrics.increment_incremental_events(events.len() as u64);
        Ok(ImportOutcome::Applied(events.len() as u64))
    }

    fn group_runs(&self, events: &[ChangeEvent]) -> Vec<Run> {
        let entity = &self.config.target_table.table;
        let mut runs: Vec<Run> = Vec::new();
        for event in events {
            match (&event.after, runs.last_mut()) {
                (None, Some(Run::Delete(keys))) => keys.push(event.key.clone()),
                (None, _) => runs.push(Run::Delete(vec![event.key.clone()])),
                (Some(row), Some(Run::Upsert(rows))) => rows.push(row.clone().with_entity(entity)),
                (Some(row), _) => runs.push(Run::Upsert(vec![row.clone().with_entity(entity)])),
            }
        }
        for run in runs.iter_mut() {
            match run {
                Run::Upsert(rows) => dedup_last_per_key(rows, &self.config.unique_key),
                Run::Delete(keys) => {
                    let mut seen = HashSet::new();
                    keys.retain(|k| seen.insert(k.clone()));
                }
            }
        }
        runs
    }

    async fn upsert(
        &self,
        rows: &[RowData],
        op: OperationKind,
        cancel: &CancellationToken,
    ) -> Result<ImportOutcome, TaskError> {
        if rows.is_empty() {
            return Ok(ImportOutcome::Applied(0));
        }
        let target = self.target.clone();
        let table = self.config.target_table.clone();
        let key = self.config.unique_key.clone();
        let bytes: usize = rows.iter().map(RowData::size_bytes).sum();

        let outcome = self
            .write(op, cancel, || {
                let target = target.clone();
                let table = table.clone();
                let key = key.clone();
                async move { target.upsert_rows(&table, &key, rows).await }
            })
            .await?;
        if matches!(outcome, ImportOutcome::Applied(_)) {
            self.metrics.increment_bytes(bytes as u64);
        }
        Ok(outcome)
    }

    async fn delete(
        &self,
        keys: &[Value],
        cancel: &CancellationToken,
    ) -> Result<ImportOutcome, TaskError> {
        let target = self.target.clone();
        let table = self.config.target_table.clone();
        let key = self.config.unique_key.clone();
        self.write(OperationKind::Delete, cancel, || {
            let target = target.clone();
            let table = table.clone();
            let key = key.clone();
            async move { target.delete_rows(&table, &key, keys).await }
        })
        .await
    }

    async fn write<F, Fut>(
        &self,
        op: OperationKind,
        cancel: &CancellationToken,
        statement: F,
    ) -> Result<ImportOutcome, TaskError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<u64, ConnectorError>>,
    {
        if throttle(self.limiter.as_ref(), op, 1, cancel).await.is_err() {
            return Ok(ImportOutcome::Cancelled);
        }

        let attempts = AtomicU64::new(0);
        let started = Instant::now();
        let result = self
            .retry
            .run_cancellable(
                || {
                    attempts.fetch_add(1, Ordering::Relaxed);
                    statement()
                },
                classify_connector_error,
                cancel,
            )
            .await;

        let retries = attempts.load(Ordering::Relaxed).saturating_sub(1);
        if retries > 0 {
            self.metrics.increment_retries(retries);
        }

        let table = self.config.target_table.to_string();
        match result {
            Ok(n) => {
                self.metrics.increment_batches(1);
                debug!(table = %table, rows = n, retries, duration_ms = started.elapsed().as_millis() as u64, "Batch written");
                Ok(ImportOutcome::Applied(n))
            }
            Err(RetryError::Cancelled(e)) => {
                warn!(table = %table, error = %e, "Write abandoned on stop");
                Ok(ImportOutcome::Cancelled)
            }
            Err(RetryError::AttemptsExceeded(source)) => {
                self.metrics.increment_failures(1);
                Err(TaskError::RetriesExhausted { table, source })
            }
            Err(RetryError::Fatal(source)) => {
                self.metrics.increment_failures(1);
                Err(TaskError::Write { table, source })
            }
        }
    }
}

/// Keeps only the last row for each key, at the position of that last row.
fn dedup_last_per_key(rows: &mut Vec<RowData>, key: &str) {
    let mut last: HashMap<Value, usize> = HashMap::new();
    for (idx, row) in rows.iter().enumerate() {
        last.insert(row.get_value(key), idx);
    }
    if last.len() == rows.len() {
        return;
    }
    let mut idx = 0;
    rows.retain(|row| {
        let keep = last.get(&row.get_value(key)) == Some(&idx);
        idx += 1;
        keep
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use connectors::memory::{MemoryConnection, MemoryDatabase};
    use model::{
        core::{column::ColumnMeta, identifiers::SchemaTableName},
        job::datasource::{DataSourceConfig, DatabaseKind},
        pagination::position::LogPosition,
        records::row::FieldValue,
    };
    use std::time::Duration;

    fn orders() -> SchemaTableName {
        SchemaTableName::table("orders")
    }

    fn row(id: i64, status: &str) -> RowData {
        RowData::new(
            "orders_src",
            vec![FieldValue::new("id", id), FieldValue::new("status", status)],
        )
    }

    async fn importer(retry_times: u32, batch_size: usize) -> (Arc<MemoryDatabase>, Importer) {
        let db = Arc::new(MemoryDatabase::new("target"));
        db.create_table(
            &orders(),
            vec![
                ColumnMeta::new("id", "bigint").primary_key(),
                ColumnMeta::new("status", "text"),
            ],
        )
        .await
        .unwrap();
        let config = ImporterConfiguration {
            data_source: DataSourceConfig::new(DatabaseKind::Memory, "memory://target"),
            target_table: orders(),
            unique_key: "id".into(),
            batch_size,
            retry_times,
            concurrency: 1,
        };
        let importer = Importer::new(
            Arc::new(MemoryConnection::new(db.clone())),
            config,
            None,
            RetryPolicy::with_retry_times(retry_times, Duration::from_millis(1)),
            Metrics::new(),
        );
        (db, importer)
    }

    #[tokio::test]
    async fn rows_are_renamed_and_written_in_batches() {
        let (db, importer) = importer(0, 2).await;
        let cancel = CancellationToken::new();
        let outcome = importer
            .write_rows(vec![row(1, "a"), row(2, "b"), row(3, "c")], &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, ImportOutcome::Applied(3));
        let rows = db.rows(&orders()).await;
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.entity == "orders"));
        assert_eq!(importer.metrics.snapshot().batches_written, 2);
    }

    #[tokio::test]
    async fn replaying_changes_is_idempotent() {
        let (db, importer) = importer(0, 100).await;
        let cancel = CancellationToken::new();
        let t = orders();
        let events = vec![
            ChangeEvent::insert(LogPosition(1), t.clone(), Value::Int(1), row(1, "new")),
            ChangeEvent::update(LogPosition(2), t.clone(), Value::Int(1), row(1, "paid")),
            ChangeEvent::insert(LogPosition(3), t.clone(), Value::Int(2), row(2, "new")),
            ChangeEvent::delete(LogPosition(4), t.clone(), Value::Int(2)),
            ChangeEvent::insert(LogPosition(5), t.clone(), Value::Int(2), row(2, "again")),
        ];
        importer.apply_changes(&events, &cancel).await.unwrap();
        let once = db.rows(&orders()).await;
        importer.apply_changes(&events, &cancel).await.unwrap();
        assert_eq!(db.rows(&orders()).await, once);

        assert_eq!(once.len(), 2);
        assert_eq!(once[0].get_value("status"), Value::from("paid"));
        assert_eq!(once[1].get_value("status"), Value::from("again"));
    }

    #[tokio::test]
    async fn runs_keep_the_last_image_per_key() {
        let (_, importer) = importer(0, 100).await;
        let t = orders();
        let runs = importer.group_runs(&[
            ChangeEvent::insert(LogPosition(1), t.clone(), Value::Int(1), row(1, "a")),
            ChangeEvent::update(LogPosition(2), t.clone(), Value::Int(2), row(2, "b")),
            ChangeEvent::update(LogPosition(3), t.clone(), Value::Int(1), row(1, "c")),
            ChangeEvent::delete(LogPosition(4), t.clone(), Value::Int(3)),
            ChangeEvent::delete(LogPosition(5), t.clone(), Value::Int(3)),
        ]);
        assert_eq!(runs.len(), 2);
        match &runs[0] {
            Run::Upsert(rows) => {
                let statuses: Vec<_> = rows.iter().map(|r| r.get_value("status")).collect();
                assert_eq!(statuses, vec![Value::from("b"), Value::from("c")]);
            }
            Run::Delete(_) => panic!("expected upsert run"),
        }
        assert!(matches!(&runs[1], Run::Delete(keys) if keys.len() == 1));
    }

    #[tokio::test]
    async fn transient_write_failures_are_retried() {
        let (db, importer) = importer(2, 100).await;
        db.fail_next_writes(2).await;
        let cancel = CancellationToken::new();
        importer.write_rows(vec![row(1, "a")], &cancel).await.unwrap();
        assert_eq!(db.rows(&orders()).await.len(), 1);
        assert_eq!(importer.metrics.snapshot().retry_count, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_write() {
        let (db, importer) = importer(1, 100).await;
        db.fail_next_writes(5).await;
        let cancel = CancellationToken::new();
        let err = importer.write_rows(vec![row(1, "a")], &cancel).await.unwrap_err();
        assert!(matches!(err, TaskError::RetriesExhausted { .. }));
        assert_eq!(importer.metrics.snapshot().failure_count, 1);
    }
}
