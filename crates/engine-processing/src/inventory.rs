use crate::{
    TaskOutcome,
    error::TaskError,
    importer::{ImportOutcome, Importer},
    progress::SharedProgress,
    retry::classify_connector_error,
};
use connectors::adapter::{PipelineConnection, RangeQuery};
use engine_core::{
    metrics::Metrics,
    rate_limit::{OperationKind, RateLimiter, throttle},
    retry::{RetryError, RetryPolicy},
};
use model::{
    job::progress::InventoryUnit,
    pagination::position::Position,
    records::{batch::Batch, row::RowData},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Copies one inventory unit, page by page in key order.
///
/// The unit's cursor is checkpointed after every committed page, so a
/// restarted unit resumes after the last key it wrote.
pub struct InventoryTask {
    unit: InventoryUnit,
    source: Arc<dyn PipelineConnection>,
    importer: Arc<Importer>,
    batch_size: usize,
    read_limiter: Option<Arc<RateLimiter>>,
    retry: RetryPolicy,
    progress: Arc<SharedProgress>,
    metrics: Metrics,
}

enum Page {
    Rows(Vec<RowData>),
    Cancelled,
}

impl InventoryTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        unit: InventoryUnit,
        source: Arc<dyn PipelineConnection>,
        importer: Arc<Importer>,
        batch_size: usize,
        read_limiter: Option<Arc<RateLimiter>>,
        retry: RetryPolicy,
        progress: Arc<SharedProgress>,
        metrics: Metrics,
    ) -> Self {
        Self {
            unit,
            source,
            importer,
            batch_size: batch_size.max(1),
            read_limiter,
            retry,
            progress,
            metrics,
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<TaskOutcome, TaskError> {
        let mut position = self.unit.position.clone();
        info!(job_id = %self.progress.job_id(), unit = %self.unit.id, position = %position, "Inventory unit started");

        loop {
            let (after, upper) = match &position {
                Position::Finished => break,
                Position::Inventory { after, upper } => (after.clone(), upper.clone()),
                Position::Log(_) => {
                    return Err(TaskError::Prepare(format!(
                        "inventory unit {} holds a log position",
                        self.unit.id
                    )));
                }
            };
            if cancel.is_cancelled() {
                info!(unit = %self.unit.id, position = %position, "Inventory unit stopped");
                return Ok(TaskOutcome::Stopped);
            }

            let query = RangeQuery::new(&self.unit.table, &self.unit.unique_key, self.batch_size)
                .after(after)
                .upper(upper.clone());
            let rows = match self.fetch(&query, cancel).await? {
                Page::Rows(rows) => rows,
                Page::Cancelled => return Ok(TaskOutcome::Stopped),
            };

            let Some(last_key) = rows.last().map(|r| r.get_value(&self.unit.unique_key)) else {
                self.progress
                    .record_inventory_batch(&self.unit.id, Position::Finished, 0)
                    .await?;
                break;
            };
            let reached_upper = upper.as_ref().is_some_and(|u| &last_key >= u);
            let next = if rows.len() < self.batch_size || reached_upper {
                Position::Finished
            } else {
                position.advance(last_key)
            };

            let batch = Batch::new(self.batch_id(&next), rows, position.clone(), next);
            debug!(
                unit = %self.unit.id,
                batch_id = %batch.id,
                rows = batch.len(),
                checksum = batch.manifest.checksum_xxh3,
                "Inventory page read"
            );
            let count = batch.len() as u64;
            match self.importer.write_rows(batch.rows, cancel).await? {
                ImportOutcome::Applied(_) => {}
                ImportOutcome::Cancelled => return Ok(TaskOutcome::Stopped),
            }
            self.metrics.increment_inventory_records(count);
            self.progress
                .record_inventory_batch(&self.unit.id, batch.next.clone(), count)
                .await?;
            position = batch.next;
        }

        info!(job_id = %self.progress.job_id(), unit = %self.unit.id, "Inventory unit finished");
        Ok(TaskOutcome::Completed)
    }

    async fn fetch(&self, query: &RangeQuery, cancel: &CancellationToken) -> Result<Page, TaskError> {
        if throttle(self.read_limiter.as_ref(), OperationKind::Select, 1, cancel)
            .await
            .is_err()
        {
            return Ok(Page::Cancelled);
        }
        let source = self.source.clone();
        let result = self
            .retry
            .run_cancellable(
                || {
                    let source = source.clone();
                    async move { source.fetch_range(query).await }
                },
                classify_connector_error,
                cancel,
            )
            .await;

        let table = self.unit.table.to_string();
        match result {
            Ok(rows) => Ok(Page::Rows(rows)),
            Err(RetryError::Cancelled(_)) => Ok(Page::Cancelled),
            Err(RetryError::AttemptsExceeded(source)) => {
                self.metrics.increment_failures(1);
                Err(TaskError::RetriesExhausted { table, source })
            }
            Err(RetryError::Fatal(source)) => {
                self.metrics.increment_failures(1);
                Err(TaskError::Read { table, source })
            }
        }
    }

    fn batch_id(&self, next: &Position) -> String {
        let mut h = blake3::Hasher::new();
        h.update(self.progress.job_id().as_str().as_bytes());
        h.update(self.unit.id.as_bytes());
        h.update(next.to_string().as_bytes());
        h.finalize().to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connectors::memory::{MemoryConnection, MemoryDatabase};
    use engine_config::settings::task::ImporterConfiguration;
    use engine_core::{coordination::SledCoordinationService, repository::PipelineRepository};
    use model::{
        core::{column::ColumnMeta, identifiers::{JobId, SchemaTableName}, value::Value},
        job::{
            datasource::{DataSourceConfig, DatabaseKind},
            progress::JobItemProgress,
        },
        records::row::FieldValue,
    };
    use std::{collections::BTreeMap, time::Duration};

    fn orders() -> SchemaTableName {
        SchemaTableName::table("orders")
    }

    async fn table(name: &str, rows: i64) -> Arc<MemoryDatabase> {
        let db = Arc::new(MemoryDatabase::new(name));
        db.create_table(
            &orders(),
            vec![
                ColumnMeta::new("id", "bigint").primary_key(),
                ColumnMeta::new("qty", "bigint"),
            ],
        )
        .await
        .unwrap();
        for id in 1..=rows {
            db.insert(
                &orders(),
                RowData::new("orders", vec![FieldValue::new("id", id), FieldValue::new("qty", id * 10)]),
            )
            .await
            .unwrap();
        }
        db
    }

    struct Fixture {
        source: Arc<MemoryDatabase>,
        target: Arc<MemoryDatabase>,
        repo: PipelineRepository,
        progress: Arc<SharedProgress>,
    }

    async fn fixture(rows: i64) -> Fixture {
        let repo = PipelineRepository::new(Arc::new(SledCoordinationService::temporary().unwrap()));
        let progress = Arc::new(SharedProgress::new(
            repo.clone(),
            JobId::new("j01inv"),
            0,
            JobItemProgress::new(Some(DatabaseKind::Memory)),
        ));
        Fixture {
            source: table("src", rows).await,
            target: table("dst", 0).await,
            repo,
            progress,
        }
    }

    fn task(f: &Fixture, position: Position, batch_size: usize) -> InventoryTask {
        let metrics = Metrics::new();
        let importer = Importer::new(
            Arc::new(MemoryConnection::new(f.target.clone())),
            ImporterConfiguration {
                data_source: DataSourceConfig::new(DatabaseKind::Memory, "memory://dst"),
                target_table: orders(),
                unique_key: "id".into(),
                batch_size: 100,
                retry_times: 1,
                concurrency: 1,
            },
            None,
            RetryPolicy::with_retry_times(1, Duration::from_millis(1)),
            metrics.clone(),
        );
        InventoryTask::new(
            InventoryUnit {
                id: InventoryUnit::unit_id(0, 0),
                table: orders(),
                unique_key: "id".into(),
                position,
            },
            Arc::new(MemoryConnection::new(f.source.clone())),
            Arc::new(importer),
            batch_size,
            None,
            RetryPolicy::with_retry_times(1, Duration::from_millis(1)),
            f.progress.clone(),
            metrics,
        )
    }

    #[tokio::test]
    async fn copies_every_row_and_checkpoints() {
        let f = fixture(25).await;
        let outcome = task(&f, Position::unbounded(), 10)
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);
        assert_eq!(f.target.rows(&orders()).await.len(), 25);

        let stored = f.repo.load_progress(&JobId::new("j01inv"), 0).await.unwrap().unwrap();
        assert_eq!(stored.processed_records, 25);
        assert_eq!(stored.inventory.get("0.0"), Some(&Position::Finished));
    }

    #[tokio::test]
    async fn stops_at_the_upper_bound() {
        let f = fixture(30).await;
        let position = Position::Inventory {
            after: Some(Value::Int(10)),
            upper: Some(Value::Int(20)),
        };
        task(&f, position, 4).run(&CancellationToken::new()).await.unwrap();
        let ids: Vec<_> = f
            .target
            .rows(&orders())
            .await
            .iter()
            .map(|r| r.get_value("id"))
            .collect();
        assert_eq!(ids, (11..=20).map(Value::Int).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn resumes_from_checkpoint_without_recopying() {
        let f = fixture(20).await;
        let resumed = Position::unbounded().advance(Value::Int(15));
        task(&f, resumed, 10).run(&CancellationToken::new()).await.unwrap();
        assert_eq!(f.target.rows(&orders()).await.len(), 5);
        assert_eq!(f.progress.snapshot().await.processed_records, 5);
    }

    #[tokio::test]
    async fn cancelled_task_stops_before_reading() {
        let f = fixture(5).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = task(&f, Position::unbounded(), 10).run(&cancel).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Stopped);
        assert!(f.target.rows(&orders()).await.is_empty());
        assert_eq!(f.progress.inventory_positions().await, BTreeMap::new());
    }

    #[tokio::test]
    async fn unreadable_source_fails_after_retries() {
        let f = fixture(5).await;
        f.source.fail_next_reads(10).await;
        let err = task(&f, Position::unbounded(), 10)
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::RetriesExhausted { .. }));
    }
}
