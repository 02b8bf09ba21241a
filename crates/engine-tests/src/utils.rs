use connectors::memory::MemoryDatabase;
use engine_runtime::api::migration::MigrationJobApi;
use model::{
    core::{column::ColumnMeta, identifiers::{JobId, SchemaTableName}, value::Value},
    job::status::JobStatus,
    records::row::{FieldValue, RowData},
};
use std::{future::Future, time::Duration};

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub fn orders() -> SchemaTableName {
    SchemaTableName::table("orders")
}

pub fn order_row(id: i64, status: &str) -> RowData {
    RowData::new(
        "orders",
        vec![
            FieldValue::new("id", id),
            FieldValue::new("status", status),
            FieldValue::new("amount", id * 10),
        ],
    )
}

/// Creates `orders` keyed on `id` and inserts one row per id.
pub async fn seed_orders(db: &MemoryDatabase, ids: impl IntoIterator<Item = i64>) {
    db.create_table(
        &orders(),
        vec![
            ColumnMeta::new("id", "bigint").primary_key(),
            ColumnMeta::new("status", "text"),
            ColumnMeta::new("amount", "bigint"),
        ],
    )
    .await
    .expect("create orders");
    for id in ids {
        db.insert(&orders(), order_row(id, "new"))
            .await
            .expect("insert order");
    }
}

pub async fn order_ids(db: &MemoryDatabase) -> Vec<i64> {
    db.rows(&orders())
        .await
        .iter()
        .filter_map(|row| row.get_value("id").as_i64())
        .collect()
}

pub async fn order_status(db: &MemoryDatabase, id: i64) -> Option<String> {
    db.get(&orders(), &Value::Int(id))
        .await
        .and_then(|row| row.get_value("status").as_text())
}

/// Polls `condition` until it returns true, panicking after a generous timeout.
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition().await {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

/// Waits until every stored shard of `job_id` reports `status`.
pub async fn wait_for_status(api: &MigrationJobApi, job_id: &JobId, status: JobStatus) {
    wait_until(&format!("{job_id} to reach {status}"), move || async move {
        let progress = api.get_progress(job_id).await.unwrap_or_default();
        !progress.is_empty() && progress.values().all(|p| p.status == status)
    })
    .await;
}

/// Waits until some stored shard of `job_id` reports a failure status and
/// returns it.
pub async fn wait_for_failure(api: &MigrationJobApi, job_id: &JobId) -> JobStatus {
    let failed = tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            let progress = api.get_progress(job_id).await.unwrap_or_default();
            if let Some(status) = progress.values().map(|p| p.status).find(JobStatus::is_failure) {
                return status;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;
    failed.unwrap_or_else(|_| panic!("timed out waiting for {job_id} to fail"))
}

pub async fn wait_for_ids(db: &MemoryDatabase, expected: &[i64]) {
    wait_until(&format!("target rows {expected:?}"), move || async move {
        order_ids(db).await == expected
    })
    .await;
}
