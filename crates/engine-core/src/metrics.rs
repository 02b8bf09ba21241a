use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tracing::info;

#[derive(Debug, Default)]
struct InnerMetrics {
    inventory_records: AtomicU64,
    incremental_events: AtomicU64,
    bytes_written: AtomicU64,
    batches_written: AtomicU64,
    failure_count: AtomicU64,
    retry_count: AtomicU64,
}

/// Counters shared by the tasks of one job shard.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<InnerMetrics>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub inventory_records: u64,
    pub incremental_events: u64,
    pub bytes_written: u64,
    pub batches_written: u64,
    pub failure_count: u64,
    pub retry_count: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            inner: Arc::new(InnerMetrics::default()),
        }
    }

    pub fn increment_inventory_records(&self, count: u64) {
        self.inner
            .inventory_records
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_incremental_events(&self, count: u64) {
        self.inner
            .incremental_events
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_bytes(&self, count: u64) {
        self.inner.bytes_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_batches(&self, count: u64) {
        self.inner.batches_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_failures(&self, count: u64) {
        self.inner.failure_count.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_retries(&self, count: u64) {
        self.inner.retry_count.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            inventory_records: self.inner.inventory_records.load(Ordering::Relaxed),
            incremental_events: self.inner.incremental_events.load(Ordering::Relaxed),
            bytes_written: self.inner.bytes_written.load(Ordering::Relaxed),
            batches_written: self.inner.batches_written.load(Ordering::Relaxed),
            failure_count: self.inner.failure_count.load(Ordering::Relaxed),
            retry_count: self.inner.retry_count.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self, job_id: &str, shard: usize) {
        let s = self.snapshot();
        info!(
            job_id,
            shard,
            inventory_records = s.inventory_records,
            incremental_events = s.incremental_events,
            bytes = s.bytes_written,
            batches = s.batches_written,
            retries = s.retry_count,
            failures = s.failure_count,
            "Shard metrics"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        clone.increment_inventory_records(10);
        clone.increment_batches(1);
        metrics.increment_retries(2);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.inventory_records, 10);
        assert_eq!(snapshot.batches_written, 1);
        assert_eq!(snapshot.retry_count, 2);
        assert_eq!(snapshot.failure_count, 0);
    }
}
