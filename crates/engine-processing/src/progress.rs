use engine_core::{error::CoordinationError, repository::PipelineRepository};
use model::{
    core::identifiers::JobId,
    job::{progress::JobItemProgress, status::JobStatus},
    pagination::position::{LogPosition, Position},
};
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// The live checkpoint of one job shard.
///
/// Only the shard's own tasks write it. Inventory batches and status
/// changes are persisted right away; incremental progress only marks the
/// record dirty and is flushed by whoever calls [`SharedProgress::persist_if_dirty`].
pub struct SharedProgress {
    repository: PipelineRepository,
    job_id: JobId,
    shard: usize,
    state: Mutex<JobItemProgress>,
    // Serializes snapshot-and-write so stored progress never goes backwards.
    write_lock: Mutex<()>,
    dirty: AtomicBool,
    closed: AtomicBool,
}

impl SharedProgress {
    pub fn new(
        repository: PipelineRepository,
        job_id: JobId,
        shard: usize,
        initial: JobItemProgress,
    ) -> Self {
        Self {
            repository,
            job_id,
            shard,
            state: Mutex::new(initial),
            write_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    pub async fn snapshot(&self) -> JobItemProgress {
        self.state.lock().await.clone()
    }

    pub async fn status(&self) -> JobStatus {
        self.state.lock().await.status
    }

    pub async fn set_status(&self, status: JobStatus) -> Result<(), CoordinationError> {
        {
            let mut state = self.state.lock().await;
            if state.status == status {
                return Ok(());
            }
            debug!(job_id = %self.job_id, shard = self.shard, from = %state.status, to = %status, "Shard status change");
            state.status = status;
            if !status.is_failure() {
                state.error_message = None;
            }
            state.touch();
        }
        self.persist().await
    }

    /// Records a failure status with its message and persists it.
    pub async fn fail(&self, status: JobStatus, message: &str) -> Result<(), CoordinationError> {
        {
            let mut state = self.state.lock().await;
            warn!(job_id = %self.job_id, shard = self.shard, status = %status, error = message, "Shard failed");
            state.status = status;
            state.error_message = Some(message.to_string());
            state.touch();
        }
        self.persist().await
    }

    /// Stores the freshly split inventory units and the incremental start.
    pub async fn init_positions(
        &self,
        units: BTreeMap<String, Position>,
        incremental: Position,
    ) -> Result<(), CoordinationError> {
        {
            let mut state = self.state.lock().await;
            state.inventory = units;
            state.incremental = Some(incremental);
            state.touch();
        }
        self.persist().await
    }

    pub async fn inventory_positions(&self) -> BTreeMap<String, Position> {
        self.state.lock().await.inventory.clone()
    }

    pub async fn incremental_position(&self) -> Option<LogPosition> {
        self.state
            .lock()
            .await
            .incremental
            .as_ref()
            .and_then(Position::log_position)
    }

    /// Advances one inventory unit after a committed batch and persists.
    pub async fn record_inventory_batch(
        &self,
        unit_id: &str,
        position: Position,
        records: u64,
    ) -> Result<(), CoordinationError> {
        {
            let mut state = self.state.lock().await;
            state.inventory.insert(unit_id.to_string(), position);
            state.processed_records += records;
            state.touch();
        }
        self.persist().await
    }

    /// Advances the incremental position; persisted later.
    pub async fn record_incremental(&self, position: LogPosition, events: u64) {
        let mut state = self.state.lock().await;
        state.incremental = Some(Position::Log(position));
        state.processed_records += events;
        state.touch();
        self.dirty.store(true, Ordering::Release);
    }

    pub async fn persist(&self) -> Result<(), CoordinationError> {
        let _write = self.write_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let snapshot = {
            let state = self.state.lock().await;
            self.dirty.store(false, Ordering::Release);
            state.clone()
        };
        self.repository
            .persist_progress(&self.job_id, self.shard, &snapshot)
            .await
            .inspect_err(|_| self.dirty.store(true, Ordering::Release))
    }

    /// Writes the final state and ignores every later persist, so a job
    /// being deleted is not recreated by a late flush.
    pub async fn close(&self) -> Result<(), CoordinationError> {
        let result = self.persist().await;
        self.closed.store(true, Ordering::Release);
        result
    }

    /// Persists only if something changed since the last write.
    pub async fn persist_if_dirty(&self) -> Result<bool, CoordinationError> {
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.persist().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_core::coordination::SledCoordinationService;
    use model::{core::value::Value, job::datasource::DatabaseKind};
    use std::sync::Arc;

    fn shared() -> (PipelineRepository, SharedProgress) {
        let repo = PipelineRepository::new(Arc::new(SledCoordinationService::temporary().unwrap()));
        let progress = SharedProgress::new(
            repo.clone(),
            JobId::new("j01test"),
            0,
            JobItemProgress::new(Some(DatabaseKind::Memory)),
        );
        (repo, progress)
    }

    #[tokio::test]
    async fn inventory_batches_are_persisted_immediately() {
        let (repo, progress) = shared();
        let mut units = BTreeMap::new();
        units.insert("0.0".to_string(), Position::unbounded());
        progress
            .init_positions(units, Position::Log(LogPosition(7)))
            .await
            .unwrap();
        progress
            .record_inventory_batch("0.0", Position::unbounded().advance(Value::Int(10)), 10)
            .await
            .unwrap();

        let stored = repo.load_progress(&JobId::new("j01test"), 0).await.unwrap().unwrap();
        assert_eq!(stored.processed_records, 10);
        assert_eq!(stored.incremental, Some(Position::Log(LogPosition(7))));
    }

    #[tokio::test]
    async fn incremental_progress_waits_for_flush() {
        let (repo, progress) = shared();
        progress.record_incremental(LogPosition(3), 2).await;
        assert!(repo.load_progress(&JobId::new("j01test"), 0).await.unwrap().is_none());

        assert!(progress.persist_if_dirty().await.unwrap());
        assert!(!progress.persist_if_dirty().await.unwrap());
        let stored = repo.load_progress(&JobId::new("j01test"), 0).await.unwrap().unwrap();
        assert_eq!(stored.processed_records, 2);
        assert_eq!(progress.incremental_position().await, Some(LogPosition(3)));
    }

    #[tokio::test]
    async fn failures_keep_their_message() {
        let (repo, progress) = shared();
        progress
            .fail(JobStatus::PreparingFailure, "target unreachable")
            .await
            .unwrap();
        let stored = repo.load_progress(&JobId::new("j01test"), 0).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::PreparingFailure);
        assert_eq!(stored.error_message.as_deref(), Some("target unreachable"));

        progress.set_status(JobStatus::Preparing).await.unwrap();
        assert!(progress.snapshot().await.error_message.is_none());

        progress.close().await.unwrap();
        repo.delete_job(&JobId::new("j01test")).await.unwrap();
        progress.set_status(JobStatus::Stopped).await.unwrap();
        assert!(repo.load_progress(&JobId::new("j01test"), 0).await.unwrap().is_none());
    }
}
