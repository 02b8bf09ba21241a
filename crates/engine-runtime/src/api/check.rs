use crate::{context::ProcessContextCache, error::JobError};
use connectors::factory::DataSourceFactory;
use engine_core::repository::PipelineRepository;
use engine_processing::check::checker::ConsistencyChecker;
use model::{
    core::identifiers::JobId,
    job::{
        algorithm::AlgorithmConfig,
        check::ConsistencyCheckResult,
        config::{JobConfiguration, check_job_id},
        progress::JobItemProgress,
        status::JobStatus,
    },
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The latest check of a migration job, as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct CheckJobReport {
    pub check_job_id: JobId,
    pub progress: Option<JobItemProgress>,
    pub results: BTreeMap<String, ConsistencyCheckResult>,
}

/// Per-job locks serializing check registration within a process.
#[derive(Default)]
pub struct CheckLocks {
    locks: Mutex<HashMap<JobId, Arc<Mutex<()>>>>,
}

impl CheckLocks {
    async fn lock(&self, job_id: &JobId) -> OwnedMutexGuard<()> {
        let lock = self.locks.lock().await.entry(job_id.clone()).or_default().clone();
        lock.lock_owned().await
    }
}

/// Runs and records consistency checks of migration jobs.
#[derive(Clone)]
pub struct ConsistencyCheckJobApi {
    repository: PipelineRepository,
    factory: Arc<dyn DataSourceFactory>,
    contexts: Arc<ProcessContextCache>,
    locks: Arc<CheckLocks>,
}

impl ConsistencyCheckJobApi {
    pub fn new(
        repository: PipelineRepository,
        factory: Arc<dyn DataSourceFactory>,
        contexts: Arc<ProcessContextCache>,
        locks: Arc<CheckLocks>,
    ) -> Self {
        Self {
            repository,
            factory,
            contexts,
            locks,
        }
    }

    /// Checks `job_id` with `algorithm` under a new check job and returns
    /// the per-table results.
    ///
    /// Algorithm and database kinds are validated before the check job is
    /// registered. A failed check records its error and no results.
    pub async fn check(
        &self,
        job_id: &JobId,
        algorithm: &AlgorithmConfig,
    ) -> Result<BTreeMap<String, ConsistencyCheckResult>, JobError> {
        let job = self.load_job(job_id).await?;
        let process = self.contexts.get(&self.repository).await?;
        let checker = ConsistencyChecker::new(
            job.clone(),
            algorithm,
            self.factory.clone(),
            process.read_limiter(),
            process.config().check_chunk_size,
        )?;

        let (check_id, mut progress, marker) = {
            let _registering = self.locks.lock(job_id).await;
            self.ensure_no_running_check(job_id).await?;

            let sequence = self.repository.next_check_sequence(job_id).await?;
            let check_id = check_job_id(job_id, sequence);
            let marker = self
                .repository
                .hold_check_marker(&check_id, process.config().barrier_lease())
                .await?;
            self.repository.register_check_job(job_id, sequence, &check_id).await?;

            let mut progress = JobItemProgress::new(job.source_kind());
            progress.status = JobStatus::Checking;
            progress.check_begin_millis = Some(chrono::Utc::now().timestamp_millis());
            self.repository.persist_check_progress(&check_id, &progress).await?;
            (check_id, progress, marker)
        };
        info!(
            job_id = %job_id,
            check_job_id = %check_id,
            algorithm = checker.algorithm_name(),
            "Check job registered"
        );

        let processed_records: u64 = self
            .repository
            .load_all_progress(job_id)
            .await?
            .values()
            .map(|p| p.processed_records)
            .sum();
        let outcome = checker.check(processed_records, &CancellationToken::new()).await;

        progress.check_end_millis = Some(chrono::Utc::now().timestamp_millis());
        progress.touch();
        let finished = match outcome {
            Ok(results) => {
                self.repository.persist_check_results(&check_id, &results).await?;
                progress.status = JobStatus::Finished;
                progress.processed_records = processed_records;
                self.repository.persist_check_progress(&check_id, &progress).await?;
                Ok(results)
            }
            Err(err) => {
                warn!(job_id = %job_id, check_job_id = %check_id, error = %err, "Check failed");
                progress.status = JobStatus::CheckFailure;
                progress.error_message = Some(err.to_string());
                self.repository.persist_check_progress(&check_id, &progress).await?;
                Err(err.into())
            }
        };
        if let Err(e) = marker.release().await {
            warn!(check_job_id = %check_id, error = %e, "Failed to release check marker");
        }
        finished
    }

    /// Refuses while the latest check of `job_id` is running somewhere. A
    /// check left `CHECKING` by a process that is gone is marked failed.
    async fn ensure_no_running_check(&self, job_id: &JobId) -> Result<(), JobError> {
        let Some(latest) = self.repository.latest_check_job_id(job_id).await? else {
            return Ok(());
        };
        let Some(mut progress) = self.repository.load_check_progress(&latest).await? else {
            return Ok(());
        };
        if progress.status != JobStatus::Checking {
            return Ok(());
        }
        if self.repository.is_check_alive(&latest).await? {
            return Err(JobError::CheckJobRunning(latest.to_string()));
        }

        warn!(job_id = %job_id, check_job_id = %latest, "Check job was abandoned, marking it failed");
        progress.status = JobStatus::CheckFailure;
        progress.error_message = Some("check interrupted before it finished".to_string());
        progress.check_end_millis = Some(chrono::Utc::now().timestamp_millis());
        progress.touch();
        self.repository.persist_check_progress(&latest, &progress).await?;
        Ok(())
    }

    /// Check job ids of `job_id`, oldest first.
    pub async fn list_check_jobs(&self, job_id: &JobId) -> Result<Vec<JobId>, JobError> {
        self.load_job(job_id).await?;
        Ok(self.repository.list_check_job_ids(job_id).await?)
    }

    pub async fn latest_results(&self, job_id: &JobId) -> Result<Option<CheckJobReport>, JobError> {
        self.load_job(job_id).await?;
        let Some(check_job_id) = self.repository.latest_check_job_id(job_id).await? else {
            return Ok(None);
        };
        let progress = self.repository.load_check_progress(&check_job_id).await?;
        let results = self.repository.load_check_results(&check_job_id).await?;
        Ok(Some(CheckJobReport {
            check_job_id,
            progress,
            results,
        }))
    }

    /// Deletes every check job of `job_id` and returns how many there were.
    pub async fn drop_checks(&self, job_id: &JobId) -> Result<usize, JobError> {
        let dropped = self.repository.delete_check_jobs(job_id).await?;
        info!(job_id = %job_id, dropped, "Dropped check jobs");
        Ok(dropped)
    }

    async fn load_job(&self, job_id: &JobId) -> Result<JobConfiguration, JobError> {
        self.repository
            .load_job_config(job_id)
            .await?
            .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))
    }
}
