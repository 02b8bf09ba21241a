use crate::{
    api::check::{CheckLocks, ConsistencyCheckJobApi},
    context::ProcessContextCache,
    controller::JobController,
    error::JobError,
    registry::JobRegistry,
};
use connectors::factory::DataSourceFactory;
use engine_config::settings::{
    error::SettingsError,
    job::{MigrationJobSpec, ensure_existing_resources, ensure_new_resources},
    process::ProcessConfiguration,
};
use engine_core::{barrier::CoordinationBarrier, repository::PipelineRepository};
use model::{
    core::identifiers::JobId,
    job::{
        config::JobConfiguration,
        datasource::{DataSourceConfig, DatabaseKind},
        progress::JobItemProgress,
        status::JobStatus,
    },
};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One row of the job listing.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub sources: Vec<String>,
    pub target_table: String,
    pub sharding_count: usize,
    pub status: JobStatus,
    pub processed_records: u64,
    pub inventory_finished_percentage: u8,
    /// Whether this process currently runs the job.
    pub active: bool,
}

/// Operator surface of the migration engine.
#[derive(Clone)]
pub struct MigrationJobApi {
    repository: PipelineRepository,
    factory: Arc<dyn DataSourceFactory>,
    contexts: Arc<ProcessContextCache>,
    registry: JobRegistry,
    check_locks: Arc<CheckLocks>,
}

impl MigrationJobApi {
    pub fn new(repository: PipelineRepository, factory: Arc<dyn DataSourceFactory>) -> Self {
        Self {
            repository,
            factory,
            contexts: Arc::new(ProcessContextCache::new()),
            registry: JobRegistry::new(),
            check_locks: Arc::new(CheckLocks::default()),
        }
    }

    pub fn repository(&self) -> &PipelineRepository {
        &self.repository
    }

    pub fn check_jobs(&self) -> ConsistencyCheckJobApi {
        ConsistencyCheckJobApi::new(
            self.repository.clone(),
            self.factory.clone(),
            self.contexts.clone(),
            self.check_locks.clone(),
        )
    }

    /// The live controller of `job_id` in this process, if any.
    pub async fn controller(&self, job_id: &JobId) -> Option<Arc<JobController>> {
        self.registry.get(job_id).await
    }

    // Jobs

    /// Validates `spec`, stores the job unless it already exists and starts
    /// every shard.
    pub async fn create_and_start(&self, spec: &MigrationJobSpec) -> Result<JobId, JobError> {
        let job = self.build_job(spec).await?;
        let job_id = job.job_id.clone();
        if self.repository.load_job_config(&job_id).await?.is_some() {
            info!(job_id = %job_id, "Job already exists, starting it");
        } else {
            self.repository.persist_job_config(&job).await?;
            info!(
                job_id = %job_id,
                shards = job.sharding_count(),
                table = %job.target_table,
                unique_key = %job.unique_key,
                "Created job"
            );
        }
        self.start(&job_id).await?;
        Ok(job_id)
    }

    async fn build_job(&self, spec: &MigrationJobSpec) -> Result<JobConfiguration, JobError> {
        let registered = self.repository.load_sources().await?;
        let nodes = spec.resolve_sources(&registered)?;
        let target_table = spec.resolve_target_table(&nodes)?;
        for kind in nodes
            .iter()
            .map(|n| n.data_source.kind)
            .chain(std::iter::once(spec.target.kind))
        {
            self.ensure_supported(kind)?;
        }

        let unique_key = match &spec.unique_key {
            Some(key) => key.clone(),
            None => {
                let first = &nodes[0];
                let source = self.factory.open_source(&first.data_source).await?;
                let found = source.find_unique_key(&first.table).await;
                if let Err(e) = source.close().await {
                    warn!(error = %e, "Failed to close metadata connection");
                }
                found?
                    .map(|column| column.name)
                    .ok_or_else(|| SettingsError::MissingUniqueKey(first.table.to_string()))?
            }
        };

        Ok(JobConfiguration::new(
            nodes,
            spec.target.clone(),
            target_table,
            &unique_key,
            spec.concurrency,
            spec.retry_times,
        ))
    }

    /// Starts every shard of a stored job, resuming from its progress.
    pub async fn start(&self, job_id: &JobId) -> Result<(), JobError> {
        let job = self.load_job(job_id).await?;
        let process = self.contexts.get(&self.repository).await?;
        let controller = self
            .registry
            .get_or_try_insert(job_id, move || async move {
                Ok::<_, JobError>(JobController::new(
                    job,
                    self.repository.clone(),
                    self.factory.clone(),
                    self.contexts.clone(),
                    &process,
                ))
            })
            .await?;
        controller.start_all().await
    }

    /// Stops the job's shards in this process. Stored shards left marked
    /// running by a previous process are marked stopped.
    pub async fn stop(&self, job_id: &JobId) -> Result<(), JobError> {
        if let Some(controller) = self.registry.get(job_id).await {
            controller.stop().await;
            self.registry.remove_if_current(job_id, &controller).await;
            return Ok(());
        }
        self.load_job(job_id).await?;
        for (shard, mut progress) in self.repository.load_all_progress(job_id).await? {
            if progress.status.is_running() {
                progress.status = JobStatus::Stopped;
                progress.touch();
                self.repository.persist_progress(job_id, shard, &progress).await?;
            }
        }
        info!(job_id = %job_id, "Job stopped");
        Ok(())
    }

    pub async fn rollback(&self, job_id: &JobId) -> Result<(), JobError> {
        let controller = self.finishing_controller(job_id).await?;
        let rolled_back = controller.rollback().await;
        self.registry.remove_if_current(job_id, &controller).await;
        rolled_back
    }

    pub async fn commit(&self, job_id: &JobId) -> Result<(), JobError> {
        let controller = self.finishing_controller(job_id).await?;
        let committed = controller.commit().await;
        self.registry.remove_if_current(job_id, &controller).await;
        committed
    }

    /// The job's live controller, or an idle one when the job does not run
    /// here. A live one stays registered until it is done.
    async fn finishing_controller(&self, job_id: &JobId) -> Result<Arc<JobController>, JobError> {
        let job = self.load_job(job_id).await?;
        if let Some(controller) = self.registry.get(job_id).await {
            return Ok(controller);
        }
        let process = self.contexts.get(&self.repository).await?;
        Ok(Arc::new(JobController::new(
            job,
            self.repository.clone(),
            self.factory.clone(),
            self.contexts.clone(),
            &process,
        )))
    }

    pub async fn get_progress(&self, job_id: &JobId) -> Result<BTreeMap<usize, JobItemProgress>, JobError> {
        self.load_job(job_id).await?;
        Ok(self.repository.load_all_progress(job_id).await?)
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobSummary>, JobError> {
        let mut summaries = Vec::new();
        for job_id in self.repository.list_job_ids().await? {
            let Some(job) = self.repository.load_job_config(&job_id).await? else {
                continue;
            };
            let progress = self.repository.load_all_progress(&job_id).await?;
            let finished = progress
                .values()
                .map(|p| u32::from(p.inventory_finished_percentage()))
                .sum::<u32>()
                / job.sharding_count().max(1) as u32;
            summaries.push(JobSummary {
                sources: job
                    .sources
                    .iter()
                    .map(|s| format!("{}.{}", s.resource, s.table))
                    .collect(),
                target_table: job.target_table.to_string(),
                sharding_count: job.sharding_count(),
                status: aggregate_status(progress.values().map(|p| p.status)),
                processed_records: progress.values().map(|p| p.processed_records).sum(),
                inventory_finished_percentage: finished as u8,
                active: self.registry.get(&job_id).await.is_some(),
                job_id,
            });
        }
        Ok(summaries)
    }

    /// Waits until every shard of `job_id` has announced it is replicating
    /// changes. Returns false on timeout.
    pub async fn await_ready(&self, job_id: &JobId, timeout: Duration) -> Result<bool, JobError> {
        let job = self.load_job(job_id).await?;
        let process = self.contexts.get(&self.repository).await?;
        let barrier =
            CoordinationBarrier::new(self.repository.service(), process.config().barrier_lease());
        Ok(barrier
            .await_ready(
                job_id.as_str(),
                job.sharding_count(),
                timeout,
                &CancellationToken::new(),
            )
            .await?)
    }

    /// Stops every job running in this process.
    pub async fn shutdown(&self) {
        for controller in self.registry.drain().await {
            controller.stop().await;
        }
    }

    // Source resources

    pub async fn list_source_connections(&self) -> Result<BTreeMap<String, DataSourceConfig>, JobError> {
        Ok(self.repository.load_sources().await?)
    }

    /// Registers new source resources. Nothing is stored if any name is
    /// taken or repeated.
    pub async fn add_source_connections(
        &self,
        sources: BTreeMap<String, DataSourceConfig>,
    ) -> Result<(), JobError> {
        let registered = self.repository.load_sources().await?;
        ensure_new_resources(&registered, sources.keys().map(String::as_str))?;
        for config in sources.values() {
            self.ensure_supported(config.kind)?;
        }
        for (name, config) in &sources {
            self.repository.persist_source(name, config).await?;
            info!(resource = %name, url = %config.redacted_url(), "Registered source resource");
        }
        Ok(())
    }

    /// Unregisters source resources no job refers to.
    pub async fn drop_source_connections(&self, names: &[String]) -> Result<(), JobError> {
        let registered = self.repository.load_sources().await?;
        ensure_existing_resources(&registered, names.iter().map(String::as_str))?;
        for job_id in self.repository.list_job_ids().await? {
            let Some(job) = self.repository.load_job_config(&job_id).await? else {
                continue;
            };
            let used: Vec<String> = names
                .iter()
                .filter(|name| job.sources.iter().any(|s| &s.resource == *name))
                .cloned()
                .collect();
            if !used.is_empty() {
                return Err(JobError::ResourceInUse {
                    job: job_id.to_string(),
                    names: used,
                });
            }
        }
        for name in names {
            self.repository.delete_source(name).await?;
            info!(resource = %name, "Dropped source resource");
        }
        Ok(())
    }

    // Process configuration

    pub async fn show_process_configuration(&self) -> Result<ProcessConfiguration, JobError> {
        Ok(self
            .repository
            .load_process_config::<ProcessConfiguration>()
            .await?
            .unwrap_or_default())
    }

    /// Replaces the process configuration. Running shards keep their
    /// settings until they are restarted.
    pub async fn alter_process_configuration(&self, config: &ProcessConfiguration) -> Result<(), JobError> {
        config.validate()?;
        self.repository.persist_process_config(config).await?;
        self.contexts.invalidate().await;
        info!("Process configuration altered");
        Ok(())
    }

    pub async fn set_process_setting(&self, key: &str, value: &str) -> Result<ProcessConfiguration, JobError> {
        let mut config = self.show_process_configuration().await?;
        config.set(key, value)?;
        self.alter_process_configuration(&config).await?;
        Ok(config)
    }

    fn ensure_supported(&self, kind: DatabaseKind) -> Result<(), JobError> {
        if self.factory.supports(kind) {
            Ok(())
        } else {
            Err(SettingsError::UnsupportedDatabaseKind(kind.to_string()).into())
        }
    }

    async fn load_job(&self, job_id: &JobId) -> Result<JobConfiguration, JobError> {
        self.repository
            .load_job_config(job_id)
            .await?
            .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))
    }
}

/// A failed shard decides the job's status; otherwise the least advanced
/// shard does.
fn aggregate_status(statuses: impl Iterator<Item = JobStatus>) -> JobStatus {
    let rank = |status: &JobStatus| match status {
        JobStatus::Stopped => 0,
        JobStatus::Created => 1,
        JobStatus::Preparing => 2,
        JobStatus::RunningInventory => 3,
        JobStatus::RunningIncremental => 4,
        _ => 5,
    };
    let statuses: Vec<JobStatus> = statuses.collect();
    if let Some(failed) = statuses.iter().find(|s| s.is_failure()) {
        return *failed;
    }
    statuses.into_iter().min_by_key(rank).unwrap_or(JobStatus::Created)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_is_the_least_advanced_shard_unless_one_failed() {
        use JobStatus::*;
        assert_eq!(aggregate_status([].into_iter()), Created);
        assert_eq!(
            aggregate_status([RunningIncremental, RunningInventory].into_iter()),
            RunningInventory
        );
        assert_eq!(aggregate_status([RunningIncremental, Stopped].into_iter()), Stopped);
        assert_eq!(
            aggregate_status([Stopped, ExecuteIncrementalTaskFailure].into_iter()),
            ExecuteIncrementalTaskFailure
        );
    }
}
