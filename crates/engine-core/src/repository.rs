use crate::{barrier::{BarrierMarker, CoordinationBarrier}, coordination::CoordinationService, error::CoordinationError};
use model::{
    core::identifiers::JobId,
    job::{
        check::ConsistencyCheckResult, config::JobConfiguration, datasource::DataSourceConfig,
        progress::JobItemProgress,
    },
};
use serde::{Serialize, de::DeserializeOwned};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, info};

const JOBS_ROOT: &str = "/pipeline/jobs";
const CHECKS_ROOT: &str = "/pipeline/checks";
const SOURCES_ROOT: &str = "/pipeline/metadata/sources";
const PROCESS_CONFIG_PATH: &str = "/pipeline/metadata/process_config";

/// Persisted layout of migration state on top of a [`CoordinationService`].
///
/// ```text
/// /pipeline/jobs/{job}/config
/// /pipeline/jobs/{job}/progress/{shard}
/// /pipeline/jobs/{job}/checks/{seq}            -> check job id
/// /pipeline/checks/{check_job}/progress
/// /pipeline/checks/{check_job}/results/{table}
/// /pipeline/checks/{check_job}/running         (ephemeral)
/// /pipeline/metadata/sources/{name}
/// /pipeline/metadata/process_config
/// /pipeline/barrier/{job}/{shard}              (ephemeral)
/// ```
#[derive(Clone)]
pub struct PipelineRepository {
    service: Arc<dyn CoordinationService>,
}

impl PipelineRepository {
    pub fn new(service: Arc<dyn CoordinationService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> Arc<dyn CoordinationService> {
        self.service.clone()
    }

    async fn put_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        value: &T,
    ) -> Result<(), CoordinationError> {
        let json = serde_json::to_string(value).map_err(|source| {
            CoordinationError::Serialization {
                path: path.to_string(),
                source,
            }
        })?;
        self.service.put_persistent(path, &json).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, CoordinationError> {
        match self.service.get(path).await? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|source| CoordinationError::Serialization {
                    path: path.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    fn job_path(job_id: &JobId) -> String {
        format!("{JOBS_ROOT}/{job_id}")
    }

    fn progress_path(job_id: &JobId, shard: usize) -> String {
        format!("{JOBS_ROOT}/{job_id}/progress/{shard}")
    }

    fn check_path(check_job_id: &JobId) -> String {
        format!("{CHECKS_ROOT}/{check_job_id}")
    }

    // Job configuration

    pub async fn persist_job_config(&self, config: &JobConfiguration) -> Result<(), CoordinationError> {
        let path = format!("{}/config", Self::job_path(&config.job_id));
        self.put_json(&path, config).await?;
        debug!(job_id = %config.job_id, "Persisted job configuration");
        Ok(())
    }

    pub async fn load_job_config(&self, job_id: &JobId) -> Result<Option<JobConfiguration>, CoordinationError> {
        self.get_json(&format!("{}/config", Self::job_path(job_id))).await
    }

    pub async fn list_job_ids(&self) -> Result<Vec<JobId>, CoordinationError> {
        Ok(self
            .service
            .list_children(JOBS_ROOT)
            .await?
            .into_iter()
            .map(JobId::new)
            .collect())
    }

    /// Deletes configuration, progress, check jobs and readiness markers of `job_id`.
    pub async fn delete_job(&self, job_id: &JobId) -> Result<(), CoordinationError> {
        for check_job_id in self.list_check_job_ids(job_id).await? {
            self.service.delete(&Self::check_path(&check_job_id)).await?;
        }
        self.service.delete(&Self::job_path(job_id)).await?;
        self.service
            .delete(&CoordinationBarrier::job_path(job_id.as_str()))
            .await?;
        info!(job_id = %job_id, "Deleted job bookkeeping");
        Ok(())
    }

    // Progress

    pub async fn persist_progress(
        &self,
        job_id: &JobId,
        shard: usize,
        progress: &JobItemProgress,
    ) -> Result<(), CoordinationError> {
        self.put_json(&Self::progress_path(job_id, shard), progress).await
    }

    pub async fn load_progress(
        &self,
        job_id: &JobId,
        shard: usize,
    ) -> Result<Option<JobItemProgress>, CoordinationError> {
        self.get_json(&Self::progress_path(job_id, shard)).await
    }

    pub async fn load_all_progress(
        &self,
        job_id: &JobId,
    ) -> Result<BTreeMap<usize, JobItemProgress>, CoordinationError> {
        let root = format!("{}/progress", Self::job_path(job_id));
        let mut all = BTreeMap::new();
        for child in self.service.list_children(&root).await? {
            let Ok(shard) = child.parse::<usize>() else {
                continue;
            };
            if let Some(progress) = self.load_progress(job_id, shard).await? {
                all.insert(shard, progress);
            }
        }
        Ok(all)
    }

    // Consistency check jobs

    async fn check_sequences(&self, parent: &JobId) -> Result<Vec<u32>, CoordinationError> {
        let root = format!("{}/checks", Self::job_path(parent));
        let mut sequences: Vec<u32> = self
            .service
            .list_children(&root)
            .await?
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        sequences.sort_unstable();
        Ok(sequences)
    }

    pub async fn next_check_sequence(&self, parent: &JobId) -> Result<u32, CoordinationError> {
        Ok(self.check_sequences(parent).await?.last().map_or(1, |s| s + 1))
    }

    pub async fn register_check_job(
        &self,
        parent: &JobId,
        sequence: u32,
        check_job_id: &JobId,
    ) -> Result<(), CoordinationError> {
        let path = format!("{}/checks/{sequence}", Self::job_path(parent));
        self.service.put_persistent(&path, check_job_id.as_str()).await
    }

    /// Check job ids of `parent`, oldest first.
    pub async fn list_check_job_ids(&self, parent: &JobId) -> Result<Vec<JobId>, CoordinationError> {
        let mut ids = Vec::new();
        for sequence in self.check_sequences(parent).await? {
            let path = format!("{}/checks/{sequence}", Self::job_path(parent));
            if let Some(id) = self.service.get(&path).await? {
                ids.push(JobId::new(id));
            }
        }
        Ok(ids)
    }

    pub async fn latest_check_job_id(&self, parent: &JobId) -> Result<Option<JobId>, CoordinationError> {
        Ok(self.list_check_job_ids(parent).await?.pop())
    }

    pub async fn persist_check_progress(
        &self,
        check_job_id: &JobId,
        progress: &JobItemProgress,
    ) -> Result<(), CoordinationError> {
        let path = format!("{}/progress", Self::check_path(check_job_id));
        self.put_json(&path, progress).await
    }

    pub async fn load_check_progress(
        &self,
        check_job_id: &JobId,
    ) -> Result<Option<JobItemProgress>, CoordinationError> {
        self.get_json(&format!("{}/progress", Self::check_path(check_job_id))).await
    }

    /// Marks `check_job_id` as running in this process for as long as the
    /// returned marker lives.
    pub async fn hold_check_marker(
        &self,
        check_job_id: &JobId,
        lease: Duration,
    ) -> Result<BarrierMarker, CoordinationError> {
        let path = format!("{}/running", Self::check_path(check_job_id));
        BarrierMarker::hold(self.service.clone(), path, "checking", lease).await
    }

    /// Whether a live process still runs `check_job_id`.
    pub async fn is_check_alive(&self, check_job_id: &JobId) -> Result<bool, CoordinationError> {
        let path = format!("{}/running", Self::check_path(check_job_id));
        Ok(self.service.get(&path).await?.is_some())
    }

    pub async fn persist_check_results(
        &self,
        check_job_id: &JobId,
        results: &BTreeMap<String, ConsistencyCheckResult>,
    ) -> Result<(), CoordinationError> {
        for (table, result) in results {
            let path = format!("{}/results/{table}", Self::check_path(check_job_id));
            self.put_json(&path, result).await?;
        }
        Ok(())
    }

    pub async fn load_check_results(
        &self,
        check_job_id: &JobId,
    ) -> Result<BTreeMap<String, ConsistencyCheckResult>, CoordinationError> {
        let root = format!("{}/results", Self::check_path(check_job_id));
        let mut results = BTreeMap::new();
        for table in self.service.list_children(&root).await? {
            if let Some(result) = self.get_json(&format!("{root}/{table}")).await? {
                results.insert(table, result);
            }
        }
        Ok(results)
    }

    /// Drops every check job of `parent`.
    pub async fn delete_check_jobs(&self, parent: &JobId) -> Result<usize, CoordinationError> {
        let ids = self.list_check_job_ids(parent).await?;
        for id in &ids {
            self.service.delete(&Self::check_path(id)).await?;
        }
        self.service
            .delete(&format!("{}/checks", Self::job_path(parent)))
            .await?;
        Ok(ids.len())
    }

    // Source resources

    pub async fn load_sources(&self) -> Result<BTreeMap<String, DataSourceConfig>, CoordinationError> {
        let mut sources = BTreeMap::new();
        for name in self.service.list_children(SOURCES_ROOT).await? {
            if let Some(config) = self.get_json(&format!("{SOURCES_ROOT}/{name}")).await? {
                sources.insert(name, config);
            }
        }
        Ok(sources)
    }

    pub async fn persist_source(&self, name: &str, config: &DataSourceConfig) -> Result<(), CoordinationError> {
        self.put_json(&format!("{SOURCES_ROOT}/{name}"), config).await
    }

    pub async fn delete_source(&self, name: &str) -> Result<(), CoordinationError> {
        self.service.delete(&format!("{SOURCES_ROOT}/{name}")).await
    }

    // Process configuration

    pub async fn persist_process_config<T: Serialize>(&self, config: &T) -> Result<(), CoordinationError> {
        self.put_json(PROCESS_CONFIG_PATH, config).await
    }

    pub async fn load_process_config<T: DeserializeOwned>(&self) -> Result<Option<T>, CoordinationError> {
        self.get_json(PROCESS_CONFIG_PATH).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::SledCoordinationService;
    use model::{
        core::identifiers::SchemaTableName,
        job::{
            check::{ContentCheckResult, CountCheckResult},
            config::{SourceNode, check_job_id},
            datasource::DatabaseKind,
            status::JobStatus,
        },
    };
    use tempfile::tempdir;

    fn config() -> JobConfiguration {
        let source = DataSourceConfig::new(DatabaseKind::Memory, "memory://a");
        JobConfiguration::new(
            vec![SourceNode {
                resource: "ds_0".into(),
                data_source: source,
                table: SchemaTableName::table("orders"),
            }],
            DataSourceConfig::new(DatabaseKind::Memory, "memory://b"),
            SchemaTableName::table("orders"),
            "id",
            2,
            3,
        )
    }

    fn repository() -> PipelineRepository {
        PipelineRepository::new(Arc::new(SledCoordinationService::temporary().unwrap()))
    }

    #[tokio::test]
    async fn job_config_and_progress_round_trip() {
        let repo = repository();
        let config = config();
        repo.persist_job_config(&config).await.unwrap();

        let mut progress = JobItemProgress::new(Some(DatabaseKind::Memory));
        progress.status = JobStatus::RunningInventory;
        progress.processed_records = 42;
        repo.persist_progress(&config.job_id, 0, &progress).await.unwrap();

        assert_eq!(repo.load_job_config(&config.job_id).await.unwrap(), Some(config.clone()));
        assert_eq!(repo.list_job_ids().await.unwrap(), vec![config.job_id.clone()]);
        let all = repo.load_all_progress(&config.job_id).await.unwrap();
        assert_eq!(all.get(&0).map(|p| p.processed_records), Some(42));
    }

    #[tokio::test]
    async fn delete_job_removes_everything() {
        let repo = repository();
        let config = config();
        repo.persist_job_config(&config).await.unwrap();
        repo.persist_progress(&config.job_id, 0, &JobItemProgress::new(None))
            .await
            .unwrap();
        let check = check_job_id(&config.job_id, 1);
        repo.register_check_job(&config.job_id, 1, &check).await.unwrap();
        repo.persist_check_progress(&check, &JobItemProgress::new(None))
            .await
            .unwrap();

        repo.delete_job(&config.job_id).await.unwrap();

        assert!(repo.load_job_config(&config.job_id).await.unwrap().is_none());
        assert!(repo.load_all_progress(&config.job_id).await.unwrap().is_empty());
        assert!(repo.load_check_progress(&check).await.unwrap().is_none());
        assert!(repo.list_job_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn check_marker_lives_with_its_holder() {
        let repo = repository();
        let check = check_job_id(&config().job_id, 1);
        assert!(!repo.is_check_alive(&check).await.unwrap());

        let marker = repo
            .hold_check_marker(&check, std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert!(repo.is_check_alive(&check).await.unwrap());
        marker.release().await.unwrap();
        assert!(!repo.is_check_alive(&check).await.unwrap());
    }

    #[tokio::test]
    async fn check_jobs_are_sequenced_numerically() {
        let repo = repository();
        let parent = config().job_id;
        assert_eq!(repo.next_check_sequence(&parent).await.unwrap(), 1);
        for seq in 1..=10 {
            repo.register_check_job(&parent, seq, &check_job_id(&parent, seq))
                .await
                .unwrap();
        }
        assert_eq!(repo.next_check_sequence(&parent).await.unwrap(), 11);
        assert_eq!(
            repo.latest_check_job_id(&parent).await.unwrap(),
            Some(check_job_id(&parent, 10))
        );

        let latest = check_job_id(&parent, 10);
        let mut results = BTreeMap::new();
        results.insert(
            "orders".to_string(),
            ConsistencyCheckResult {
                algorithm: "DATA_MATCH".into(),
                count: CountCheckResult {
                    source_records: 3,
                    target_records: 3,
                },
                content: ContentCheckResult {
                    matched: true,
                    first_mismatch_key: None,
                    detail: None,
                },
            },
        );
        repo.persist_check_results(&latest, &results).await.unwrap();
        assert_eq!(repo.load_check_results(&latest).await.unwrap(), results);

        assert_eq!(repo.delete_check_jobs(&parent).await.unwrap(), 10);
        assert!(repo.latest_check_job_id(&parent).await.unwrap().is_none());
        assert!(repo.load_check_results(&latest).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sources_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let service = Arc::new(SledCoordinationService::open(dir.path()).unwrap());
            let repo = PipelineRepository::new(service.clone());
            repo.persist_source("ds_0", &DataSourceConfig::new(DatabaseKind::Memory, "memory://a"))
                .await
                .unwrap();
            repo.persist_source("ds_1", &DataSourceConfig::new(DatabaseKind::Memory, "memory://b"))
                .await
                .unwrap();
            repo.delete_source("ds_1").await.unwrap();
            service.flush().unwrap();
        }
        let repo = PipelineRepository::new(Arc::new(SledCoordinationService::open(dir.path()).unwrap()));
        let sources = repo.load_sources().await.unwrap();
        assert_eq!(sources.keys().collect::<Vec<_>>(), vec!["ds_0"]);
    }
}
