#![allow(dead_code)]

use connectors::factory::DefaultDataSourceFactory;
use engine_config::settings::process::ProcessConfiguration;
use engine_core::{coordination::SledCoordinationService, repository::PipelineRepository};
use engine_runtime::api::migration::MigrationJobApi;
use model::job::datasource::{DataSourceConfig, DatabaseKind};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tempfile::TempDir;

pub mod integration;
pub mod utils;

const TARGET_URL: &str = "memory://target";

/// Settings small enough for scenarios to settle in milliseconds.
pub fn fast_process_config() -> ProcessConfiguration {
    ProcessConfiguration::default()
        .with_read_batch_size(4)
        .with_write_batch_size(3)
        .with_progress_persist_interval(Duration::from_millis(20))
        .with_incremental_idle_interval(Duration::from_millis(5))
        .with_barrier_lease(Duration::from_millis(300))
}

pub fn target_config() -> DataSourceConfig {
    DataSourceConfig::new(DatabaseKind::Memory, TARGET_URL)
}

/// One simulated process: a sled state store in a tempdir, the shared
/// in-memory databases and a migration API on top.
pub struct Harness {
    _dir: TempDir,
    pub repository: PipelineRepository,
    pub factory: DefaultDataSourceFactory,
    pub api: MigrationJobApi,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(fast_process_config()).await
    }

    pub async fn with_config(config: ProcessConfiguration) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SledCoordinationService::open(dir.path().join("state")).expect("open state store");
        let repository = PipelineRepository::new(Arc::new(store));
        let factory = DefaultDataSourceFactory::new();
        let api = MigrationJobApi::new(repository.clone(), Arc::new(factory.clone()));
        api.alter_process_configuration(&config)
            .await
            .expect("store process configuration");
        Self {
            _dir: dir,
            repository,
            factory,
            api,
        }
    }

    /// Registers `memory://<name>` resources under their own names.
    pub async fn register_sources(&self, names: &[&str]) {
        let sources: BTreeMap<String, DataSourceConfig> = names
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    DataSourceConfig::new(DatabaseKind::Memory, &format!("memory://{name}")),
                )
            })
            .collect();
        self.api
            .add_source_connections(sources)
            .await
            .expect("register sources");
    }

    /// A second API over the same state and databases, as after a process
    /// restart.
    pub fn restarted_api(&self) -> MigrationJobApi {
        MigrationJobApi::new(self.repository.clone(), Arc::new(self.factory.clone()))
    }
}
