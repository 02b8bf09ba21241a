use crate::settings::{error::SettingsError, process::ProcessConfiguration};
use model::{
    core::identifiers::{JobId, SchemaTableName},
    job::{config::JobConfiguration, datasource::DataSourceConfig},
};
use std::time::Duration;

/// Create the target table from the source's columns if it is missing.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateTableConfiguration {
    pub source_table: SchemaTableName,
    pub target_table: SchemaTableName,
    pub unique_key: String,
}

/// What one shard reads, and how source names map onto the logical table.
#[derive(Debug, Clone, PartialEq)]
pub struct DumperConfiguration {
    pub data_source: DataSourceConfig,
    /// Table as it exists on the source node.
    pub actual_table: SchemaTableName,
    /// Table the rows belong to in the target.
    pub logical_table: SchemaTableName,
    pub unique_key: String,
    pub batch_size: usize,
    pub sharding_size: u64,
    /// Change-capture slot owned by this shard.
    pub slot_name: String,
    /// Events pulled per change stream poll.
    pub stream_batch_size: usize,
    pub idle_interval: Duration,
}

/// Where and how one shard writes.
#[derive(Debug, Clone, PartialEq)]
pub struct ImporterConfiguration {
    pub data_source: DataSourceConfig,
    pub target_table: SchemaTableName,
    pub unique_key: String,
    pub batch_size: usize,
    pub retry_times: u32,
    /// Inventory units copied in parallel.
    pub concurrency: usize,
}

/// Per-shard directives derived from the job and the current process
/// settings. Rebuilt at every start, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskConfiguration {
    pub job_id: JobId,
    pub shard: usize,
    pub create_table: CreateTableConfiguration,
    pub dumper: DumperConfiguration,
    pub importer: ImporterConfiguration,
}

impl TaskConfiguration {
    pub fn build(
        job: &JobConfiguration,
        shard: usize,
        process: &ProcessConfiguration,
    ) -> Result<Self, SettingsError> {
        let node = job.source(shard).ok_or_else(|| {
            SettingsError::ValidationFailed(vec![format!(
                "job {} has no shard {shard} ({} source nodes)",
                job.job_id,
                job.sharding_count()
            )])
        })?;
        if job.unique_key.is_empty() {
            return Err(SettingsError::MissingUniqueKey(node.table.to_string()));
        }

        Ok(Self {
            job_id: job.job_id.clone(),
            shard,
            create_table: CreateTableConfiguration {
                source_table: node.table.clone(),
                target_table: job.target_table.clone(),
                unique_key: job.unique_key.clone(),
            },
            dumper: DumperConfiguration {
                data_source: node.data_source.clone(),
                actual_table: node.table.clone(),
                logical_table: job.target_table.clone(),
                unique_key: job.unique_key.clone(),
                batch_size: process.read.batch_size,
                sharding_size: process.read.sharding_size,
                slot_name: slot_name(&job.job_id, shard),
                stream_batch_size: process.stream_channel_capacity,
                idle_interval: process.incremental_idle_interval(),
            },
            importer: ImporterConfiguration {
                data_source: job.target.clone(),
                target_table: job.target_table.clone(),
                unique_key: job.unique_key.clone(),
                batch_size: process.write.batch_size,
                retry_times: job.retry_times,
                concurrency: job.concurrency,
            },
        })
    }
}

/// Replication slot name of a shard: lowercase, at most 63 bytes.
pub fn slot_name(job_id: &JobId, shard: usize) -> String {
    let mut name = format!("pipe_{}_{shard}", job_id.as_str().to_ascii_lowercase());
    name.truncate(63);
    name
}
