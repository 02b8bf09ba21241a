use crate::{
    core::identifiers::{JobId, SchemaTableName},
    job::datasource::{DataSourceConfig, DatabaseKind},
};
use serde::{Deserialize, Serialize};

const MIGRATION_JOB_PREFIX: &str = "j01";
const CHECK_JOB_PREFIX: &str = "j02";

/// One source table feeding the job. Shard `i` of a job migrates source node `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceNode {
    /// Name of the registered source resource.
    pub resource: String,
    pub data_source: DataSourceConfig,
    pub table: SchemaTableName,
}

/// Immutable description of one migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfiguration {
    pub job_id: JobId,
    pub sources: Vec<SourceNode>,
    pub target: DataSourceConfig,
    pub target_table: SchemaTableName,
    /// Column used as unique key and copy order.
    pub unique_key: String,
    /// Inventory units in flight per shard.
    pub concurrency: usize,
    /// Retries allowed for a failing read or write before the shard fails.
    pub retry_times: u32,
}

#[derive(Serialize)]
struct JobIdentity<'a> {
    sources: Vec<(&'a str, String)>,
    target: &'a str,
    target_table: String,
}

impl JobConfiguration {
    pub fn new(
        sources: Vec<SourceNode>,
        target: DataSourceConfig,
        target_table: SchemaTableName,
        unique_key: &str,
        concurrency: usize,
        retry_times: u32,
    ) -> Self {
        let job_id = migration_job_id(&sources, &target, &target_table);
        Self {
            job_id,
            sources,
            target,
            target_table,
            unique_key: unique_key.to_string(),
            concurrency: concurrency.max(1),
            retry_times,
        }
    }

    pub fn sharding_count(&self) -> usize {
        self.sources.len()
    }

    pub fn source(&self, shard: usize) -> Option<&SourceNode> {
        self.sources.get(shard)
    }

    /// Database kind of the sources; callers validate that all nodes agree.
    pub fn source_kind(&self) -> Option<DatabaseKind> {
        self.sources.first().map(|s| s.data_source.kind)
    }
}

/// Deterministic id derived from source and target identity, so submitting
/// the same migration twice yields the same id.
pub fn migration_job_id(
    sources: &[SourceNode],
    target: &DataSourceConfig,
    target_table: &SchemaTableName,
) -> JobId {
    let identity = JobIdentity {
        sources: sources
            .iter()
            .map(|s| (s.resource.as_str(), s.table.to_string()))
            .collect(),
        target: &target.url,
        target_table: target_table.to_string(),
    };
    // Serializing a struct of strings cannot fail.
    let canonical = serde_json::to_string(&identity).unwrap_or_default();
    let digest = md5::compute(canonical.as_bytes());
    JobId::new(format!("{MIGRATION_JOB_PREFIX}{digest:x}"))
}

pub fn check_job_id(parent: &JobId, sequence: u32) -> JobId {
    let tail = parent
        .as_str()
        .strip_prefix(MIGRATION_JOB_PREFIX)
        .unwrap_or(parent.as_str());
    JobId::new(format!("{CHECK_JOB_PREFIX}{tail}{sequence}"))
}

pub fn is_check_job(job_id: &JobId) -> bool {
    job_id.as_str().starts_with(CHECK_JOB_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(resource: &str, table: &str) -> SourceNode {
        SourceNode {
            resource: resource.to_string(),
            data_source: DataSourceConfig::new(DatabaseKind::Memory, &format!("memory://{resource}")),
            table: SchemaTableName::table(table),
        }
    }

    fn target() -> DataSourceConfig {
        DataSourceConfig::new(DatabaseKind::Memory, "memory://target")
    }

    #[test]
    fn identical_specs_share_an_id() {
        let a = JobConfiguration::new(vec![node("ds_0", "orders")], target(), SchemaTableName::table("orders"), "id", 2, 3);
        let b = JobConfiguration::new(vec![node("ds_0", "orders")], target(), SchemaTableName::table("orders"), "order_id", 8, 0);
        assert_eq!(a.job_id, b.job_id);
        assert!(a.job_id.as_str().starts_with("j01"));
        assert_eq!(a.job_id.as_str().len(), 3 + 32);
    }

    #[test]
    fn different_sources_produce_different_ids() {
        let a = migration_job_id(&[node("ds_0", "orders")], &target(), &SchemaTableName::table("orders"));
        let b = migration_job_id(&[node("ds_1", "orders")], &target(), &SchemaTableName::table("orders"));
        assert_ne!(a, b);
    }

    #[test]
    fn check_job_ids_derive_from_parent() {
        let parent = migration_job_id(&[node("ds_0", "orders")], &target(), &SchemaTableName::table("orders"));
        let check = check_job_id(&parent, 3);
        assert!(is_check_job(&check));
        assert!(check.as_str().ends_with('3'));
        assert!(!is_check_job(&parent));
    }
}
