use crate::settings::error::SettingsError;
use model::{
    core::identifiers::SchemaTableName,
    job::{config::SourceNode, datasource::DataSourceConfig},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

/// A source table named through a registered resource:
/// `resource.table` or `resource.schema.table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTableRef {
    pub resource: String,
    pub table: SchemaTableName,
}

impl FromStr for SourceTableRef {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SettingsError::InvalidTableReference(s.to_string());
        let (resource, table) = s.split_once('.').ok_or_else(invalid)?;
        if resource.is_empty() {
            return Err(invalid());
        }
        let table = table.parse::<SchemaTableName>().map_err(|_| invalid())?;
        Ok(Self {
            resource: resource.to_string(),
            table,
        })
    }
}

impl fmt::Display for SourceTableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.table)
    }
}

/// Operator request to migrate one logical table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationJobSpec {
    /// One `resource[.schema].table` per shard.
    pub sources: Vec<String>,
    pub target: DataSourceConfig,
    /// Defaults to the first source's table name.
    #[serde(default)]
    pub target_table: Option<String>,
    /// Looked up from the source metadata when absent.
    #[serde(default)]
    pub unique_key: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,
}

fn default_concurrency() -> usize {
    3
}

fn default_retry_times() -> u32 {
    3
}

impl MigrationJobSpec {
    pub fn new<S: Into<String>>(sources: impl IntoIterator<Item = S>, target: DataSourceConfig) -> Self {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            target,
            target_table: None,
            unique_key: None,
            concurrency: default_concurrency(),
            retry_times: default_retry_times(),
        }
    }

    pub fn with_target_table(mut self, table: &str) -> Self {
        self.target_table = Some(table.to_string());
        self
    }

    pub fn with_unique_key(mut self, key: &str) -> Self {
        self.unique_key = Some(key.to_string());
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry_times(mut self, retry_times: u32) -> Self {
        self.retry_times = retry_times;
        self
    }

    /// Resolves each source reference against the registered resources.
    ///
    /// Fails on malformed references, unknown resources and source nodes
    /// of different database kinds.
    pub fn resolve_sources(
        &self,
        registry: &BTreeMap<String, DataSourceConfig>,
    ) -> Result<Vec<SourceNode>, SettingsError> {
        if self.sources.is_empty() {
            return Err(SettingsError::ValidationFailed(vec![
                "at least one source table is required".to_string(),
            ]));
        }
        let refs = self
            .sources
            .iter()
            .map(|s| s.parse::<SourceTableRef>())
            .collect::<Result<Vec<_>, _>>()?;

        let missing: BTreeSet<String> = refs
            .iter()
            .filter(|r| !registry.contains_key(&r.resource))
            .map(|r| r.resource.clone())
            .collect();
        if !missing.is_empty() {
            return Err(SettingsError::MissingResource(missing.into_iter().collect()));
        }

        let nodes: Vec<SourceNode> = refs
            .into_iter()
            .filter_map(|r| {
                registry.get(&r.resource).map(|ds| SourceNode {
                    data_source: ds.clone(),
                    resource: r.resource,
                    table: r.table,
                })
            })
            .collect();

        let kinds: BTreeSet<&str> = nodes.iter().map(|n| n.data_source.kind.as_str()).collect();
        if kinds.len() > 1 {
            return Err(SettingsError::MixedSourceKinds(
                kinds.into_iter().collect::<Vec<_>>().join(", "),
            ));
        }
        Ok(nodes)
    }

    pub fn resolve_target_table(&self, nodes: &[SourceNode]) -> Result<SchemaTableName, SettingsError> {
        match &self.target_table {
            Some(name) => name
                .parse()
                .map_err(|_| SettingsError::InvalidTableReference(name.clone())),
            None => nodes
                .first()
                .map(|n| n.table.clone())
                .ok_or_else(|| SettingsError::ValidationFailed(vec!["no source table".to_string()])),
        }
    }
}

/// Rejects names that are already registered or repeated in `names`.
pub fn ensure_new_resources<'a>(
    registered: &BTreeMap<String, DataSourceConfig>,
    names: impl IntoIterator<Item = &'a str>,
) -> Result<(), SettingsError> {
    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    for name in names {
        if registered.contains_key(name) || !seen.insert(name) {
            duplicates.insert(name.to_string());
        }
    }
    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(SettingsError::DuplicateResource(duplicates.into_iter().collect()))
    }
}

/// Rejects names that are not registered.
pub fn ensure_existing_resources<'a>(
    registered: &BTreeMap<String, DataSourceConfig>,
    names: impl IntoIterator<Item = &'a str>,
) -> Result<(), SettingsError> {
    let missing: BTreeSet<String> = names
        .into_iter()
        .filter(|n| !registered.contains_key(*n))
        .map(str::to_string)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SettingsError::MissingResource(missing.into_iter().collect()))
    }
}
