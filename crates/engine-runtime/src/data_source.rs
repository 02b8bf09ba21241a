use connectors::{adapter::PipelineConnection, error::ConnectorError, factory::DataSourceFactory};
use model::job::datasource::DataSourceConfig;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Role {
    Source,
    Target,
}

/// Connections of one job, opened on first use and shared by its shards.
pub struct DataSourceManager {
    factory: Arc<dyn DataSourceFactory>,
    connections: Mutex<HashMap<(Role, String), Arc<dyn PipelineConnection>>>,
}

impl DataSourceManager {
    pub fn new(factory: Arc<dyn DataSourceFactory>) -> Self {
        Self {
            factory,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub async fn source(
        &self,
        config: &DataSourceConfig,
    ) -> Result<Arc<dyn PipelineConnection>, ConnectorError> {
        self.get_or_open(Role::Source, config).await
    }

    pub async fn target(
        &self,
        config: &DataSourceConfig,
    ) -> Result<Arc<dyn PipelineConnection>, ConnectorError> {
        self.get_or_open(Role::Target, config).await
    }

    async fn get_or_open(
        &self,
        role: Role,
        config: &DataSourceConfig,
    ) -> Result<Arc<dyn PipelineConnection>, ConnectorError> {
        let mut connections = self.connections.lock().await;
        let key = (role, config.url.clone());
        if let Some(conn) = connections.get(&key) {
            return Ok(conn.clone());
        }
        let conn = match role {
            Role::Source => self.factory.open_source(config).await?,
            Role::Target => self.factory.open_target(config).await?,
        };
        debug!(role = ?role, url = %config.redacted_url(), "Opened data source");
        connections.insert(key, conn.clone());
        Ok(conn)
    }

    /// Closes every cached connection. Later calls reopen on demand.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.connections.lock().await.drain().collect();
        for ((role, url), conn) in drained {
            if let Err(e) = conn.close().await {
                warn!(role = ?role, url = %url, error = %e, "Failed to close data source");
            }
        }
    }
}
