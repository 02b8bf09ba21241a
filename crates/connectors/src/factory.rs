use crate::{
    adapter::PipelineConnection,
    error::ConnectorError,
    memory::{MemoryConnection, MemoryRegistry},
    sql::postgres::PgConnection,
};
use async_trait::async_trait;
use model::job::datasource::{DataSourceConfig, DatabaseKind};
use std::sync::Arc;
use tracing::info;

/// Opens connections for data source descriptors.
#[async_trait]
pub trait DataSourceFactory: Send + Sync {
    /// Whether this factory can open data sources of `kind`.
    fn supports(&self, kind: DatabaseKind) -> bool;

    async fn open(
        &self,
        config: &DataSourceConfig,
    ) -> Result<Arc<dyn PipelineConnection>, ConnectorError>;

    async fn open_source(
        &self,
        config: &DataSourceConfig,
    ) -> Result<Arc<dyn PipelineConnection>, ConnectorError> {
        self.open(config).await
    }

    async fn open_target(
        &self,
        config: &DataSourceConfig,
    ) -> Result<Arc<dyn PipelineConnection>, ConnectorError> {
        self.open(config).await
    }
}

/// Factory for the bundled PostgreSQL and in-memory backends.
#[derive(Debug, Default, Clone)]
pub struct DefaultDataSourceFactory {
    memory: MemoryRegistry,
}

impl DefaultDataSourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory(memory: MemoryRegistry) -> Self {
        Self { memory }
    }

    pub fn memory(&self) -> &MemoryRegistry {
        &self.memory
    }
}

#[async_trait]
impl DataSourceFactory for DefaultDataSourceFactory {
    fn supports(&self, kind: DatabaseKind) -> bool {
        matches!(kind, DatabaseKind::Postgres | DatabaseKind::Memory)
    }

    async fn open(
        &self,
        config: &DataSourceConfig,
    ) -> Result<Arc<dyn PipelineConnection>, ConnectorError> {
        match config.kind {
            DatabaseKind::Postgres => {
                info!(url = %config.redacted_url(), "Opening Postgres connection");
                let conn = PgConnection::connect(&config.url).await?;
                Ok(Arc::new(conn))
            }
            DatabaseKind::Memory => {
                let name = MemoryRegistry::name_from_url(&config.url)
                    .ok_or_else(|| ConnectorError::InvalidUrl(config.url.clone()))?;
                let db = self.memory.database(name).await;
                let conn = MemoryConnection::new(db);
                conn.ping().await?;
                Ok(Arc::new(conn))
            }
            other => Err(ConnectorError::UnsupportedDriver(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_urls_resolve_to_shared_databases() {
        let factory = DefaultDataSourceFactory::new();
        let config = DataSourceConfig::new(DatabaseKind::Memory, "memory://ds_0");
        let a = factory.open_source(&config).await.unwrap();
        let b = factory.open_target(&config).await.unwrap();
        assert_eq!(a.kind(), DatabaseKind::Memory);

        let db = factory.memory().database("ds_0").await;
        db.create_table(
            &model::core::identifiers::SchemaTableName::table("t"),
            vec![model::core::column::ColumnMeta::new("id", "bigint").primary_key()],
        )
        .await
        .unwrap();
        let t = model::core::identifiers::SchemaTableName::table("t");
        assert!(a.table_exists(&t).await.unwrap());
        assert!(b.table_exists(&t).await.unwrap());
    }

    #[tokio::test]
    async fn unsupported_kinds_are_refused() {
        let factory = DefaultDataSourceFactory::new();
        assert!(!factory.supports(DatabaseKind::MySql));
        let config = DataSourceConfig::new(DatabaseKind::MySql, "mysql://localhost/db");
        assert!(matches!(
            factory.open(&config).await,
            Err(ConnectorError::UnsupportedDriver(_))
        ));
    }
}
