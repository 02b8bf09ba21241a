use crate::{
    check::{
        CHUNK_SIZE_PROP, ConsistencyCheckAlgorithm, SourceSide, TableCheckInput, algorithm_for,
    },
    error::CheckError,
};
use connectors::{adapter::PipelineConnection, factory::DataSourceFactory};
use engine_core::{rate_limit::RateLimiter, retry::RetryPolicy};
use model::job::{
    algorithm::AlgorithmConfig, check::ConsistencyCheckResult, config::JobConfiguration,
};
use std::{collections::BTreeMap, sync::Arc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Verifies a migration's target against its sources.
///
/// Uses its own connections, never the migration's, so a slow or failing
/// check cannot hold up data movement.
pub struct ConsistencyChecker {
    job: JobConfiguration,
    algorithm: Arc<dyn ConsistencyCheckAlgorithm>,
    chunk_size: usize,
    factory: Arc<dyn DataSourceFactory>,
    read_limiter: Option<Arc<RateLimiter>>,
    retry: RetryPolicy,
}

impl ConsistencyChecker {
    /// Resolves the algorithm and validates it against every source and the
    /// target kind. Nothing is opened yet.
    pub fn new(
        job: JobConfiguration,
        algorithm: &AlgorithmConfig,
        factory: Arc<dyn DataSourceFactory>,
        read_limiter: Option<Arc<RateLimiter>>,
        default_chunk_size: usize,
    ) -> Result<Self, CheckError> {
        let resolved = algorithm_for(&algorithm.type_name)?;
        let kinds = job
            .sources
            .iter()
            .map(|s| s.data_source.kind)
            .chain(std::iter::once(job.target.kind));
        for kind in kinds {
            if !resolved.supports(kind) {
                return Err(CheckError::UnsupportedDatabaseKind {
                    algorithm: resolved.name().to_string(),
                    kind: kind.to_string(),
                });
            }
        }

        let chunk_size = algorithm
            .parse_prop::<usize>(CHUNK_SIZE_PROP)
            .map_err(CheckError::InvalidProps)?
            .unwrap_or(default_chunk_size);
        if chunk_size == 0 {
            return Err(CheckError::InvalidProps(format!(
                "{CHUNK_SIZE_PROP} must be greater than zero"
            )));
        }

        Ok(Self {
            job,
            algorithm: resolved,
            chunk_size,
            factory,
            read_limiter,
            retry: RetryPolicy::for_database(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn algorithm_name(&self) -> &'static str {
        self.algorithm.name()
    }

    /// Compares every table of the job; results are keyed by target table.
    ///
    /// `processed_records` is the migration's own count, logged for the
    /// operator only.
    pub async fn check(
        &self,
        processed_records: u64,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, ConsistencyCheckResult>, CheckError> {
        let started = Instant::now();
        info!(
            job_id = %self.job.job_id,
            algorithm = self.algorithm.name(),
            table = %self.job.target_table,
            processed_records,
            "Consistency check started"
        );

        let mut opened: Vec<Arc<dyn PipelineConnection>> = Vec::new();
        let result = self.check_table(&mut opened, cancel).await;
        for conn in opened {
            if let Err(err) = conn.close().await {
                warn!(error = %err, "Failed to close check connection");
            }
        }
        let result = result?;

        info!(
            job_id = %self.job.job_id,
            table = %self.job.target_table,
            matched = result.is_matched(),
            source_records = result.count.source_records,
            target_records = result.count.target_records,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Consistency check finished"
        );
        let mut results = BTreeMap::new();
        results.insert(self.job.target_table.to_string(), result);
        Ok(results)
    }

    async fn check_table(
        &self,
        opened: &mut Vec<Arc<dyn PipelineConnection>>,
        cancel: &CancellationToken,
    ) -> Result<ConsistencyCheckResult, CheckError> {
        let mut sources = Vec::with_capacity(self.job.sources.len());
        for node in &self.job.sources {
            let connection = self.factory.open_source(&node.data_source).await?;
            opened.push(connection.clone());
            sources.push(SourceSide {
                connection,
                table: node.table.clone(),
            });
        }
        let target = self.factory.open_target(&self.job.target).await?;
        opened.push(target.clone());

        let input = TableCheckInput {
            sources,
            target,
            target_table: self.job.target_table.clone(),
            unique_key: self.job.unique_key.clone(),
            chunk_size: self.chunk_size,
            read_limiter: self.read_limiter.clone(),
            retry: self.retry.clone(),
            cancel: cancel.clone(),
        };
        self.algorithm.check_table(&input).await
    }
}
