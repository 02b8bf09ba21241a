use crate::data_source::DataSourceManager;
use engine_config::settings::{
    error::SettingsError, process::ProcessConfiguration, task::TaskConfiguration,
};
use engine_core::{metrics::Metrics, rate_limit::RateLimiter, repository::PipelineRepository};
use engine_processing::progress::SharedProgress;
use model::job::config::JobConfiguration;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::info;

/// Process-wide settings resolved into live objects: the rate limiters and
/// the pool bounding concurrent inventory units.
#[derive(Debug)]
pub struct ProcessContext {
    config: ProcessConfiguration,
    read_limiter: Option<Arc<RateLimiter>>,
    write_limiter: Option<Arc<RateLimiter>>,
    inventory_permits: Arc<Semaphore>,
}

impl ProcessContext {
    pub fn new(config: ProcessConfiguration) -> Result<Self, SettingsError> {
        config.validate()?;
        let read_limiter = match &config.read.rate_limiter {
            Some(algorithm) => Some(Arc::new(RateLimiter::from_config(algorithm)?)),
            None => None,
        };
        let write_limiter = match &config.write.rate_limiter {
            Some(algorithm) => Some(Arc::new(RateLimiter::from_config(algorithm)?)),
            None => None,
        };
        let inventory_permits = Arc::new(Semaphore::new(config.read.worker_threads.max(1)));
        Ok(Self {
            config,
            read_limiter,
            write_limiter,
            inventory_permits,
        })
    }

    pub fn config(&self) -> &ProcessConfiguration {
        &self.config
    }

    pub fn read_limiter(&self) -> Option<Arc<RateLimiter>> {
        self.read_limiter.clone()
    }

    pub fn write_limiter(&self) -> Option<Arc<RateLimiter>> {
        self.write_limiter.clone()
    }

    pub fn inventory_permits(&self) -> Arc<Semaphore> {
        self.inventory_permits.clone()
    }
}

/// Caches the [`ProcessContext`] built from the stored process settings,
/// rebuilding it whenever those settings change.
#[derive(Debug, Default)]
pub struct ProcessContextCache {
    cached: Mutex<Option<Arc<ProcessContext>>>,
}

impl ProcessContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(
        &self,
        repository: &PipelineRepository,
    ) -> Result<Arc<ProcessContext>, crate::error::JobError> {
        let config = repository
            .load_process_config::<ProcessConfiguration>()
            .await?
            .unwrap_or_default();
        let mut cached = self.cached.lock().await;
        if let Some(ctx) = cached.as_ref()
            && ctx.config == config
        {
            return Ok(ctx.clone());
        }
        let ctx = Arc::new(ProcessContext::new(config)?);
        info!(
            read_batch_size = ctx.config.read.batch_size,
            write_batch_size = ctx.config.write.batch_size,
            worker_threads = ctx.config.read.worker_threads,
            "Process context built"
        );
        *cached = Some(ctx.clone());
        Ok(ctx)
    }

    /// Forgets the cached context so the next `get` rebuilds it.
    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }
}

/// Everything one shard's runner works with.
pub struct JobItemContext {
    pub job: Arc<JobConfiguration>,
    pub task: TaskConfiguration,
    pub progress: Arc<SharedProgress>,
    pub data_sources: Arc<DataSourceManager>,
    pub process: Arc<ProcessContext>,
    pub metrics: Metrics,
}

impl JobItemContext {
    pub fn shard(&self) -> usize {
        self.task.shard
    }
}
