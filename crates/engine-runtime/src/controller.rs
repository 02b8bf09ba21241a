use crate::{
    context::{JobItemContext, ProcessContext, ProcessContextCache},
    data_source::DataSourceManager,
    error::JobError,
    persist::PersistScheduler,
    runner::{RunnerPhase, TaskRunner},
};
use connectors::{adapter::PipelineConnection, dialect::DdlStatement, factory::DataSourceFactory};
use engine_config::settings::task::{TaskConfiguration, slot_name};
use engine_core::{
    barrier::{BarrierMarker, CoordinationBarrier},
    metrics::Metrics,
    repository::PipelineRepository,
};
use engine_processing::{error::TaskError, progress::SharedProgress};
use model::{
    core::value::Value,
    job::{
        config::JobConfiguration,
        progress::{InventoryUnit, JobItemProgress},
        status::JobStatus,
    },
    pagination::position::Position,
};
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs the shards of one migration job in this process and carries out
/// its stop, rollback and commit.
pub struct JobController {
    job: Arc<JobConfiguration>,
    repository: PipelineRepository,
    factory: Arc<dyn DataSourceFactory>,
    contexts: Arc<ProcessContextCache>,
    barrier: CoordinationBarrier,
    data_sources: Arc<DataSourceManager>,
    scheduler: PersistScheduler,
    stopping: AtomicBool,
    stopped: AtomicBool,
    halt: CancellationToken,
    runners: Mutex<BTreeMap<usize, Arc<TaskRunner>>>,
    markers: Mutex<BTreeMap<usize, BarrierMarker>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes target table creation across the job's shards.
    prepare_lock: Mutex<()>,
    /// Held for the whole of `stop`, so every caller returns only once the
    /// shards are down.
    stop_lock: Mutex<()>,
}

impl JobController {
    pub fn new(
        job: JobConfiguration,
        repository: PipelineRepository,
        factory: Arc<dyn DataSourceFactory>,
        contexts: Arc<ProcessContextCache>,
        process: &ProcessContext,
    ) -> Self {
        let barrier = CoordinationBarrier::new(repository.service(), process.config().barrier_lease());
        Self {
            job: Arc::new(job),
            data_sources: Arc::new(DataSourceManager::new(factory.clone())),
            scheduler: PersistScheduler::new(process.config().progress_persist_interval()),
            repository,
            factory,
            contexts,
            barrier,
            stopping: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            halt: CancellationToken::new(),
            runners: Mutex::new(BTreeMap::new()),
            markers: Mutex::new(BTreeMap::new()),
            background: Mutex::new(Vec::new()),
            prepare_lock: Mutex::new(()),
            stop_lock: Mutex::new(()),
        }
    }

    pub fn job(&self) -> &JobConfiguration {
        &self.job
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// True once a `stop` call has brought every shard down.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Shards that currently own a runner.
    pub async fn running_shards(&self) -> Vec<usize> {
        self.runners.lock().await.keys().copied().collect()
    }

    pub async fn runner_phase(&self, shard: usize) -> Option<RunnerPhase> {
        self.runners.lock().await.get(&shard).map(|r| r.phase())
    }

    /// Starts every shard of the job.
    pub async fn start_all(self: &Arc<Self>) -> Result<(), JobError> {
        for shard in 0..self.job.sharding_count() {
            self.start(shard).await?;
        }
        Ok(())
    }

    /// Starts `shard` from its stored progress. A shard that already owns a
    /// runner is left alone, as is every shard once the job is stopping.
    pub async fn start(self: &Arc<Self>, shard: usize) -> Result<(), JobError> {
        let job_id = &self.job.job_id;
        if self.is_stopping() {
            debug!(job_id = %job_id, shard, "Job is stopping, start ignored");
            return Ok(());
        }
        let mut runners = self.runners.lock().await;
        if runners.contains_key(&shard) {
            info!(job_id = %job_id, shard, "Shard is already running");
            return Ok(());
        }

        let stored = self.repository.load_progress(job_id, shard).await?;
        let resumed = stored.is_some();
        let progress = stored.unwrap_or_else(|| JobItemProgress::new(self.job.source_kind()));
        let process = self.contexts.get(&self.repository).await?;
        let task = TaskConfiguration::build(&self.job, shard, process.config())?;
        let progress = Arc::new(SharedProgress::new(
            self.repository.clone(),
            job_id.clone(),
            shard,
            progress,
        ));
        let ctx = Arc::new(JobItemContext {
            job: self.job.clone(),
            task,
            progress: progress.clone(),
            data_sources: self.data_sources.clone(),
            process,
            metrics: Metrics::new(),
        });
        let runner = Arc::new(TaskRunner::new(ctx.clone()));
        runners.insert(shard, runner.clone());
        drop(runners);

        self.scheduler.register(shard, progress).await;
        info!(job_id = %job_id, shard, resumed, "Starting shard");

        let controller = self.clone();
        let handle = tokio::spawn(async move { controller.prepare_and_run(ctx, runner).await });
        self.background.lock().await.push(handle);
        Ok(())
    }

    async fn prepare_and_run(self: Arc<Self>, ctx: Arc<JobItemContext>, runner: Arc<TaskRunner>) {
        let job_id = &self.job.job_id;
        let shard = ctx.shard();

        let prepared = tokio::select! {
            _ = self.halt.cancelled() => return,
            prepared = self.prepare(&ctx) => prepared,
        };
        if let Err(err) = prepared {
            error!(job_id = %job_id, shard, error = %err, "Prepare failed, stopping job");
            self.stopping.store(true, Ordering::Release);
            if let Err(e) = ctx.progress.fail(JobStatus::PreparingFailure, &err.to_string()).await {
                warn!(job_id = %job_id, shard, error = %e, "Failed to persist prepare failure");
            }
            self.halt.cancel();
            self.shutdown_shards().await;
            return;
        }
        if self.is_stopping() {
            return;
        }

        runner.start().await;
        let mut phase = runner.subscribe();
        let reached = tokio::select! {
            _ = self.halt.cancelled() => return,
            reached = phase.wait_for(|p| *p == RunnerPhase::Incremental || p.is_terminal()) => {
                reached.map(|p| *p)
            }
        };
        if !matches!(reached, Ok(RunnerPhase::Incremental)) {
            return;
        }

        match self.barrier.register(job_id.as_str(), shard).await {
            Ok(marker) => {
                if self.is_stopping() {
                    release_marker(marker).await;
                } else {
                    self.markers.lock().await.insert(shard, marker);
                }
            }
            Err(e) => warn!(job_id = %job_id, shard, error = %e, "Failed to register readiness marker"),
        }
    }

    /// Checks both ends are reachable, creates the target table when it is
    /// missing and, on a shard's first run, splits its inventory and pins
    /// the incremental start.
    async fn prepare(&self, ctx: &JobItemContext) -> Result<(), TaskError> {
        let progress = &ctx.progress;
        progress.set_status(JobStatus::Preparing).await?;

        let source = ctx.data_sources.source(&ctx.task.dumper.data_source).await?;
        let target = ctx.data_sources.target(&ctx.task.importer.data_source).await?;
        source.ping().await?;
        target.ping().await?;

        {
            let _guard = self.prepare_lock.lock().await;
            let create = &ctx.task.create_table;
            if !target.table_exists(&create.target_table).await? {
                let columns = source.load_columns(&create.source_table).await?;
                if !columns.iter().any(|c| c.name == create.unique_key) {
                    return Err(TaskError::Prepare(format!(
                        "unique key column '{}' not found on {}",
                        create.unique_key, create.source_table
                    )));
                }
                target
                    .execute_ddl(&DdlStatement::create_table_like(
                        &columns,
                        &create.unique_key,
                        &create.target_table,
                    ))
                    .await?;
                info!(
                    job_id = %ctx.job.job_id,
                    shard = ctx.shard(),
                    table = %create.target_table,
                    "Created target table"
                );
            }
        }

        if progress.inventory_positions().await.is_empty() {
            let dumper = &ctx.task.dumper;
            let start = source.init_change_capture(&dumper.slot_name).await?;
            let units = split_inventory(source.as_ref(), ctx).await?;
            info!(
                job_id = %ctx.job.job_id,
                shard = ctx.shard(),
                units = units.len(),
                log_start = start.offset(),
                "Inventory split"
            );
            progress.init_positions(units, Position::Log(start)).await?;
        }
        Ok(())
    }

    /// Stops every shard and waits for them to checkpoint. Safe to call
    /// repeatedly, concurrently and before any shard started.
    pub async fn stop(&self) {
        let _stopping = self.stop_lock.lock().await;
        let first = !self.stopping.swap(true, Ordering::AcqRel);
        self.halt.cancel();
        if first {
            info!(job_id = %self.job.job_id, "Stopping job");
        }

        let background: Vec<_> = self.background.lock().await.drain(..).collect();
        for handle in background {
            if let Err(e) = handle.await {
                warn!(job_id = %self.job.job_id, error = %e, "Shard task ended abnormally");
            }
        }
        self.shutdown_shards().await;
        self.stopped.store(true, Ordering::Release);
    }

    async fn shutdown_shards(&self) {
        let runners: Vec<_> = std::mem::take(&mut *self.runners.lock().await)
            .into_values()
            .collect();
        for runner in runners {
            runner.stop().await;
        }

        let markers: Vec<_> = std::mem::take(&mut *self.markers.lock().await)
            .into_values()
            .collect();
        for marker in markers {
            release_marker(marker).await;
        }

        for progress in self.scheduler.shutdown().await {
            if progress.status().await.is_running()
                && let Err(e) = progress.set_status(JobStatus::Stopped).await
            {
                warn!(job_id = %self.job.job_id, shard = progress.shard(), error = %e, "Failed to persist stop");
            }
            if let Err(e) = progress.close().await {
                warn!(job_id = %self.job.job_id, shard = progress.shard(), error = %e, "Failed to close progress");
            }
        }
        self.data_sources.close_all().await;
    }

    /// Aborts the migration: drops its check jobs, stops it, drops the
    /// target table and deletes every trace of the job.
    pub async fn rollback(&self) -> Result<(), JobError> {
        let job_id = &self.job.job_id;
        info!(job_id = %job_id, "Rolling back job");
        self.repository.delete_check_jobs(job_id).await?;
        self.stop().await;

        let target = self.factory.open_target(&self.job.target).await?;
        let dropped = target
            .execute_ddl(&DdlStatement::drop_table(&self.job.target_table))
            .await;
        close_quietly(target.as_ref()).await;
        dropped?;

        self.release_change_capture().await?;
        self.barrier.clear(job_id.as_str()).await?;
        self.repository.delete_job(job_id).await?;
        info!(job_id = %job_id, table = %self.job.target_table, "Job rolled back");
        Ok(())
    }

    /// Finalizes the migration: like rollback, but the target table stays.
    pub async fn commit(&self) -> Result<(), JobError> {
        let job_id = &self.job.job_id;
        info!(job_id = %job_id, "Committing job");
        self.repository.delete_check_jobs(job_id).await?;
        self.stop().await;

        self.release_change_capture().await?;
        self.barrier.clear(job_id.as_str()).await?;
        self.repository.delete_job(job_id).await?;
        info!(job_id = %job_id, table = %self.job.target_table, "Job committed");
        Ok(())
    }

    /// Releases the slot of every shard. Releasing a slot that was never
    /// created is a no-op.
    async fn release_change_capture(&self) -> Result<(), JobError> {
        let job_id = &self.job.job_id;
        for (shard, node) in self.job.sources.iter().enumerate() {
            let slot = slot_name(job_id, shard);
            let source = self.factory.open_source(&node.data_source).await?;
            let released = source.release_change_capture(&slot).await;
            close_quietly(source.as_ref()).await;
            released?;
            debug!(job_id = %job_id, shard, slot = %slot, "Released change capture");
        }
        Ok(())
    }
}

/// Integer keys become consecutive ranges of `sharding_size` keys. Any
/// other key type is copied as a single unit. Every unit ends at the key
/// bounds read here, so rows inserted later are left to the change stream.
async fn split_inventory(
    source: &dyn PipelineConnection,
    ctx: &JobItemContext,
) -> Result<BTreeMap<String, Position>, TaskError> {
    let dumper = &ctx.task.dumper;
    let shard = ctx.shard();
    let mut units = BTreeMap::new();

    let Some((min, max)) = source.key_bounds(&dumper.actual_table, &dumper.unique_key).await? else {
        units.insert(InventoryUnit::unit_id(shard, 0), Position::Finished);
        return Ok(units);
    };
    let (min, max) = match (min, max) {
        (Value::Int(min), Value::Int(max)) if dumper.sharding_size > 0 => (min, max),
        (_, max) => {
            units.insert(
                InventoryUnit::unit_id(shard, 0),
                Position::Inventory {
                    after: None,
                    upper: Some(max),
                },
            );
            return Ok(units);
        }
    };

    let size = i64::try_from(dumper.sharding_size).unwrap_or(i64::MAX);
    let mut after = None;
    let mut lower = min;
    let mut index = 0;
    loop {
        let id = InventoryUnit::unit_id(shard, index);
        let upper = match lower.checked_add(size - 1) {
            Some(upper) if upper < max => upper,
            _ => max,
        };
        units.insert(
            id,
            Position::Inventory {
                after: after.take(),
                upper: Some(Value::Int(upper)),
            },
        );
        if upper == max {
            return Ok(units);
        }
        after = Some(Value::Int(upper));
        lower = upper + 1;
        index += 1;
    }
}

async fn release_marker(marker: BarrierMarker) {
    let path = marker.path().to_string();
    if let Err(e) = marker.release().await {
        warn!(path = %path, error = %e, "Failed to release readiness marker");
    }
}

async fn close_quietly(conn: &dyn PipelineConnection) {
    if let Err(e) = conn.close().await {
        warn!(error = %e, "Failed to close connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connectors::{factory::DefaultDataSourceFactory, memory::MemoryDatabase};
    use engine_config::settings::process::ProcessConfiguration;
    use engine_core::coordination::SledCoordinationService;
    use model::{
        core::{column::ColumnMeta, identifiers::SchemaTableName},
        job::{
            config::SourceNode,
            datasource::{DataSourceConfig, DatabaseKind},
        },
        records::row::{FieldValue, RowData},
    };
    use std::time::Duration;
    use tracing_test::traced_test;

    fn orders() -> SchemaTableName {
        SchemaTableName::table("orders")
    }

    async fn seed(db: &MemoryDatabase, ids: impl Iterator<Item = i64>) {
        db.create_table(
            &orders(),
            vec![ColumnMeta::new("id", "bigint").primary_key(), ColumnMeta::new("note", "text")],
        )
        .await
        .unwrap();
        for id in ids {
            db.insert(&orders(), RowData::new("orders", vec![FieldValue::new("id", id), FieldValue::new("note", "x")]))
                .await
                .unwrap();
        }
    }

    async fn controller(
        factory: &DefaultDataSourceFactory,
        process: ProcessConfiguration,
    ) -> (PipelineRepository, Arc<JobController>) {
        let repo = PipelineRepository::new(Arc::new(SledCoordinationService::temporary().unwrap()));
        repo.persist_process_config(&process).await.unwrap();
        let contexts = Arc::new(ProcessContextCache::new());
        let ctx = contexts.get(&repo).await.unwrap();
        let job = JobConfiguration::new(
            vec![SourceNode {
                resource: "ds_0".into(),
                data_source: DataSourceConfig::new(DatabaseKind::Memory, "memory://ds_0"),
                table: orders(),
            }],
            DataSourceConfig::new(DatabaseKind::Memory, "memory://target"),
            orders(),
            "id",
            2,
            1,
        );
        repo.persist_job_config(&job).await.unwrap();
        let controller = JobController::new(job, repo.clone(), Arc::new(factory.clone()), contexts, &ctx);
        (repo, Arc::new(controller))
    }

    async fn wait_for_status(repo: &PipelineRepository, job: &JobConfiguration, status: JobStatus) -> JobItemProgress {
        for _ in 0..400 {
            if let Some(p) = repo.load_progress(&job.job_id, 0).await.unwrap()
                && p.status == status
            {
                return p;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("shard never reached {status}");
    }

    #[tokio::test]
    async fn integer_keys_are_split_into_ranges() {
        let factory = DefaultDataSourceFactory::new();
        seed(&*factory.memory().database("ds_0").await, 1..=25).await;
        let process = ProcessConfiguration::default()
            .with_sharding_size(10)
            .with_progress_persist_interval(Duration::from_millis(10));
        let (repo, controller) = controller(&factory, process).await;

        controller.start(0).await.unwrap();
        let progress = wait_for_status(&repo, controller.job(), JobStatus::RunningIncremental).await;
        assert_eq!(progress.inventory.len(), 3);
        assert_eq!(progress.processed_records, 25);
        assert!(progress.inventory.values().all(Position::is_finished));

        controller.stop().await;
        controller.stop().await;
        let stored = repo.load_progress(&controller.job().job_id, 0).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Stopped);
        assert!(controller.running_shards().await.is_empty());
    }

    #[tokio::test]
    async fn empty_table_goes_straight_to_incremental() {
        let factory = DefaultDataSourceFactory::new();
        let source = factory.memory().database("ds_0").await;
        seed(&source, std::iter::empty()).await;
        let process = ProcessConfiguration::default().with_progress_persist_interval(Duration::from_millis(10));
        let (repo, controller) = controller(&factory, process).await;

        controller.start(0).await.unwrap();
        let progress = wait_for_status(&repo, controller.job(), JobStatus::RunningIncremental).await;
        assert_eq!(progress.inventory.len(), 1);
        assert!(progress.is_inventory_finished());
        assert_eq!(progress.processed_records, 0);
        controller.stop().await;
    }

    #[tokio::test]
    async fn starting_twice_keeps_one_runner() {
        let factory = DefaultDataSourceFactory::new();
        seed(&*factory.memory().database("ds_0").await, 1..=3).await;
        let (_repo, controller) = controller(&factory, ProcessConfiguration::default()).await;

        controller.start(0).await.unwrap();
        controller.start(0).await.unwrap();
        assert_eq!(controller.running_shards().await, vec![0]);
        controller.stop().await;

        controller.start(0).await.unwrap();
        assert!(controller.running_shards().await.is_empty());
    }

    #[traced_test]
    #[tokio::test]
    async fn missing_unique_key_fails_prepare() {
        let factory = DefaultDataSourceFactory::new();
        let source = factory.memory().database("ds_0").await;
        source
            .create_table(&orders(), vec![ColumnMeta::new("code", "text").primary_key()])
            .await
            .unwrap();
        let (repo, controller) = controller(&factory, ProcessConfiguration::default()).await;

        controller.start(0).await.unwrap();
        let progress = wait_for_status(&repo, controller.job(), JobStatus::PreparingFailure).await;
        assert!(progress.error_message.unwrap().contains("unique key"));
        assert!(controller.is_stopping());
        assert!(logs_contain("Prepare failed, stopping job"));
        assert!(!factory.memory().database("target").await.has_table(&orders()).await);
    }
}
