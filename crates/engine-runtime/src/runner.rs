use crate::context::JobItemContext;
use engine_core::retry::RetryPolicy;
use engine_processing::{
    TaskOutcome,
    error::TaskError,
    importer::Importer,
    incremental::IncrementalTask,
    inventory::InventoryTask,
};
use futures::{StreamExt, stream};
use model::job::{progress::InventoryUnit, status::JobStatus};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Where a runner is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerPhase {
    Idle,
    Inventory,
    Incremental,
    Stopped,
    Failed,
}

impl RunnerPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunnerPhase::Stopped | RunnerPhase::Failed)
    }
}

/// Drives one shard through inventory and then incremental replication.
///
/// `start` and `stop` behave the same whichever phase is active. A failure
/// in either phase is persisted on the shard's progress and ends the run.
pub struct TaskRunner {
    ctx: Arc<JobItemContext>,
    cancel: CancellationToken,
    phase: watch::Sender<RunnerPhase>,
    started: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskRunner {
    pub fn new(ctx: Arc<JobItemContext>) -> Self {
        let (phase, _) = watch::channel(RunnerPhase::Idle);
        Self {
            ctx,
            cancel: CancellationToken::new(),
            phase,
            started: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn shard(&self) -> usize {
        self.ctx.shard()
    }

    pub fn phase(&self) -> RunnerPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunnerPhase> {
        self.phase.subscribe()
    }

    /// Spawns the run. Does nothing once stopped or already started.
    pub async fn start(self: &Arc<Self>) {
        if self.cancel.is_cancelled() || self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let runner = self.clone();
        *self.handle.lock().await = Some(tokio::spawn(async move { runner.run().await }));
    }

    /// Requests cancellation and waits for the active phase to checkpoint.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().await.take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!(job_id = %self.ctx.job.job_id, shard = self.shard(), error = %e, "Task runner panicked");
                    self.phase.send_replace(RunnerPhase::Failed);
                }
            }
            None => {
                // Never started, or a concurrent stop already joined it.
                if !self.phase().is_terminal() && !self.started.load(Ordering::Acquire) {
                    self.phase.send_replace(RunnerPhase::Stopped);
                }
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let job_id = self.ctx.job.job_id.clone();
        let shard = self.shard();
        let progress = &self.ctx.progress;

        let phase = match self.execute().await {
            Ok(()) => {
                if let Err(e) = progress.set_status(JobStatus::Stopped).await {
                    warn!(job_id = %job_id, shard, error = %e, "Failed to persist stop");
                }
                RunnerPhase::Stopped
            }
            Err((status, err)) => {
                if let Err(e) = progress.fail(status, &err.to_string()).await {
                    warn!(job_id = %job_id, shard, error = %e, "Failed to persist failure");
                }
                RunnerPhase::Failed
            }
        };
        self.ctx.metrics.log_summary(job_id.as_str(), shard);
        self.phase.send_replace(phase);
    }

    async fn execute(&self) -> Result<(), (JobStatus, TaskError)> {
        let progress = &self.ctx.progress;
        let importer = Arc::new(Importer::new(
            self.target()
                .await
                .map_err(|e| (JobStatus::ExecuteInventoryTaskFailure, e))?,
            self.ctx.task.importer.clone(),
            self.ctx.process.write_limiter(),
            RetryPolicy::with_retry_times(self.ctx.task.importer.retry_times, RETRY_BASE_DELAY),
            self.ctx.metrics.clone(),
        ));

        if !progress.snapshot().await.is_inventory_finished() {
            let inventory_failure = |e: TaskError| (JobStatus::ExecuteInventoryTaskFailure, e);
            progress
                .set_status(JobStatus::RunningInventory)
                .await
                .map_err(|e| inventory_failure(e.into()))?;
            self.phase.send_replace(RunnerPhase::Inventory);
            if self.run_inventory(importer.clone()).await.map_err(inventory_failure)?
                == TaskOutcome::Stopped
            {
                return Ok(());
            }
        }
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let incremental_failure = |e: TaskError| (JobStatus::ExecuteIncrementalTaskFailure, e);
        progress
            .set_status(JobStatus::RunningIncremental)
            .await
            .map_err(|e| incremental_failure(e.into()))?;
        self.phase.send_replace(RunnerPhase::Incremental);
        info!(job_id = %self.ctx.job.job_id, shard = self.shard(), "Incremental phase started");

        let source = self.source().await.map_err(incremental_failure)?;
        let task = IncrementalTask::new(
            source,
            importer,
            self.ctx.task.dumper.clone(),
            self.ctx.task.importer.retry_times,
            self.ctx.process.config().progress_persist_interval(),
            progress.clone(),
            self.ctx.metrics.clone(),
        );
        task.run(&self.cancel).await.map_err(incremental_failure)?;
        Ok(())
    }

    /// Copies every unfinished unit, `concurrency` at a time. The first
    /// failure cancels the remaining units.
    async fn run_inventory(&self, importer: Arc<Importer>) -> Result<TaskOutcome, TaskError> {
        let dumper = &self.ctx.task.dumper;
        let units: Vec<InventoryUnit> = self
            .ctx
            .progress
            .inventory_positions()
            .await
            .into_iter()
            .filter(|(_, position)| !position.is_finished())
            .map(|(id, position)| InventoryUnit {
                id,
                table: dumper.actual_table.clone(),
                unique_key: dumper.unique_key.clone(),
                position,
            })
            .collect();
        info!(
            job_id = %self.ctx.job.job_id,
            shard = self.shard(),
            pending_units = units.len(),
            "Inventory phase started"
        );

        let source = self.source().await?;
        let units_cancel = self.cancel.child_token();
        let permits = self.ctx.process.inventory_permits();
        let concurrency = self.ctx.task.importer.concurrency.max(1);

        let results: Vec<Result<TaskOutcome, TaskError>> = stream::iter(units)
            .map(|unit| {
                let task = InventoryTask::new(
                    unit,
                    source.clone(),
                    importer.clone(),
                    dumper.batch_size,
                    self.ctx.process.read_limiter(),
                    RetryPolicy::with_retry_times(
                        self.ctx.task.importer.retry_times,
                        RETRY_BASE_DELAY,
                    ),
                    self.ctx.progress.clone(),
                    self.ctx.metrics.clone(),
                );
                let cancel = units_cancel.clone();
                let permits = permits.clone();
                async move {
                    let _permit = tokio::select! {
                        _ = cancel.cancelled() => return Ok(TaskOutcome::Stopped),
                        permit = permits.acquire_owned() => permit.map_err(|_| {
                            TaskError::Prepare("inventory worker pool is closed".to_string())
                        })?,
                    };
                    let result = task.run(&cancel).await;
                    if result.is_err() {
                        cancel.cancel();
                    }
                    result
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut outcome = TaskOutcome::Completed;
        for result in results {
            match result? {
                TaskOutcome::Completed => {}
                TaskOutcome::Stopped => outcome = TaskOutcome::Stopped,
            }
        }
        if outcome == TaskOutcome::Completed {
            info!(job_id = %self.ctx.job.job_id, shard = self.shard(), "Inventory phase finished");
        }
        Ok(outcome)
    }

    async fn source(&self) -> Result<Arc<dyn connectors::adapter::PipelineConnection>, TaskError> {
        Ok(self
            .ctx
            .data_sources
            .source(&self.ctx.task.dumper.data_source)
            .await?)
    }

    async fn target(&self) -> Result<Arc<dyn connectors::adapter::PipelineConnection>, TaskError> {
        Ok(self
            .ctx
            .data_sources
            .target(&self.ctx.task.importer.data_source)
            .await?)
    }
}
