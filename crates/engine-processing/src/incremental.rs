use crate::{
    TaskOutcome,
    cb::{CircuitBreaker, CircuitBreakerState},
    error::TaskError,
    importer::{ImportOutcome, Importer},
    progress::SharedProgress,
    retry::classify_connector_error,
};
use connectors::adapter::{ChangeStream, PipelineConnection, StreamRequest};
use engine_config::settings::task::DumperConfiguration;
use engine_core::{
    metrics::Metrics,
    retry::{RetryDisposition, RetryError, RetryPolicy},
};
use model::pagination::position::LogPosition;
use std::{sync::Arc, time::Duration};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Tails the source's change stream and applies every event to the target.
///
/// Runs until stopped. Applied positions are flushed every persist interval
/// and acknowledged to the source only after the flush succeeds, so the
/// source never discards changes the checkpoint does not cover.
pub struct IncrementalTask {
    source: Arc<dyn PipelineConnection>,
    importer: Arc<Importer>,
    dumper: DumperConfiguration,
    retry_times: u32,
    retry_delay: Duration,
    persist_interval: Duration,
    progress: Arc<SharedProgress>,
    metrics: Metrics,
}

impl IncrementalTask {
    pub fn new(
        source: Arc<dyn PipelineConnection>,
        importer: Arc<Importer>,
        dumper: DumperConfiguration,
        retry_times: u32,
        persist_interval: Duration,
        progress: Arc<SharedProgress>,
        metrics: Metrics,
    ) -> Self {
        Self {
            source,
            importer,
            dumper,
            retry_times,
            retry_delay: DEFAULT_RETRY_DELAY,
            persist_interval,
            progress,
            metrics,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<TaskOutcome, TaskError> {
        let from = self
            .progress
            .incremental_position()
            .await
            .ok_or(TaskError::MissingLogPosition)?;
        let request = StreamRequest {
            slot: self.dumper.slot_name.clone(),
            table: self.dumper.actual_table.clone(),
            key: self.dumper.unique_key.clone(),
            from,
        };
        let Some(mut stream) = self.open_stream(&request, cancel).await? else {
            return Ok(TaskOutcome::Stopped);
        };
        info!(
            job_id = %self.progress.job_id(),
            shard = self.progress.shard(),
            slot = %request.slot,
            from = %from,
            "Incremental task started"
        );

        let table = self.dumper.actual_table.to_string();
        let mut breaker = CircuitBreaker::from_retry_times(self.retry_times, self.retry_delay);
        let mut unacked: Option<LogPosition> = None;
        let mut last_flush = Instant::now();

        loop {
            if last_flush.elapsed() >= self.persist_interval {
                self.checkpoint(stream.as_mut(), &mut unacked).await?;
                last_flush = Instant::now();
            }

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                polled = stream.poll(self.dumper.stream_batch_size) => polled,
            };

            let events = match polled {
                Ok(events) => {
                    breaker.record_success();
                    events
                }
                Err(err) => {
                    if classify_connector_error(&err) == RetryDisposition::Stop {
                        self.metrics.increment_failures(1);
                        return Err(TaskError::Read { table, source: err });
                    }
                    match breaker.record_failure() {
                        CircuitBreakerState::RetryAfter(delay) => {
                            warn!(
                                table = %table,
                                failures = breaker.consecutive_failures(),
                                error = %err,
                                "Change stream poll failed, retrying"
                            );
                            self.metrics.increment_retries(1);
                            if !self.pause(delay, cancel).await {
                                break;
                            }
                            continue;
                        }
                        CircuitBreakerState::Open => {
                            self.metrics.increment_failures(1);
                            return Err(TaskError::CircuitBreakerOpen {
                                table,
                                last_error: err.to_string(),
                            });
                        }
                    }
                }
            };

            let Some(last) = events.last().map(|e| e.position) else {
                if !self.pause(self.dumper.idle_interval, cancel).await {
                    break;
                }
                continue;
            };
            match self.importer.apply_changes(&events, cancel).await? {
                ImportOutcome::Applied(n) => {
                    debug!(table = %table, events = n, position = %last, "Change events applied");
                    self.progress.record_incremental(last, n).await;
                    unacked = Some(last);
                }
                ImportOutcome::Cancelled => break,
            }
        }

        self.checkpoint(stream.as_mut(), &mut unacked).await?;
        info!(job_id = %self.progress.job_id(), shard = self.progress.shard(), "Incremental task stopped");
        Ok(TaskOutcome::Stopped)
    }

    async fn open_stream(
        &self,
        request: &StreamRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<Box<dyn ChangeStream>>, TaskError> {
        let policy = RetryPolicy::with_retry_times(self.retry_times, self.retry_delay);
        let source = self.source.clone();
        let opened = policy
            .run_cancellable(
                || {
                    let source = source.clone();
                    async move { source.open_change_stream(request).await }
                },
                classify_connector_error,
                cancel,
            )
            .await;
        let table = request.table.to_string();
        match opened {
            Ok(stream) => Ok(Some(stream)),
            Err(RetryError::Cancelled(_)) => Ok(None),
            Err(RetryError::AttemptsExceeded(source)) => {
                Err(TaskError::RetriesExhausted { table, source })
            }
            Err(RetryError::Fatal(source)) => Err(TaskError::Read { table, source }),
        }
    }

    /// Flushes progress, then lets the source release what it covers.
    async fn checkpoint(
        &self,
        stream: &mut dyn ChangeStream,
        unacked: &mut Option<LogPosition>,
    ) -> Result<(), TaskError> {
        self.progress.persist_if_dirty().await?;
        if let Some(position) = unacked.take() {
            if let Err(err) = stream.ack(position).await {
                warn!(position = %position, error = %err, "Failed to acknowledge change position");
                *unacked = Some(position);
            }
        }
        Ok(())
    }

    /// Sleeps unless cancelled first; returns false on cancellation.
    async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }
}
