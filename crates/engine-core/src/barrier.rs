use crate::{coordination::CoordinationService, error::CoordinationError};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BARRIER_ROOT: &str = "/pipeline/barrier";
const MIN_LEASE: Duration = Duration::from_millis(30);

/// Per-job readiness barrier over the coordination service.
///
/// Each shard registers an ephemeral marker once it is caught up. Markers
/// are kept alive by a heartbeat and vanish when their owner stops
/// refreshing them.
#[derive(Clone)]
pub struct CoordinationBarrier {
    service: Arc<dyn CoordinationService>,
    lease: Duration,
}

impl CoordinationBarrier {
    pub fn new(service: Arc<dyn CoordinationService>, lease: Duration) -> Self {
        Self {
            service,
            lease: lease.max(MIN_LEASE),
        }
    }

    pub fn job_path(job_id: &str) -> String {
        format!("{BARRIER_ROOT}/{job_id}")
    }

    pub fn marker_path(job_id: &str, shard: usize) -> String {
        format!("{BARRIER_ROOT}/{job_id}/{shard}")
    }

    /// Registers the readiness marker of `shard` and keeps it alive until
    /// the returned handle is released or dropped.
    pub async fn register(
        &self,
        job_id: &str,
        shard: usize,
    ) -> Result<BarrierMarker, CoordinationError> {
        let path = Self::marker_path(job_id, shard);
        let marker = BarrierMarker::hold(self.service.clone(), path, "ready", self.lease).await?;
        info!(job_id, shard, "Registered readiness marker");
        Ok(marker)
    }

    /// Number of shards of `job_id` currently marked ready.
    pub async fn ready_count(&self, job_id: &str) -> Result<usize, CoordinationError> {
        Ok(self.service.list_children(&Self::job_path(job_id)).await?.len())
    }

    /// Waits until `sharding_count` markers are present for `job_id`.
    pub async fn await_ready(
        &self,
        job_id: &str,
        sharding_count: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool, CoordinationError> {
        let ready = self
            .service
            .wait_for_children(&Self::job_path(job_id), sharding_count, timeout, cancel)
            .await?;
        debug!(job_id, sharding_count, ready, "Barrier wait finished");
        Ok(ready)
    }

    /// Removes every marker of `job_id`.
    pub async fn clear(&self, job_id: &str) -> Result<(), CoordinationError> {
        self.service.delete(&Self::job_path(job_id)).await
    }
}

/// Live ephemeral marker. Dropping it stops the heartbeat and lets the
/// lease run out; [`BarrierMarker::release`] removes it right away.
pub struct BarrierMarker {
    service: Arc<dyn CoordinationService>,
    path: String,
    heartbeat: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl BarrierMarker {
    /// Registers an ephemeral node at `path` and refreshes it every third
    /// of `lease` until the marker is released or dropped.
    pub async fn hold(
        service: Arc<dyn CoordinationService>,
        path: String,
        value: &str,
        lease: Duration,
    ) -> Result<Self, CoordinationError> {
        let lease = lease.max(MIN_LEASE);
        service.register_ephemeral(&path, value, lease).await?;

        let heartbeat = CancellationToken::new();
        let task = {
            let service = service.clone();
            let path = path.clone();
            let value = value.to_string();
            let heartbeat = heartbeat.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(lease / 3);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = heartbeat.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = service.register_ephemeral(&path, &value, lease).await {
                                warn!(path = %path, error = %e, "Failed to refresh marker");
                            }
                        }
                    }
                }
            })
        };

        Ok(Self {
            service,
            path,
            heartbeat,
            task: Some(task),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn release(mut self) -> Result<(), CoordinationError> {
        self.heartbeat.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.service.delete(&self.path).await?;
        debug!(path = %self.path, "Released marker");
        Ok(())
    }
}

impl Drop for BarrierMarker {
    fn drop(&mut self) {
        self.heartbeat.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::SledCoordinationService;

    fn barrier(lease: Duration) -> CoordinationBarrier {
        let service: Arc<dyn CoordinationService> =
            Arc::new(SledCoordinationService::temporary().unwrap());
        CoordinationBarrier::new(service, lease)
    }

    #[tokio::test]
    async fn waits_for_every_shard() {
        let barrier = barrier(Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let _m0 = barrier.register("j1", 0).await.unwrap();
        assert!(!barrier
            .await_ready("j1", 2, Duration::from_millis(50), &cancel)
            .await
            .unwrap());

        let _m1 = barrier.register("j1", 1).await.unwrap();
        assert!(barrier
            .await_ready("j1", 2, Duration::from_secs(1), &cancel)
            .await
            .unwrap());
        assert_eq!(barrier.ready_count("j1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn heartbeat_outlives_the_lease() {
        let barrier = barrier(Duration::from_millis(90));
        let _marker = barrier.register("j1", 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(barrier.ready_count("j1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dropped_marker_expires() {
        let barrier = barrier(Duration::from_millis(60));
        let marker = barrier.register("j1", 0).await.unwrap();
        drop(marker);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(barrier.ready_count("j1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn release_and_clear_remove_markers() {
        let barrier = barrier(Duration::from_secs(5));
        let marker = barrier.register("j1", 0).await.unwrap();
        let _other = barrier.register("j1", 1).await.unwrap();
        marker.release().await.unwrap();
        assert_eq!(barrier.ready_count("j1").await.unwrap(), 1);

        barrier.clear("j1").await.unwrap();
        assert_eq!(barrier.ready_count("j1").await.unwrap(), 0);
    }
}
