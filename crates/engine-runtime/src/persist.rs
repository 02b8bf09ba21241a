use engine_processing::progress::SharedProgress;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Flushes dirty shard progress of one job on a fixed interval.
pub struct PersistScheduler {
    interval: Duration,
    entries: Arc<Mutex<BTreeMap<usize, Arc<SharedProgress>>>>,
    cancel: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl PersistScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            cancel: CancellationToken::new(),
            ticker: Mutex::new(None),
        }
    }

    /// Adds a shard; the ticker starts with the first registration.
    pub async fn register(&self, shard: usize, progress: Arc<SharedProgress>) {
        self.entries.lock().await.insert(shard, progress);
        let mut ticker = self.ticker.lock().await;
        if ticker.is_none() && !self.cancel.is_cancelled() {
            *ticker = Some(self.spawn_ticker());
        }
    }

    pub async fn registered(&self) -> Vec<usize> {
        self.entries.lock().await.keys().copied().collect()
    }

    fn spawn_ticker(&self) -> JoinHandle<()> {
        let entries = self.entries.clone();
        let cancel = self.cancel.clone();
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => flush(&entries).await,
                }
            }
        })
    }

    /// Stops the ticker, flushes one last time and hands back every
    /// registered shard's progress.
    pub async fn shutdown(&self) -> Vec<Arc<SharedProgress>> {
        self.cancel.cancel();
        if let Some(ticker) = self.ticker.lock().await.take()
            && let Err(e) = ticker.await
        {
            warn!(error = %e, "Progress ticker ended abnormally");
        }
        flush(&self.entries).await;
        let drained = std::mem::take(&mut *self.entries.lock().await);
        drained.into_values().collect()
    }
}

async fn flush(entries: &Mutex<BTreeMap<usize, Arc<SharedProgress>>>) {
    let snapshot: Vec<_> = entries.lock().await.values().cloned().collect();
    for progress in snapshot {
        match progress.persist_if_dirty().await {
            Ok(true) => debug!(job_id = %progress.job_id(), shard = progress.shard(), "Progress flushed"),
            Ok(false) => {}
            Err(e) => warn!(
                job_id = %progress.job_id(),
                shard = progress.shard(),
                error = %e,
                "Failed to persist progress"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_core::{coordination::SledCoordinationService, repository::PipelineRepository};
    use model::{
        core::identifiers::JobId,
        job::{datasource::DatabaseKind, progress::JobItemProgress},
        pagination::position::LogPosition,
    };

    #[tokio::test]
    async fn dirty_progress_is_flushed_on_the_interval() {
        let repo = PipelineRepository::new(Arc::new(SledCoordinationService::temporary().unwrap()));
        let progress = Arc::new(SharedProgress::new(
            repo.clone(),
            JobId::new("j01sched"),
            0,
            JobItemProgress::new(Some(DatabaseKind::Memory)),
        ));
        let scheduler = PersistScheduler::new(Duration::from_millis(10));
        scheduler.register(0, progress.clone()).await;

        progress.record_incremental(LogPosition(4), 4).await;
        let mut stored = None;
        for _ in 0..100 {
            stored = repo.load_progress(&JobId::new("j01sched"), 0).await.unwrap();
            if stored.is_some() {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(stored.map(|p| p.processed_records), Some(4));

        let drained = scheduler.shutdown().await;
        assert_eq!(drained.len(), 1);
        assert!(scheduler.registered().await.is_empty());
    }
}
