use crate::controller::JobController;
use model::core::identifiers::JobId;
use std::{collections::HashMap, future::Future, sync::Arc};
use tokio::sync::Mutex;
use tracing::debug;

/// The job controllers live in this process, shared by every API handle.
#[derive(Clone, Default)]
pub struct JobRegistry {
    controllers: Arc<Mutex<HashMap<JobId, Arc<JobController>>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, job_id: &JobId) -> Option<Arc<JobController>> {
        self.controllers.lock().await.get(job_id).cloned()
    }

    /// Returns the live controller of `job_id`, building one with `create`
    /// when there is none. A controller that is stopping is stopped to the
    /// end before it is replaced, so a shard never has two runners.
    pub async fn get_or_try_insert<F, Fut, E>(
        &self,
        job_id: &JobId,
        create: F,
    ) -> Result<Arc<JobController>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<JobController, E>>,
    {
        loop {
            let stopping = {
                let mut controllers = self.controllers.lock().await;
                match controllers.get(job_id).cloned() {
                    Some(controller) if !controller.is_stopping() => return Ok(controller),
                    Some(controller) if !controller.is_stopped() => controller,
                    _ => {
                        let controller = Arc::new(create().await?);
                        controllers.insert(job_id.clone(), controller.clone());
                        return Ok(controller);
                    }
                }
            };
            debug!(job_id = %job_id, "Waiting for the previous controller to stop");
            stopping.stop().await;
        }
    }

    /// Forgets `controller` unless another one has replaced it meanwhile.
    pub async fn remove_if_current(&self, job_id: &JobId, controller: &Arc<JobController>) {
        let mut controllers = self.controllers.lock().await;
        if controllers.get(job_id).is_some_and(|c| Arc::ptr_eq(c, controller)) {
            controllers.remove(job_id);
        }
    }

    pub async fn drain(&self) -> Vec<Arc<JobController>> {
        self.controllers.lock().await.drain().map(|(_, c)| c).collect()
    }
}
