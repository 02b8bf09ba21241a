use crate::error::CoordinationError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

mod sled_service;

pub use sled_service::SledCoordinationService;

/// Hierarchical key/value store with ephemeral nodes and change notification.
///
/// Paths are `/`-separated, e.g. `/pipeline/jobs/j01.../progress/0`.
#[async_trait]
pub trait CoordinationService: Send + Sync {
    async fn put_persistent(&self, path: &str, value: &str) -> Result<(), CoordinationError>;

    async fn get(&self, path: &str) -> Result<Option<String>, CoordinationError>;

    /// Deletes `path` and everything below it.
    async fn delete(&self, path: &str) -> Result<(), CoordinationError>;

    /// Names of the live direct children of `path`, sorted.
    async fn list_children(&self, path: &str) -> Result<Vec<String>, CoordinationError>;

    /// Creates or refreshes a node that disappears once `lease` passes
    /// without another registration.
    async fn register_ephemeral(
        &self,
        path: &str,
        value: &str,
        lease: Duration,
    ) -> Result<(), CoordinationError>;

    /// Resolves when something below `path` changes, or after `timeout`.
    async fn watch(&self, path: &str, timeout: Duration) -> Result<(), CoordinationError>;

    /// Waits until `path` has at least `count` live children.
    ///
    /// Returns `false` if `timeout` passes first.
    async fn wait_for_children(
        &self,
        path: &str,
        count: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool, CoordinationError> {
        let deadline = Instant::now() + timeout;
        // Leases expire silently, so re-list at least this often.
        let recheck = Duration::from_millis(200);
        loop {
            if self.list_children(path).await?.len() >= count {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(CoordinationError::Cancelled),
                res = self.watch(path, recheck.min(deadline - now)) => res?,
            }
        }
    }
}
