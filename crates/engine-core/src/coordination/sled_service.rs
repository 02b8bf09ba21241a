use crate::{coordination::CoordinationService, error::CoordinationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, path::Path, time::Duration};
use tracing::{debug, info};

/// Stored form of a node; ephemeral nodes carry a lease deadline.
#[derive(Debug, Serialize, Deserialize)]
struct StoredNode {
    value: String,
    lease_until_millis: Option<i64>,
}

impl StoredNode {
    fn is_live(&self, now_millis: i64) -> bool {
        self.lease_until_millis.is_none_or(|until| until > now_millis)
    }
}

/// Coordination service backed by a local sled database.
///
/// Ephemeral nodes from a previous process are purged on open, and nodes
/// whose lease has expired are treated as absent.
pub struct SledCoordinationService {
    db: sled::Db,
}

impl SledCoordinationService {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoordinationError> {
        let db = sled::open(path)?;
        let service = Self { db };
        let purged = service.purge_ephemeral()?;
        if purged > 0 {
            info!(purged, "Removed ephemeral nodes left by a previous process");
        }
        Ok(service)
    }

    /// In-memory instance, for tests and one-shot tools.
    pub fn temporary() -> Result<Self, CoordinationError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Blocks until every write so far is durable.
    pub fn flush(&self) -> Result<(), CoordinationError> {
        self.db.flush()?;
        Ok(())
    }

    fn validate(path: &str) -> Result<(), CoordinationError> {
        if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) {
            return Err(CoordinationError::InvalidPath(path.to_string()));
        }
        Ok(())
    }

    fn child_prefix(path: &str) -> String {
        if path == "/" {
            path.to_string()
        } else {
            format!("{path}/")
        }
    }

    fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn decode(bytes: &[u8]) -> Result<StoredNode, CoordinationError> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn purge_ephemeral(&self) -> Result<usize, CoordinationError> {
        let mut purged = 0;
        for item in self.db.iter() {
            let (key, value) = item?;
            if Self::decode(&value)?.lease_until_millis.is_some() {
                self.db.remove(key)?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn write(&self, path: &str, node: &StoredNode) -> Result<(), CoordinationError> {
        Self::validate(path)?;
        let bytes = bincode::serialize(node)?;
        self.db.insert(path.as_bytes(), bytes)?;
        Ok(())
    }
}

#[async_trait]
impl CoordinationService for SledCoordinationService {
    async fn put_persistent(&self, path: &str, value: &str) -> Result<(), CoordinationError> {
        self.write(
            path,
            &StoredNode {
                value: value.to_string(),
                lease_until_millis: None,
            },
        )
    }

    async fn get(&self, path: &str) -> Result<Option<String>, CoordinationError> {
        Self::validate(path)?;
        match self.db.get(path.as_bytes())? {
            Some(bytes) => {
                let node = Self::decode(&bytes)?;
                Ok(node.is_live(Self::now_millis()).then_some(node.value))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinationError> {
        Self::validate(path)?;
        self.db.remove(path.as_bytes())?;
        let prefix = Self::child_prefix(path);
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            self.db.remove(key)?;
        }
        debug!(path, "Deleted coordination subtree");
        Ok(())
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        Self::validate(path)?;
        let prefix = Self::child_prefix(path);
        let now = Self::now_millis();
        let mut children = BTreeSet::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key);
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            let (child, is_leaf) = match rest.split_once('/') {
                Some((child, _)) => (child, false),
                None => (rest, true),
            };
            if child.is_empty() {
                continue;
            }
            // Interior nodes are live as long as anything below them is.
            if is_leaf && !Self::decode(&value)?.is_live(now) {
                continue;
            }
            children.insert(child.to_string());
        }
        Ok(children.into_iter().collect())
    }

    async fn register_ephemeral(
        &self,
        path: &str,
        value: &str,
        lease: Duration,
    ) -> Result<(), CoordinationError> {
        self.write(
            path,
            &StoredNode {
                value: value.to_string(),
                lease_until_millis: Some(Self::now_millis() + lease.as_millis() as i64),
            },
        )
    }

    async fn watch(&self, path: &str, timeout: Duration) -> Result<(), CoordinationError> {
        Self::validate(path)?;
        let subscriber = self.db.watch_prefix(path.as_bytes());
        // Either an event or the timeout ends the wait.
        let _ = tokio::time::timeout(timeout, subscriber).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn persistent_nodes_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let svc = SledCoordinationService::open(dir.path()).unwrap();
            svc.put_persistent("/pipeline/jobs/j1/config", "{}").await.unwrap();
            svc.register_ephemeral("/pipeline/barrier/j1/0", "", Duration::from_secs(60))
                .await
                .unwrap();
            svc.flush().unwrap();
        }
        let svc = SledCoordinationService::open(dir.path()).unwrap();
        assert_eq!(
            svc.get("/pipeline/jobs/j1/config").await.unwrap().as_deref(),
            Some("{}")
        );
        assert!(svc.list_children("/pipeline/barrier/j1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lists_direct_children_once() {
        let svc = SledCoordinationService::temporary().unwrap();
        svc.put_persistent("/jobs/a/config", "1").await.unwrap();
        svc.put_persistent("/jobs/a/progress/0", "2").await.unwrap();
        svc.put_persistent("/jobs/b/config", "3").await.unwrap();
        svc.put_persistent("/jobsx/c", "4").await.unwrap();
        assert_eq!(svc.list_children("/jobs").await.unwrap(), vec!["a", "b"]);
        assert_eq!(
            svc.list_children("/jobs/a").await.unwrap(),
            vec!["config", "progress"]
        );
    }

    #[tokio::test]
    async fn delete_removes_subtree() {
        let svc = SledCoordinationService::temporary().unwrap();
        svc.put_persistent("/jobs/a/config", "1").await.unwrap();
        svc.put_persistent("/jobs/a/progress/0", "2").await.unwrap();
        svc.put_persistent("/jobs/ab/config", "3").await.unwrap();
        svc.delete("/jobs/a").await.unwrap();
        assert_eq!(svc.list_children("/jobs").await.unwrap(), vec!["ab"]);
        assert!(svc.get("/jobs/a/config").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_leases_are_invisible() {
        let svc = SledCoordinationService::temporary().unwrap();
        svc.register_ephemeral("/barrier/j/0", "", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(svc.get("/barrier/j/0").await.unwrap().is_none());
        assert!(svc.list_children("/barrier/j").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wait_for_children_wakes_on_registration() {
        let svc = Arc::new(SledCoordinationService::temporary().unwrap());
        let cancel = CancellationToken::new();
        let waiter = {
            let svc = svc.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                svc.wait_for_children("/barrier/j", 2, Duration::from_secs(5), &cancel)
                    .await
            })
        };
        for shard in 0..2 {
            svc.register_ephemeral(&format!("/barrier/j/{shard}"), "", Duration::from_secs(5))
                .await
                .unwrap();
        }
        assert!(waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn wait_for_children_times_out_and_cancels() {
        let svc = SledCoordinationService::temporary().unwrap();
        let cancel = CancellationToken::new();
        let ready = svc
            .wait_for_children("/barrier/j", 1, Duration::from_millis(50), &cancel)
            .await
            .unwrap();
        assert!(!ready);

        cancel.cancel();
        let err = svc
            .wait_for_children("/barrier/j", 1, Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Cancelled));
    }

    #[test]
    fn rejects_relative_paths() {
        assert!(SledCoordinationService::validate("jobs/a").is_err());
        assert!(SledCoordinationService::validate("/jobs/a/").is_err());
        assert!(SledCoordinationService::validate("/").is_ok());
    }
}
