mod connection;
mod database;

pub use connection::MemoryConnection;
pub use database::MemoryDatabase;

use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

/// Named in-memory databases, addressed by `memory://<name>` URLs.
#[derive(Debug, Default, Clone)]
pub struct MemoryRegistry {
    databases: Arc<Mutex<HashMap<String, Arc<MemoryDatabase>>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the database called `name`, creating it if needed.
    pub async fn database(&self, name: &str) -> Arc<MemoryDatabase> {
        let mut databases = self.databases.lock().await;
        databases
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryDatabase::new(name)))
            .clone()
    }

    pub fn name_from_url(url: &str) -> Option<&str> {
        url.strip_prefix("memory://")
            .map(|rest| rest.split(['/', '?']).next().unwrap_or(rest))
            .filter(|name| !name.is_empty())
    }
}
