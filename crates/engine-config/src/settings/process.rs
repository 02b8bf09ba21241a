use crate::settings::error::SettingsError;
use engine_core::rate_limit::RateLimiter;
use model::job::algorithm::AlgorithmConfig;
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use tracing::{info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_SHARDING_SIZE: u64 = 10_000_000;

/// Source-side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadConfiguration {
    /// Inventory units copied at once across all shards of this process.
    pub worker_threads: usize,
    /// Rows per inventory page.
    pub batch_size: usize,
    /// Rows of integer key range per inventory unit.
    pub sharding_size: u64,
    pub rate_limiter: Option<AlgorithmConfig>,
}

impl Default for ReadConfiguration {
    fn default() -> Self {
        Self {
            worker_threads: 20,
            batch_size: DEFAULT_BATCH_SIZE,
            sharding_size: DEFAULT_SHARDING_SIZE,
            rate_limiter: None,
        }
    }
}

/// Target-side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfiguration {
    /// Rows per write statement.
    pub batch_size: usize,
    pub rate_limiter: Option<AlgorithmConfig>,
}

impl Default for WriteConfiguration {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            rate_limiter: None,
        }
    }
}

/// Process-wide pipeline settings. Persisted, alterable at runtime and
/// re-read at every job start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfiguration {
    pub read: ReadConfiguration,
    pub write: WriteConfiguration,
    /// Change events pulled from the stream per poll.
    pub stream_channel_capacity: usize,
    pub progress_persist_interval_ms: u64,
    pub incremental_idle_interval_ms: u64,
    pub barrier_lease_ms: u64,
    /// Default rows per consistency check chunk.
    pub check_chunk_size: usize,
}

impl Default for ProcessConfiguration {
    fn default() -> Self {
        Self {
            read: ReadConfiguration::default(),
            write: WriteConfiguration::default(),
            stream_channel_capacity: 2000,
            progress_persist_interval_ms: 1000,
            incremental_idle_interval_ms: 100,
            barrier_lease_ms: 10_000,
            check_chunk_size: 1000,
        }
    }
}

impl ProcessConfiguration {
    pub fn with_read_batch_size(mut self, batch_size: usize) -> Self {
        self.read.batch_size = batch_size;
        self
    }

    pub fn with_write_batch_size(mut self, batch_size: usize) -> Self {
        self.write.batch_size = batch_size;
        self
    }

    pub fn with_sharding_size(mut self, sharding_size: u64) -> Self {
        self.read.sharding_size = sharding_size;
        self
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.read.worker_threads = worker_threads;
        self
    }

    pub fn with_read_rate_limiter(mut self, limiter: AlgorithmConfig) -> Self {
        self.read.rate_limiter = Some(limiter);
        self
    }

    pub fn with_write_rate_limiter(mut self, limiter: AlgorithmConfig) -> Self {
        self.write.rate_limiter = Some(limiter);
        self
    }

    pub fn with_progress_persist_interval(mut self, interval: Duration) -> Self {
        self.progress_persist_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_incremental_idle_interval(mut self, interval: Duration) -> Self {
        self.incremental_idle_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_barrier_lease(mut self, lease: Duration) -> Self {
        self.barrier_lease_ms = lease.as_millis() as u64;
        self
    }

    pub fn with_check_chunk_size(mut self, chunk_size: usize) -> Self {
        self.check_chunk_size = chunk_size;
        self
    }

    pub fn progress_persist_interval(&self) -> Duration {
        Duration::from_millis(self.progress_persist_interval_ms)
    }

    pub fn incremental_idle_interval(&self) -> Duration {
        Duration::from_millis(self.incremental_idle_interval_ms)
    }

    pub fn barrier_lease(&self) -> Duration {
        Duration::from_millis(self.barrier_lease_ms)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every setting and reports all problems at once.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let mut errors = Vec::new();

        if self.read.batch_size == 0 {
            errors.push("read.batch_size must be positive".to_string());
        }
        if self.write.batch_size == 0 {
            errors.push("write.batch_size must be positive".to_string());
        }
        if self.read.sharding_size == 0 {
            errors.push("read.sharding_size must be positive".to_string());
        }
        if self.read.worker_threads == 0 {
            errors.push("read.worker_threads must be positive".to_string());
        }
        if self.stream_channel_capacity == 0 {
            errors.push("stream_channel_capacity must be positive".to_string());
        }
        if self.check_chunk_size == 0 {
            errors.push("check_chunk_size must be positive".to_string());
        }
        if self.progress_persist_interval_ms == 0 {
            errors.push("progress_persist_interval_ms must be positive".to_string());
        }
        if self.barrier_lease_ms < 30 {
            errors.push("barrier_lease_ms must be at least 30".to_string());
        }
        for (side, limiter) in [
            ("read", &self.read.rate_limiter),
            ("write", &self.write.rate_limiter),
        ] {
            if let Some(config) = limiter
                && let Err(e) = RateLimiter::from_config(config)
            {
                errors.push(format!("{side}.rate_limiter: {e}"));
            }
        }

        if self.read.batch_size > 100_000 || self.write.batch_size > 100_000 {
            warn!(
                read = self.read.batch_size,
                write = self.write.batch_size,
                "Batch size is very large, may cause memory issues"
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SettingsError::ValidationFailed(errors))
        }
    }

    /// Applies one `key = value` change, e.g. `read.batch_size = 500` or
    /// `write.rate_limiter = TPS:200`. A limiter value of `none` removes it.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        let value = value.trim();
        match key {
            "read.worker_threads" => self.read.worker_threads = parse_number(key, value)?,
            "read.batch_size" => self.read.batch_size = parse_number(key, value)?,
            "read.sharding_size" => self.read.sharding_size = parse_number(key, value)?,
            "read.rate_limiter" => self.read.rate_limiter = parse_limiter(value)?,
            "write.batch_size" => self.write.batch_size = parse_number(key, value)?,
            "write.rate_limiter" => self.write.rate_limiter = parse_limiter(value)?,
            "stream_channel_capacity" => self.stream_channel_capacity = parse_number(key, value)?,
            "progress_persist_interval_ms" => {
                self.progress_persist_interval_ms = parse_number(key, value)?
            }
            "incremental_idle_interval_ms" => {
                self.incremental_idle_interval_ms = parse_number(key, value)?
            }
            "barrier_lease_ms" => self.barrier_lease_ms = parse_number(key, value)?,
            "check_chunk_size" => self.check_chunk_size = parse_number(key, value)?,
            other => return Err(SettingsError::UnknownSetting(other.to_string())),
        }
        info!(key, value, "Process setting changed");
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SettingsError> {
    value
        .parse()
        .map_err(|_| SettingsError::ValidationFailed(vec![format!("{key}: '{value}' is not a number")]))
}

/// `QPS:500` becomes `{type: QPS, props: {qps: 500}}`.
fn parse_limiter(value: &str) -> Result<Option<AlgorithmConfig>, SettingsError> {
    if value.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let (type_name, rate) = value
        .split_once(':')
        .ok_or_else(|| SettingsError::ValidationFailed(vec![format!("rate limiter '{value}' must look like TYPE:rate")]))?;
    let type_name = type_name.trim().to_ascii_uppercase();
    let config = AlgorithmConfig::new(&type_name).with_prop(&type_name.to_ascii_lowercase(), rate.trim());
    RateLimiter::from_config(&config)?;
    Ok(Some(config))
}
