use crate::error::RateLimitError;
use model::job::algorithm::AlgorithmConfig;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Kind of statement a permit is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Select,
    Insert,
    Update,
    Delete,
}

/// Rate limit algorithms selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAlgorithm {
    /// Queries per second; throttles reads only.
    Qps,
    /// Transactions per second; throttles writes only.
    Tps,
}

impl RateLimitAlgorithm {
    pub const NAMES: [&'static str; 2] = ["QPS", "TPS"];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "QPS" => Some(Self::Qps),
            "TPS" => Some(Self::Tps),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Qps => "QPS",
            Self::Tps => "TPS",
        }
    }

    fn rate_prop(&self) -> &'static str {
        match self {
            Self::Qps => "qps",
            Self::Tps => "tps",
        }
    }

    pub fn applies_to(&self, op: OperationKind) -> bool {
        match self {
            Self::Qps => op == OperationKind::Select,
            Self::Tps => op != OperationKind::Select,
        }
    }
}

/// Token bucket that lets callers go into debt and wait it off, so
/// concurrent callers are served in arrival order.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            rate_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Takes `permits` and returns how long the caller must wait before using them.
    fn reserve(&mut self, permits: f64) -> Duration {
        self.refill();
        self.tokens -= permits;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate_per_sec)
        }
    }

    fn refund(&mut self, permits: f64) {
        self.tokens = (self.tokens + permits).min(self.capacity);
    }
}

/// A named throttle built from an [`AlgorithmConfig`].
#[derive(Debug)]
pub struct RateLimiter {
    algorithm: RateLimitAlgorithm,
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(algorithm: RateLimitAlgorithm, rate_per_sec: u32) -> Self {
        let rate = f64::from(rate_per_sec.max(1));
        Self {
            algorithm,
            // A single permit of burst; callers beyond that wait their turn.
            bucket: Mutex::new(TokenBucket::new(rate, 1.0)),
        }
    }

    /// Builds a limiter from `{type, props}`, e.g. `QPS` with `qps = 500`.
    pub fn from_config(config: &AlgorithmConfig) -> Result<Self, RateLimitError> {
        let algorithm = RateLimitAlgorithm::from_name(&config.type_name)
            .ok_or_else(|| RateLimitError::UnknownAlgorithm(config.type_name.clone()))?;
        let rate: u32 = config
            .parse_prop(algorithm.rate_prop())
            .map_err(RateLimitError::InvalidProps)?
            .ok_or_else(|| {
                RateLimitError::InvalidProps(format!(
                    "{} requires property '{}'",
                    algorithm.name(),
                    algorithm.rate_prop()
                ))
            })?;
        if rate == 0 {
            return Err(RateLimitError::InvalidProps(format!(
                "'{}' must be positive",
                algorithm.rate_prop()
            )));
        }
        Ok(Self::new(algorithm, rate))
    }

    pub fn algorithm(&self) -> RateLimitAlgorithm {
        self.algorithm
    }

    /// Waits until `permits` units are available for `op`.
    ///
    /// Operations the algorithm does not govern pass straight through. A
    /// pending wait returns `Cancelled` as soon as `cancel` fires and gives
    /// its reservation back.
    pub async fn acquire(
        &self,
        op: OperationKind,
        permits: u32,
        cancel: &CancellationToken,
    ) -> Result<(), RateLimitError> {
        if !self.algorithm.applies_to(op) || permits == 0 {
            return Ok(());
        }
        let permits = f64::from(permits);
        let wait = self.bucket.lock().await.reserve(permits);
        if wait.is_zero() {
            return Ok(());
        }
        debug!(algorithm = self.algorithm.name(), wait_ms = wait.as_millis() as u64, "Throttling");
        tokio::select! {
            _ = cancel.cancelled() => {
                self.bucket.lock().await.refund(permits);
                Err(RateLimitError::Cancelled)
            }
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }
}

/// Acquires from `limiter` if one is configured; no limiter means unlimited.
pub async fn throttle(
    limiter: Option<&Arc<RateLimiter>>,
    op: OperationKind,
    permits: u32,
    cancel: &CancellationToken,
) -> Result<(), RateLimitError> {
    match limiter {
        Some(limiter) => limiter.acquire(op, permits, cancel).await,
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_from_named_config() {
        let qps = RateLimiter::from_config(&AlgorithmConfig::new("qps").with_prop("qps", 10)).unwrap();
        assert_eq!(qps.algorithm(), RateLimitAlgorithm::Qps);

        assert_eq!(
            RateLimiter::from_config(&AlgorithmConfig::new("LEAKY")).unwrap_err(),
            RateLimitError::UnknownAlgorithm("LEAKY".into())
        );
        assert!(matches!(
            RateLimiter::from_config(&AlgorithmConfig::new("TPS")),
            Err(RateLimitError::InvalidProps(_))
        ));
        assert!(matches!(
            RateLimiter::from_config(&AlgorithmConfig::new("TPS").with_prop("tps", 0)),
            Err(RateLimitError::InvalidProps(_))
        ));
    }

    #[test]
    fn algorithms_govern_their_operation_kinds() {
        assert!(RateLimitAlgorithm::Qps.applies_to(OperationKind::Select));
        assert!(!RateLimitAlgorithm::Qps.applies_to(OperationKind::Insert));
        assert!(RateLimitAlgorithm::Tps.applies_to(OperationKind::Delete));
        assert!(!RateLimitAlgorithm::Tps.applies_to(OperationKind::Select));
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_throughput_stays_within_rate() {
        let limiter = RateLimiter::new(RateLimitAlgorithm::Tps, 20);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..41 {
            limiter.acquire(OperationKind::Insert, 1, &cancel).await.unwrap();
        }
        // One permit of burst, then 20 per second.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1950), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(2200), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn ungoverned_operations_are_not_throttled() {
        let limiter = RateLimiter::new(RateLimitAlgorithm::Tps, 1);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire(OperationKind::Select, 1, &cancel).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_acquire_observes_cancellation() {
        let limiter = Arc::new(RateLimiter::new(RateLimitAlgorithm::Qps, 1));
        let cancel = CancellationToken::new();
        limiter.acquire(OperationKind::Select, 1, &cancel).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(OperationKind::Select, 100, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), Err(RateLimitError::Cancelled));
    }

    #[tokio::test]
    async fn absent_limiter_is_unlimited() {
        let cancel = CancellationToken::new();
        throttle(None, OperationKind::Insert, 1_000_000, &cancel).await.unwrap();
    }
}
