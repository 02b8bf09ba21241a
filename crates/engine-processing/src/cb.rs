use std::time::Duration;

/// Counts consecutive failures of a long-running loop, such as change
/// stream polling, and trips once the retry budget is spent.
#[derive(Clone, Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    consecutive_failures: u32,
    base_delay: Duration,
    max_delay: Duration,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CircuitBreakerState {
    RetryAfter(Duration),
    Open,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: 0,
            base_delay,
            max_delay: if max_delay.is_zero() {
                base_delay
            } else {
                max_delay
            },
        }
    }

    /// Allows `retry_times` retries in a row; the next failure opens the breaker.
    pub fn from_retry_times(retry_times: u32, base_delay: Duration) -> Self {
        Self::new(retry_times.saturating_add(1), base_delay, Duration::from_secs(30))
    }

    pub fn record_failure(&mut self) -> CircuitBreakerState {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.is_open() {
            CircuitBreakerState::Open
        } else {
            CircuitBreakerState::RetryAfter(self.delay_for(self.consecutive_failures))
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn is_open(&self) -> bool {
        self.consecutive_failures >= self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn delay_for(&self, failures: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = failures.saturating_sub(1).min(6);
        let delay = self.base_delay.saturating_mul(1 << exponent);
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_retry_budget() {
        let mut cb = CircuitBreaker::from_retry_times(2, Duration::from_millis(10));
        assert_eq!(
            cb.record_failure(),
            CircuitBreakerState::RetryAfter(Duration::from_millis(10))
        );
        assert_eq!(
            cb.record_failure(),
            CircuitBreakerState::RetryAfter(Duration::from_millis(20))
        );
        assert_eq!(cb.record_failure(), CircuitBreakerState::Open);
        assert!(cb.is_open());
    }

    #[test]
    fn success_resets_the_count() {
        let mut cb = CircuitBreaker::from_retry_times(1, Duration::ZERO);
        assert_eq!(cb.record_failure(), CircuitBreakerState::RetryAfter(Duration::ZERO));
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        assert_eq!(cb.record_failure(), CircuitBreakerState::RetryAfter(Duration::ZERO));
        assert_eq!(cb.record_failure(), CircuitBreakerState::Open);
    }
}
