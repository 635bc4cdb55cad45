//! Consecutive-failure circuit breaker for the processing loop.

use std::time::Duration;

use common::config::CircuitBreakerConfig;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    reset_timeout: Duration,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            threshold: config.failure_threshold.max(1),
            reset_timeout: config.reset_timeout,
            consecutive_failures: 0,
            last_failure: None,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_failure = None;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(now);
        if self.consecutive_failures == self.threshold {
            tracing::warn!(
                failures = self.consecutive_failures,
                reset_timeout = ?self.reset_timeout,
                "Circuit breaker opened, pausing job processing"
            );
        }
    }

    /// When the breaker will close, if it is open at `now`. An expired
    /// breaker closes here and forgets its failures.
    pub fn open_until(&mut self, now: Instant) -> Option<Instant> {
        if self.consecutive_failures < self.threshold {
            return None;
        }
        let reopen = self.last_failure? + self.reset_timeout;
        if now < reopen {
            return Some(reopen);
        }
        tracing::info!("Circuit breaker closed, resuming job processing");
        self.record_success();
        None
    }

    pub fn is_open(&mut self, now: Instant) -> bool {
        self.open_until(now).is_some()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(&CircuitBreakerConfig::default())
    }

    #[test]
    fn test_opens_after_threshold_and_closes_after_timeout() {
        let start = Instant::now();
        let mut breaker = breaker();
        for _ in 0..4 {
            breaker.record_failure(start);
        }
        assert!(!breaker.is_open(start));

        breaker.record_failure(start);
        assert!(breaker.is_open(start));
        assert!(breaker.is_open(start + Duration::from_secs(29)));
        assert_eq!(
            breaker.open_until(start),
            Some(start + Duration::from_secs(30))
        );

        assert!(!breaker.is_open(start + Duration::from_secs(30)));
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn test_success_resets_the_count() {
        let now = Instant::now();
        let mut breaker = breaker();
        for _ in 0..4 {
            breaker.record_failure(now);
        }
        breaker.record_success();
        breaker.record_failure(now);
        assert!(!breaker.is_open(now));
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[test]
    fn test_window_runs_from_the_last_failure() {
        let start = Instant::now();
        let mut breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure(start);
        }
        let later = start + Duration::from_secs(10);
        breaker.record_failure(later);
        assert_eq!(
            breaker.open_until(later),
            Some(later + Duration::from_secs(30))
        );
    }
}
